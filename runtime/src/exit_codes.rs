//! Stable exit codes for effect-runtime CLI commands.

/// Command succeeded; the effect passed its checks or was mounted.
pub const OK: i32 = 0;
/// Invalid input, config or prompt, or any other error.
pub const INVALID: i32 = 1;
/// The effect source failed the contract checks.
pub const REJECTED: i32 = 2;
/// The generator failed, timed out or produced too much output.
pub const TRANSPORT: i32 = 3;
