//! Runtime for generated, sandboxed visual effects.
//!
//! A user describes an effect; a generator streams JavaScript back; the
//! runtime repairs and checks the text, mounts it in an isolated script realm
//! and guarantees the previous effect is gone before the next one starts.
//!
//! - **[`core`]**: Pure logic (accumulation, normalization, contract checks,
//!   lifecycle table). No I/O and no script execution.
//! - **[`mount`]**: The container effects draw into, plus its callback scheduler.
//! - **[`sandbox`]**: Guarded execution of effect code and teardown handles.
//! - **[`io`]**: Configuration, prompt templates and the generator process.
//!
//! [`supervisor`] ties them together; [`check`] and [`play`] implement the CLI
//! commands on top of it.

pub mod check;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mount;
pub mod play;
pub mod sandbox;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
