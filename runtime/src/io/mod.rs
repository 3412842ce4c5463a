//! Side-effecting collaborators: configuration, prompts and the generator process.

pub mod config;
pub mod process;
pub mod prompt;
pub mod transport;
