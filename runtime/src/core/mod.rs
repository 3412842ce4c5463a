//! Deterministic, pure logic shared by the effect runtime.
//!
//! Core modules must be free of I/O side effects and never run generated code.
//! They operate on text and small value types and return deterministic outputs
//! suitable for tests.

pub mod accumulator;
pub mod lifecycle;
pub mod normalizer;
pub mod types;
pub mod validator;
