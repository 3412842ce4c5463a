//! Shared value types for the effect runtime core.
//!
//! These types carry generated code between the pipeline stages and describe
//! the supervisor's state to observers. They hold no handles to live effects.

use std::fmt;

use serde::Serialize;

use crate::core::validator::ContractViolation;

/// Raw text produced by the generator for one request.
///
/// Never edited in place: normalization produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectSource(String);

impl EffectSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Effect text after fence stripping and teardown repair.
///
/// Only [`crate::core::normalizer`] constructs this type, so holding one means
/// the text contains no fence markers. It is still unvalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEffectSource(String);

impl NormalizedEffectSource {
    pub(crate) fn from_normalized(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier assigned to each effect handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EffectId(pub u64);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "effect-{}", self.0)
    }
}

/// User-visible reason for a `Failed` runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The generation stream failed; partial output was discarded.
    Transport(String),
    /// The generated code did not satisfy the effect contract.
    Contract(ContractViolation),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(message) => write!(f, "generation failed: {message}"),
            FailureReason::Contract(violation) => write!(f, "{violation}"),
        }
    }
}

/// Observable projection of the supervisor's runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Idle,
    Generating,
    Mounting,
    Mounted {
        effect: EffectId,
        /// The effect faulted before adding anything to the mount.
        execution_failed: bool,
    },
    Failed(FailureReason),
}

impl RuntimeStatus {
    /// True while a request is in flight (`Generating` or `Mounting`).
    pub fn is_busy(&self) -> bool {
        matches!(self, RuntimeStatus::Generating | RuntimeStatus::Mounting)
    }
}
