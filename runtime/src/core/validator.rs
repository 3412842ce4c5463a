//! Static contract checks on normalized effect code.
//!
//! The checks are textual guards, not a parse. They may reject code a parser
//! would accept, but any text they accept contains both contract anchors.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::core::types::NormalizedEffectSource;

/// Name of the function every effect must declare.
pub const ENTRY_POINT: &str = "createAnimation";
/// Name of the teardown function the entry point must return.
pub const TEARDOWN_FUNCTION: &str = "cleanup";

static ENTRY_POINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bfunction\s+{ENTRY_POINT}\s*\(")).unwrap());

static TEARDOWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\breturn\s+function\s+{TEARDOWN_FUNCTION}\s*\(\s*\)")).unwrap()
});

/// Reason generated code was rejected before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ContractViolation {
    #[error("generated code does not define `function createAnimation(container)`")]
    MissingEntryPoint,
    #[error("generated code does not return `function cleanup() {{ ... }}`")]
    MissingTeardownIdiom,
}

/// Check `source` against the effect contract, stopping at the first failure.
pub fn validate_contract(source: &NormalizedEffectSource) -> Result<(), ContractViolation> {
    let text = source.as_str();
    if !ENTRY_POINT_RE.is_match(text) {
        return Err(ContractViolation::MissingEntryPoint);
    }
    if !TEARDOWN_RE.is_match(text) {
        return Err(ContractViolation::MissingTeardownIdiom);
    }
    Ok(())
}
