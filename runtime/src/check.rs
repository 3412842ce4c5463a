//! Static checks for `effect-runtime check`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::normalizer::normalize_with_report;
use crate::core::types::EffectSource;
use crate::core::validator::{ContractViolation, validate_contract};
use crate::exit_codes;

/// What normalization and validation made of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub bytes: usize,
    pub fences_stripped: usize,
    pub teardown_rewrites: usize,
    pub violation: Option<ContractViolation>,
    /// The text that would be executed.
    pub normalized: String,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.violation.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            exit_codes::OK
        } else {
            exit_codes::REJECTED
        }
    }
}

/// Normalize and validate `source` without running it.
pub fn check_source(source: &EffectSource) -> CheckReport {
    let normalized = normalize_with_report(source);
    CheckReport {
        bytes: source.len(),
        fences_stripped: normalized.fences_stripped,
        teardown_rewrites: normalized.teardown_rewrites,
        violation: validate_contract(&normalized.source).err(),
        normalized: normalized.source.as_str().to_string(),
    }
}

/// Read an effect file from disk.
pub fn read_source(path: &Path) -> Result<EffectSource> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(EffectSource::new(text))
}

pub fn check_file(path: &Path) -> Result<CheckReport> {
    Ok(check_source(&read_source(path)?))
}
