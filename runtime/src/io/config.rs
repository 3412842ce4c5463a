//! Runtime configuration stored in `effects.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::transport::GenerationParams;
use crate::sandbox::SandboxLimits;

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "effects.toml";

/// Runtime configuration (TOML).
///
/// Every field has a default, so an empty or missing file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub generator: GeneratorConfig,
    pub generation: GenerationConfig,
    pub sandbox: SandboxConfig,
    pub mount: MountConfig,
}

/// The external command that streams generated code on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Program and arguments (e.g. `["llm","--model","gemini-2.0-flash"]`).
    pub command: Vec<String>,
    /// Wall-clock limit for one generation, in seconds.
    pub timeout_secs: u64,
    /// Abort the generation once stdout exceeds this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "llm".to_string(),
                "--model".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            timeout_secs: 120,
            output_limit_bytes: 256 * 1024,
        }
    }
}

/// Sampling parameters handed to the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_k: 32,
            top_p: 0.95,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    /// Budget for a single call into effect code, in milliseconds.
    pub call_budget_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            memory_limit_bytes: limits.memory_limit_bytes,
            max_stack_bytes: limits.max_stack_bytes,
            call_budget_ms: u64::try_from(limits.call_budget.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Size of the container effects render into, in CSS pixels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MountConfig {
    pub width: f64,
    pub height: f64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            width: 800.0,
            height: 600.0,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            return Err(anyhow!("generation.temperature must be within 0.0..=2.0"));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(anyhow!("generation.top_p must be within (0.0, 1.0]"));
        }
        if generation.top_k == 0 {
            return Err(anyhow!("generation.top_k must be > 0"));
        }
        if generation.max_output_tokens == 0 {
            return Err(anyhow!("generation.max_output_tokens must be > 0"));
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(anyhow!("sandbox.memory_limit_bytes must be > 0"));
        }
        if self.sandbox.max_stack_bytes == 0 {
            return Err(anyhow!("sandbox.max_stack_bytes must be > 0"));
        }
        if self.sandbox.call_budget_ms == 0 {
            return Err(anyhow!("sandbox.call_budget_ms must be > 0"));
        }
        let dimensions = [
            ("mount.width", self.mount.width),
            ("mount.height", self.mount.height),
        ];
        for (name, value) in dimensions {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow!("{name} must be a positive number"));
            }
        }
        Ok(())
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator.timeout_secs)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.generation.temperature,
            top_k: self.generation.top_k,
            top_p: self.generation.top_p,
            max_output_tokens: self.generation.max_output_tokens,
        }
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            memory_limit_bytes: self.sandbox.memory_limit_bytes,
            max_stack_bytes: self.sandbox.max_stack_bytes,
            call_budget: Duration::from_millis(self.sandbox.call_budget_ms),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RuntimeConfig::default()`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        let cfg = RuntimeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("effects.toml");
        let mut cfg = RuntimeConfig::default();
        cfg.generator.command = vec!["cat".to_string()];
        cfg.mount.width = 320.0;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    /// Sections left out of the file keep their defaults.
    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("effects.toml");
        fs::write(&path, "[generation]\ntemperature = 0.9\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.generation.temperature, 0.9);
        assert_eq!(cfg.generation.top_k, 32);
        assert_eq!(cfg.generator, GeneratorConfig::default());
    }

    #[test]
    fn defaults_match_generation_settings() {
        let params = RuntimeConfig::default().generation_params();
        assert_eq!(params.temperature, 0.4);
        assert_eq!(params.top_k, 32);
        assert_eq!(params.top_p, 0.95);
        assert_eq!(params.max_output_tokens, 2048);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.generator.command = vec![" ".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.generation.top_p = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.mount.height = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.sandbox.call_budget_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sandbox_limits_follow_config() {
        let mut cfg = RuntimeConfig::default();
        cfg.sandbox.call_budget_ms = 75;
        assert_eq!(cfg.sandbox_limits().call_budget, Duration::from_millis(75));
    }
}
