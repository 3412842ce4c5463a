//! Generation transport: the seam between the supervisor and the code generator.
//!
//! The [`GenerationTransport`] trait decouples the lifecycle from the actual
//! generator backend. [`CommandTransport`] runs an external command that
//! streams the generated code on stdout. Tests use scripted transports that
//! replay predetermined fragments without spawning processes.

use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::config::RuntimeConfig;
use crate::io::process::{spawn_piped, stream_child};

/// Sampling parameters for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

/// Everything the generator needs for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Instructions describing the effect contract.
    pub system: String,
    /// The rendered user request.
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// System and user prompt joined into the text written to the generator.
    pub fn combined_prompt(&self) -> String {
        format!("{}\n\n{}\n", self.system.trim_end(), self.prompt.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to start generator: {0}")]
    Spawn(String),
    #[error("generator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("generator exited with {}: {stderr}", describe_exit(.code))]
    Failed { code: Option<i32>, stderr: String },
    #[error("generator output exceeded {limit} bytes")]
    OutputLimit { limit: usize },
    #[error("generation stream failed: {0}")]
    Stream(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Abstraction over generator backends.
pub trait GenerationTransport {
    /// Stream the generated text for `request`, calling `on_fragment` for each
    /// fragment in order. Returns once the stream is complete or broken.
    fn stream(
        &self,
        request: &GenerationRequest,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), TransportError>;
}

/// Transport that runs a configured command per request.
///
/// The combined prompt is written to the command's stdin, each stdout line is
/// a fragment, and the sampling parameters are exported as `EFFECT_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandTransport {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(
            &cfg.generator.command,
            cfg.generator_timeout(),
            cfg.generator.output_limit_bytes,
        )
    }

    fn command(&self, params: &GenerationParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("EFFECT_TEMPERATURE", params.temperature.to_string())
            .env("EFFECT_TOP_K", params.top_k.to_string())
            .env("EFFECT_TOP_P", params.top_p.to_string())
            .env("EFFECT_MAX_OUTPUT_TOKENS", params.max_output_tokens.to_string());
        cmd
    }
}

impl GenerationTransport for CommandTransport {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = self.timeout.as_secs()))]
    fn stream(
        &self,
        request: &GenerationRequest,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), TransportError> {
        if self.program.trim().is_empty() {
            return Err(TransportError::Spawn("generator command is empty".to_string()));
        }
        info!("starting generator");

        let child = spawn_piped(self.command(&request.params))
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
        let output = stream_child(
            child,
            request.combined_prompt().as_bytes(),
            self.timeout,
            self.output_limit_bytes,
            on_fragment,
        )
        .map_err(|err| TransportError::Stream(format!("{err:#}")))?;

        if output.timed_out {
            return Err(TransportError::TimedOut(self.timeout));
        }
        if output.overflowed {
            return Err(TransportError::OutputLimit {
                limit: self.output_limit_bytes,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(TransportError::Failed {
                code: output.status.code(),
                stderr: output.stderr_lossy(),
            });
        }
        debug!(bytes = output.stdout_bytes, "generator finished");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: "system".to_string(),
            prompt: "red circles".to_string(),
            params: RuntimeConfig::default().generation_params(),
        }
    }

    fn sh(script: &str) -> CommandTransport {
        CommandTransport::new(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
            4096,
        )
    }

    #[test]
    fn streams_stdout_lines_as_fragments() {
        let mut fragments = Vec::new();
        sh("echo one; echo two")
            .stream(&request(), &mut |f| fragments.push(f.to_string()))
            .expect("stream");
        assert_eq!(fragments, vec!["one\n", "two\n"]);
    }

    #[test]
    fn exports_generation_params() {
        let mut text = String::new();
        sh("echo \"$EFFECT_TEMPERATURE $EFFECT_TOP_K $EFFECT_TOP_P $EFFECT_MAX_OUTPUT_TOKENS\"")
            .stream(&request(), &mut |f| text.push_str(f))
            .expect("stream");
        assert_eq!(text, "0.4 32 0.95 2048\n");
    }

    #[test]
    fn prompt_is_written_to_stdin() {
        let mut text = String::new();
        sh("cat")
            .stream(&request(), &mut |f| text.push_str(f))
            .expect("stream");
        assert_eq!(text, "system\n\nred circles\n");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = sh("echo partial; echo bad >&2; exit 4")
            .stream(&request(), &mut |_| {})
            .expect_err("should fail");
        assert_eq!(
            err,
            TransportError::Failed {
                code: Some(4),
                stderr: "bad".to_string()
            }
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let transport = CommandTransport::new(
            &["definitely-not-a-real-generator".to_string()],
            Duration::from_secs(1),
            1024,
        );
        let err = transport
            .stream(&request(), &mut |_| {})
            .expect_err("should fail");
        assert!(matches!(err, TransportError::Spawn(_)));
    }
}
