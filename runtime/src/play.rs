//! Headless playback for `effect-runtime run` and `effect-runtime generate`.
//!
//! Builds a supervisor from config, mounts one effect, drives it for a number
//! of 60 Hz frames and reports what the mount point looks like afterwards.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::types::{EffectSource, RuntimeStatus};
use crate::exit_codes;
use crate::io::config::RuntimeConfig;
use crate::io::prompt::PromptBuilder;
use crate::io::transport::GenerationTransport;
use crate::mount::{MountPoint, MountSnapshot};
use crate::sandbox::{EffectEngine, QuickJsEngine};
use crate::supervisor::{EffectSupervisor, RequestError};

/// Frame interval used when driving an effect.
pub const FRAME_MS: f64 = 1000.0 / 60.0;

/// Where the effect comes from.
#[derive(Debug, Clone)]
pub enum PlayInput {
    Prompt(String),
    Source(EffectSource),
}

/// JSON report printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct PlayReport {
    pub status: RuntimeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fault contained while mounting, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    pub frames: u32,
    pub callbacks_fired: usize,
    pub snapshot: MountSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip)]
    pub exit_code: i32,
}

pub fn build_supervisor<T: GenerationTransport>(
    cfg: &RuntimeConfig,
    transport: T,
) -> Result<EffectSupervisor<T, QuickJsEngine>> {
    let prompts = PromptBuilder::new(cfg.generation_params())?;
    Ok(EffectSupervisor::new(
        transport,
        QuickJsEngine::new(cfg.sandbox_limits()),
        prompts,
        MountPoint::new(cfg.mount.width, cfg.mount.height),
    ))
}

/// Mount `input`, drive `frames` frames, snapshot, then shut down.
///
/// `include_source` adds the generated (or rejected) text to the report.
#[instrument(skip_all, fields(frames))]
pub fn play<T, E>(
    supervisor: &mut EffectSupervisor<T, E>,
    input: PlayInput,
    frames: u32,
    include_source: bool,
) -> PlayReport
where
    T: GenerationTransport,
    E: EffectEngine,
{
    let preview = supervisor.subscribe_preview();
    let outcome = match input {
        PlayInput::Prompt(prompt) => supervisor.request(&prompt),
        PlayInput::Source(source) => supervisor.submit_source(source),
    };

    let mut callbacks_fired = 0;
    let mut played = 0;
    if outcome.is_ok() {
        for frame in 1..=frames {
            callbacks_fired += supervisor.tick(f64::from(frame) * FRAME_MS);
            played = frame;
        }
    }
    info!(played, callbacks_fired, "playback finished");

    let source = include_source.then(|| match supervisor.rejected_source() {
        Some(rejected) => rejected.as_str().to_string(),
        None => preview.borrow().clone(),
    });
    let report = PlayReport {
        status: supervisor.status(),
        fault: supervisor
            .current_effect()
            .and_then(|effect| effect.fault())
            .map(ToString::to_string),
        exit_code: exit_code(outcome.as_ref().err()),
        error: outcome.err().map(|err| err.to_string()),
        frames: played,
        callbacks_fired,
        snapshot: supervisor.mount().snapshot(),
        source,
    };
    supervisor.shutdown();
    report
}

fn exit_code(error: Option<&RequestError>) -> i32 {
    match error {
        None => exit_codes::OK,
        Some(RequestError::Contract(_)) => exit_codes::REJECTED,
        Some(RequestError::Transport(_)) => exit_codes::TRANSPORT,
        Some(RequestError::Busy | RequestError::Prompt(_)) => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validator::ContractViolation;
    use crate::test_support::{ScriptedStream, ScriptedTransport, fixtures};

    fn supervisor(
        transport: ScriptedTransport,
    ) -> EffectSupervisor<ScriptedTransport, QuickJsEngine> {
        build_supervisor(&RuntimeConfig::default(), transport).expect("supervisor")
    }

    #[test]
    fn plays_source_for_requested_frames() {
        let mut sup = supervisor(ScriptedTransport::default());
        let report = play(
            &mut sup,
            PlayInput::Source(EffectSource::new(fixtures::PULSE)),
            10,
            false,
        );

        assert_eq!(report.exit_code, exit_codes::OK);
        assert_eq!(report.frames, 10);
        assert_eq!(report.callbacks_fired, 10);
        assert_eq!(report.snapshot.children.len(), 1);
        assert_eq!(report.snapshot.children[0].attributes["data-frame"], "10");
        assert!(sup.mount().is_empty());
    }

    #[test]
    fn generated_source_is_reported() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&fixtures::fragments(
            fixtures::FENCED_ARROW,
        ))]);
        let mut sup = supervisor(transport);
        let report = play(&mut sup, PlayInput::Prompt("clock".to_string()), 3, true);

        assert_eq!(report.exit_code, exit_codes::OK);
        assert_eq!(report.source.as_deref(), Some(fixtures::FENCED_ARROW));
        assert_eq!(report.fault, None);
    }

    #[test]
    fn rejected_source_maps_to_rejected_exit() {
        let mut sup = supervisor(ScriptedTransport::default());
        let report = play(
            &mut sup,
            PlayInput::Source(EffectSource::new("not valid code")),
            5,
            true,
        );

        assert_eq!(report.exit_code, exit_codes::REJECTED);
        assert_eq!(report.frames, 0);
        assert_eq!(
            report.error,
            Some(ContractViolation::MissingEntryPoint.to_string())
        );
        assert_eq!(report.source.as_deref(), Some("not valid code"));
    }

    #[test]
    fn transport_failure_maps_to_transport_exit() {
        let mut sup = supervisor(ScriptedTransport::default());
        let report = play(&mut sup, PlayInput::Prompt("x".to_string()), 5, false);
        assert_eq!(report.exit_code, exit_codes::TRANSPORT);
    }
}
