//! Effect lifecycle supervisor.
//!
//! Owns the mount point and at most one mounted effect. A request runs the
//! whole pipeline on the caller's thread: retire the current effect, stream
//! the generated text, normalize and validate it, then hand it to the
//! sandboxed executor. Every state change is checked against
//! [`next_phase`](crate::core::lifecycle::next_phase) and published on the
//! status channel.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::core::accumulator::StreamAccumulator;
use crate::core::lifecycle::{LifecycleEvent, Phase, next_phase};
use crate::core::normalizer::normalize_with_report;
use crate::core::types::{EffectId, EffectSource, FailureReason, RuntimeStatus};
use crate::core::validator::{ContractViolation, validate_contract};
use crate::io::prompt::PromptBuilder;
use crate::io::transport::{GenerationTransport, TransportError};
use crate::mount::{MountPoint, MountReset};
use crate::sandbox::{
    EffectEngine, MountedEffect, SandboxedExecutor, TeardownKind, TeardownOutcome,
};

/// Why a request produced no mounted effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("a generation is already in progress")]
    Busy,
    #[error("could not build prompt: {0}")]
    Prompt(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// How the most recently replaced or shut down effect was retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retirement {
    pub effect: EffectId,
    pub kind: TeardownKind,
    pub outcome: TeardownOutcome,
    /// What the mount reset after the teardown still had to remove.
    pub reset: MountReset,
}

enum RuntimeState {
    Idle,
    Generating,
    Mounting,
    Mounted(MountedEffect),
    Failed(FailureReason),
}

impl RuntimeState {
    fn phase(&self) -> Phase {
        match self {
            RuntimeState::Idle => Phase::Idle,
            RuntimeState::Generating => Phase::Generating,
            RuntimeState::Mounting => Phase::Mounting,
            RuntimeState::Mounted(_) => Phase::Mounted,
            RuntimeState::Failed(_) => Phase::Failed,
        }
    }

    fn status(&self) -> RuntimeStatus {
        match self {
            RuntimeState::Idle => RuntimeStatus::Idle,
            RuntimeState::Generating => RuntimeStatus::Generating,
            RuntimeState::Mounting => RuntimeStatus::Mounting,
            RuntimeState::Mounted(effect) => RuntimeStatus::Mounted {
                effect: effect.id(),
                execution_failed: effect.execution_failed(),
            },
            RuntimeState::Failed(reason) => RuntimeStatus::Failed(reason.clone()),
        }
    }
}

/// Drives generated effects through their lifecycle against one mount point.
pub struct EffectSupervisor<T, E>
where
    T: GenerationTransport,
    E: EffectEngine,
{
    transport: T,
    executor: SandboxedExecutor<E>,
    prompts: PromptBuilder,
    mount: MountPoint,
    state: RuntimeState,
    next_effect: u64,
    rejected: Option<EffectSource>,
    last_retirement: Option<Retirement>,
    preview: watch::Sender<String>,
    status: watch::Sender<RuntimeStatus>,
}

impl<T, E> EffectSupervisor<T, E>
where
    T: GenerationTransport,
    E: EffectEngine,
{
    pub fn new(transport: T, engine: E, prompts: PromptBuilder, mount: MountPoint) -> Self {
        let (preview, _) = watch::channel(String::new());
        let (status, _) = watch::channel(RuntimeStatus::Idle);
        Self {
            transport,
            executor: SandboxedExecutor::new(engine),
            prompts,
            mount,
            state: RuntimeState::Idle,
            next_effect: 1,
            rejected: None,
            last_retirement: None,
            preview,
            status,
        }
    }

    /// Generate, validate and mount an effect for `prompt`.
    ///
    /// A mounted effect is torn down and the mount reset before generation
    /// starts. On a transport error or a contract violation the supervisor
    /// ends in `Failed` and nothing new is mounted.
    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    pub fn request(&mut self, prompt: &str) -> Result<RuntimeStatus, RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        let request = self
            .prompts
            .build(prompt)
            .map_err(|err| RequestError::Prompt(format!("{err:#}")))?;
        self.begin()?;

        let mut accumulator = StreamAccumulator::with_preview(self.preview.clone());
        let streamed = self.transport.stream(&request, &mut |fragment| {
            accumulator.append(fragment);
        });

        match streamed {
            Ok(()) => {
                info!(
                    fragments = accumulator.fragment_count(),
                    bytes = accumulator.text().len(),
                    "generation complete"
                );
                self.admit(accumulator.finalize())
            }
            Err(err) => {
                let dropped = accumulator.discard();
                warn!(error = %err, dropped_bytes = dropped, "generation failed");
                self.transition(
                    LifecycleEvent::GenerationFailed,
                    RuntimeState::Failed(FailureReason::Transport(err.to_string())),
                );
                Err(err.into())
            }
        }
    }

    /// Mount already available effect text, skipping generation.
    #[instrument(skip_all, fields(bytes = source.len()))]
    pub fn submit_source(&mut self, source: EffectSource) -> Result<RuntimeStatus, RequestError> {
        self.begin()?;
        self.preview.send_replace(source.as_str().to_string());
        self.admit(source)
    }

    /// Advance the mount clock and run the mounted effect's due callbacks.
    pub fn tick(&mut self, now_ms: f64) -> usize {
        match &mut self.state {
            RuntimeState::Mounted(effect) => effect.tick(now_ms),
            _ => 0,
        }
    }

    /// Dismiss a `Failed` state. Returns false when there was nothing to dismiss.
    pub fn acknowledge(&mut self) -> bool {
        if self.state.phase() != Phase::Failed {
            return false;
        }
        self.transition(LifecycleEvent::Acknowledged, RuntimeState::Idle)
    }

    /// Tear down any mounted effect and return to `Idle`.
    pub fn shutdown(&mut self) {
        if self.state.phase() == Phase::Idle {
            return;
        }
        self.retire_current();
        self.transition(LifecycleEvent::Shutdown, RuntimeState::Idle);
        info!("supervisor shut down");
    }

    pub fn status(&self) -> RuntimeStatus {
        self.state.status()
    }

    pub fn is_busy(&self) -> bool {
        self.state.phase().is_busy()
    }

    /// Live text of the generation in progress (or of the last one).
    pub fn subscribe_preview(&self) -> watch::Receiver<String> {
        self.preview.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.subscribe()
    }

    /// Raw text of the last source that failed validation.
    pub fn rejected_source(&self) -> Option<&EffectSource> {
        self.rejected.as_ref()
    }

    pub fn last_retirement(&self) -> Option<&Retirement> {
        self.last_retirement.as_ref()
    }

    pub fn mount(&self) -> &MountPoint {
        &self.mount
    }

    pub fn current_effect(&self) -> Option<&MountedEffect> {
        match &self.state {
            RuntimeState::Mounted(effect) => Some(effect),
            _ => None,
        }
    }

    /// Common start of `request` and `submit_source`.
    fn begin(&mut self) -> Result<(), RequestError> {
        if self.is_busy() {
            return Err(RequestError::Busy);
        }
        self.retire_current();
        self.rejected = None;
        self.preview.send_replace(String::new());
        self.transition(LifecycleEvent::GenerationRequested, RuntimeState::Generating);
        Ok(())
    }

    /// Normalize, validate and mount a complete source.
    fn admit(&mut self, source: EffectSource) -> Result<RuntimeStatus, RequestError> {
        let normalized = normalize_with_report(&source);
        debug!(
            fences_stripped = normalized.fences_stripped,
            teardown_rewrites = normalized.teardown_rewrites,
            "normalized effect source"
        );

        if let Err(violation) = validate_contract(&normalized.source) {
            warn!(%violation, bytes = source.len(), "generated code rejected");
            self.rejected = Some(source);
            self.transition(
                LifecycleEvent::SourceRejected,
                RuntimeState::Failed(FailureReason::Contract(violation)),
            );
            return Err(violation.into());
        }

        self.transition(LifecycleEvent::SourceAccepted, RuntimeState::Mounting);
        let id = EffectId(self.next_effect);
        self.next_effect += 1;
        let effect = self.executor.execute(id, &normalized.source, &self.mount);
        self.transition(LifecycleEvent::Executed, RuntimeState::Mounted(effect));
        Ok(self.status())
    }

    /// Invoke the mounted effect's teardown and reset the mount point.
    fn retire_current(&mut self) {
        if let RuntimeState::Mounted(effect) = &mut self.state {
            let outcome = effect.teardown();
            let reset = self.mount.reset();
            debug!(
                effect = %effect.id(),
                ?outcome,
                children_removed = reset.children_removed,
                callbacks_cancelled = reset.callbacks_cancelled,
                "retired effect"
            );
            self.last_retirement = Some(Retirement {
                effect: effect.id(),
                kind: effect.teardown_kind(),
                outcome,
                reset,
            });
        }
    }

    fn transition(&mut self, event: LifecycleEvent, next: RuntimeState) -> bool {
        let from = self.state.phase();
        let Some(phase) = next_phase(from, event) else {
            warn!(?from, ?event, "lifecycle event not allowed, ignoring");
            return false;
        };
        debug_assert_eq!(phase, next.phase());
        self.state = next;
        let status = self.state.status();
        debug!(?from, ?event, ?status, "lifecycle transition");
        self.status.send_replace(status);
        true
    }
}

impl<T, E> Drop for EffectSupervisor<T, E>
where
    T: GenerationTransport,
    E: EffectEngine,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::RuntimeConfig;
    use crate::test_support::{
        EngineBehavior, JournalEntry, ScriptedEngine, ScriptedStream, ScriptedTransport,
    };

    const VALID: &str = "function createAnimation(c) { return function cleanup() {}; }";

    fn supervisor(
        transport: ScriptedTransport,
        engine: ScriptedEngine,
    ) -> EffectSupervisor<ScriptedTransport, ScriptedEngine> {
        let prompts =
            PromptBuilder::new(RuntimeConfig::default().generation_params()).expect("templates");
        EffectSupervisor::new(transport, engine, prompts, MountPoint::new(100.0, 100.0))
    }

    #[test]
    fn request_mounts_valid_effect() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&[VALID])]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 1 });
        let mut sup = supervisor(transport.clone(), engine);

        let status = sup.request("sparkles").expect("request");
        assert_eq!(
            status,
            RuntimeStatus::Mounted {
                effect: EffectId(1),
                execution_failed: false
            }
        );
        assert_eq!(transport.requests().len(), 1);
        assert!(transport.requests()[0].prompt.contains("sparkles"));
    }

    /// The old teardown runs and the mount is empty before the next effect mounts.
    #[test]
    fn replacing_tears_down_first() {
        let transport = ScriptedTransport::new([
            ScriptedStream::complete(&[VALID]),
            ScriptedStream::complete(&[VALID]),
        ]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 2 });
        let mut sup = supervisor(transport, engine.clone());

        sup.request("one").expect("first");
        sup.request("two").expect("second");

        assert_eq!(
            engine.journal(),
            vec![
                JournalEntry::Mounted(EffectId(1)),
                JournalEntry::TornDown(EffectId(1)),
                JournalEntry::Mounted(EffectId(2)),
            ]
        );
        assert_eq!(engine.children_at_mount(), vec![0, 0]);
        assert_eq!(sup.mount().child_count(), 2);
    }

    /// Declared, throwing and non-callable effects in a row: every retired
    /// effect's own handle ran once, in request order, and left nothing for
    /// the mount reset before the next entry point ran.
    #[test]
    fn mixed_sequence_retires_each_effect_once() {
        let behaviors = [
            EngineBehavior::Declares { children: 2 },
            EngineBehavior::Throws { children: 3 },
            EngineBehavior::NotCallable,
            EngineBehavior::Declares { children: 1 },
            EngineBehavior::Throws { children: 1 },
        ];
        let transport = ScriptedTransport::default();
        let engine = ScriptedEngine::new(behaviors[0]);
        let mut sup = supervisor(transport.clone(), engine.clone());

        let mut retired = Vec::new();
        for (n, behavior) in behaviors.iter().enumerate() {
            engine.set_behavior(*behavior);
            transport.push(ScriptedStream::complete(&[VALID]));
            sup.request(&format!("effect {n}")).expect("request");
            if let Some(retirement) = sup.last_retirement() {
                retired.push(retirement.clone());
            }
            sup.mount().request_frame();
            sup.mount().schedule_timer(50.0, true);
        }

        let expected_kinds = [
            TeardownKind::Declared,
            TeardownKind::Fallback,
            TeardownKind::Fallback,
            TeardownKind::Declared,
        ];
        assert_eq!(retired.len(), behaviors.len() - 1);
        for (n, retirement) in retired.iter().enumerate() {
            assert_eq!(retirement.effect, EffectId(n as u64 + 1));
            assert_eq!(retirement.kind, expected_kinds[n]);
            assert_eq!(retirement.outcome, TeardownOutcome::Completed);
            assert_eq!(retirement.reset, MountReset::default());
        }

        assert_eq!(engine.children_at_mount(), vec![0; behaviors.len()]);
        assert_eq!(engine.pending_at_mount(), vec![0; behaviors.len()]);
        assert_eq!(
            engine.journal(),
            vec![
                JournalEntry::Mounted(EffectId(1)),
                JournalEntry::TornDown(EffectId(1)),
                JournalEntry::Mounted(EffectId(2)),
                JournalEntry::Mounted(EffectId(3)),
                JournalEntry::Mounted(EffectId(4)),
                JournalEntry::TornDown(EffectId(4)),
                JournalEntry::Mounted(EffectId(5)),
            ]
        );
    }

    #[test]
    fn contract_violation_keeps_raw_text() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&["not valid code"])]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 1 });
        let mut sup = supervisor(transport, engine.clone());

        let err = sup.request("x").expect_err("rejected");
        assert_eq!(err, RequestError::Contract(ContractViolation::MissingEntryPoint));
        assert_eq!(
            sup.status(),
            RuntimeStatus::Failed(FailureReason::Contract(ContractViolation::MissingEntryPoint))
        );
        assert_eq!(
            sup.rejected_source().map(EffectSource::as_str),
            Some("not valid code")
        );
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn transport_error_discards_partial_text() {
        let transport = ScriptedTransport::new([ScriptedStream::broken(
            &["function createAnimation("],
            "connection reset",
        )]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 1 });
        let mut sup = supervisor(transport, engine.clone());

        let err = sup.request("x").expect_err("transport");
        assert!(matches!(err, RequestError::Transport(TransportError::Stream(_))));
        assert!(matches!(
            sup.status(),
            RuntimeStatus::Failed(FailureReason::Transport(_))
        ));
        assert!(sup.rejected_source().is_none());
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn blank_prompt_does_not_touch_mounted_effect() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&[VALID])]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 1 });
        let mut sup = supervisor(transport, engine.clone());
        sup.request("one").expect("first");

        let err = sup.request("   ").expect_err("blank");
        assert!(matches!(err, RequestError::Prompt(_)));
        assert!(matches!(sup.status(), RuntimeStatus::Mounted { .. }));
        assert_eq!(engine.journal().len(), 1);
    }

    #[test]
    fn acknowledge_clears_failure() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&["nope"])]);
        let mut sup = supervisor(
            transport,
            ScriptedEngine::new(EngineBehavior::Declares { children: 1 }),
        );
        assert!(!sup.acknowledge());
        let _ = sup.request("x");
        assert!(sup.acknowledge());
        assert_eq!(sup.status(), RuntimeStatus::Idle);
    }

    #[test]
    fn status_channel_sees_every_change() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&[VALID])]);
        let mut sup = supervisor(
            transport,
            ScriptedEngine::new(EngineBehavior::Declares { children: 1 }),
        );
        let status = sup.subscribe_status();
        let preview = sup.subscribe_preview();

        sup.request("x").expect("request");
        assert!(matches!(*status.borrow(), RuntimeStatus::Mounted { .. }));
        assert_eq!(*preview.borrow(), VALID);
    }

    #[test]
    fn submit_source_skips_generation() {
        let transport = ScriptedTransport::default();
        let mut sup = supervisor(
            transport.clone(),
            ScriptedEngine::new(EngineBehavior::Throws { children: 0 }),
        );

        let status = sup.submit_source(EffectSource::new(VALID)).expect("submit");
        assert_eq!(
            status,
            RuntimeStatus::Mounted {
                effect: EffectId(1),
                execution_failed: true
            }
        );
        assert_eq!(
            sup.current_effect().map(MountedEffect::teardown_kind),
            Some(TeardownKind::Fallback)
        );
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn shutdown_tears_down_and_idles() {
        let transport = ScriptedTransport::new([ScriptedStream::complete(&[VALID])]);
        let engine = ScriptedEngine::new(EngineBehavior::Declares { children: 3 });
        let mut sup = supervisor(transport, engine.clone());
        sup.request("x").expect("request");

        sup.shutdown();
        sup.shutdown();
        assert_eq!(sup.status(), RuntimeStatus::Idle);
        assert!(sup.mount().is_empty());
        assert_eq!(
            engine.journal(),
            vec![JournalEntry::Mounted(EffectId(1)), JournalEntry::TornDown(EffectId(1))]
        );
    }
}
