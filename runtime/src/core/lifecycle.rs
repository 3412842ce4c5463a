//! Transition table for the effect lifecycle.
//!
//! The supervisor consults this table before every state change. Keeping it
//! free of effect handles lets the at-most-one-mount rules be tested without
//! running any generated code.

use serde::Serialize;

/// Lifecycle phase, without the data a phase carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
    Mounting,
    Mounted,
    Failed,
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A new effect was requested. From `Mounted` the caller must tear the
    /// current effect down first.
    GenerationRequested,
    /// The stream completed and the source passed validation.
    SourceAccepted,
    /// The stream failed.
    GenerationFailed,
    /// The source failed validation.
    SourceRejected,
    /// The executor returned a teardown handle.
    Executed,
    /// The user dismissed a failure.
    Acknowledged,
    /// The supervisor is shutting down.
    Shutdown,
}

/// Next phase for `event` in `phase`, or `None` when the event is not allowed.
pub fn next_phase(phase: Phase, event: LifecycleEvent) -> Option<Phase> {
    use LifecycleEvent as E;
    use Phase as P;

    match (phase, event) {
        (P::Idle | P::Failed | P::Mounted, E::GenerationRequested) => Some(P::Generating),
        (P::Generating, E::SourceAccepted) => Some(P::Mounting),
        (P::Generating, E::GenerationFailed | E::SourceRejected) => Some(P::Failed),
        (P::Mounting, E::Executed) => Some(P::Mounted),
        (P::Failed, E::Acknowledged) => Some(P::Idle),
        (_, E::Shutdown) => Some(P::Idle),
        _ => None,
    }
}

impl Phase {
    /// A request is in flight and a new one must wait.
    pub fn is_busy(self) -> bool {
        matches!(self, Phase::Generating | Phase::Mounting)
    }
}
