//! Guarded execution of validated effect code.
//!
//! The [`SandboxedExecutor`] is the only place generated code runs. It never
//! returns an error: whatever goes wrong while an effect is instantiated is
//! logged and replaced by the fallback teardown, so the supervisor always
//! holds exactly one [`TeardownHandle`] for the mounted effect.

pub mod quickjs;
pub mod teardown;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{EffectId, NormalizedEffectSource};
use crate::mount::{CallbackId, MountPoint, MountRef};

pub use quickjs::{QuickJsEngine, SandboxLimits};
pub use teardown::{TeardownHandle, TeardownKind, TeardownOutcome};

/// A failure inside generated code or the engine running it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFault {
    #[error("effect code failed to compile: {0}")]
    Compile(String),
    #[error("effect code threw: {0}")]
    Threw(String),
    #[error("createAnimation returned {found}, not a teardown function")]
    NotCallable { found: String },
    #[error("script call exceeded its {budget:?} budget")]
    Interrupted { budget: Duration },
    #[error("host panicked while running effect code: {0}")]
    Panicked(String),
    #[error("script engine error: {0}")]
    Engine(String),
}

impl ExecutionFault {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        ExecutionFault::Panicked(message)
    }
}

/// Live script state of one effect, used to run its scheduled callbacks.
pub trait EffectInstance {
    /// Run callback `id`. Unknown ids are ignored.
    fn fire(&mut self, id: CallbackId, now_ms: f64) -> Result<(), ExecutionFault>;
}

/// What an engine produced for one effect.
pub struct Instantiation {
    /// The effect's own teardown, or why it could not be obtained. Callbacks
    /// the code registered before failing stay live on `instance`.
    pub declared: Result<TeardownHandle, ExecutionFault>,
    pub instance: Box<dyn EffectInstance>,
}

/// Script engine seam. Production uses [`QuickJsEngine`]; tests script it.
pub trait EffectEngine {
    /// Compile `code` in a fresh realm bound to `mount` and call its entry point.
    ///
    /// `Err` means nothing ran (engine setup or compilation failed).
    fn instantiate(
        &self,
        id: EffectId,
        code: &NormalizedEffectSource,
        mount: MountRef,
    ) -> Result<Instantiation, ExecutionFault>;
}

/// Runs effects through an [`EffectEngine`] and contains every fault.
#[derive(Debug, Clone)]
pub struct SandboxedExecutor<E> {
    engine: E,
}

impl<E: EffectEngine> SandboxedExecutor<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Mount `code` into `mount`. Always yields an effect with one teardown.
    pub fn execute(
        &self,
        id: EffectId,
        code: &NormalizedEffectSource,
        mount: &MountPoint,
    ) -> MountedEffect {
        let weak = mount.downgrade();
        let attempt = catch_unwind(AssertUnwindSafe(|| {
            self.engine.instantiate(id, code, weak.clone())
        }));

        let (teardown, instance, fault) = match attempt {
            Ok(Ok(Instantiation {
                declared: Ok(handle),
                instance,
            })) => (handle, Some(instance), None),
            Ok(Ok(Instantiation {
                declared: Err(fault),
                instance,
            })) => (TeardownHandle::fallback(weak.clone()), Some(instance), Some(fault)),
            Ok(Err(fault)) => (TeardownHandle::fallback(weak.clone()), None, Some(fault)),
            Err(payload) => (
                TeardownHandle::fallback(weak.clone()),
                None,
                Some(ExecutionFault::from_panic(payload.as_ref())),
            ),
        };

        let mounted_children = mount.child_count();
        match &fault {
            Some(fault) => warn!(
                effect = %id,
                error = %fault,
                mounted_children,
                "effect faulted during mount; using fallback teardown"
            ),
            None => debug!(effect = %id, mounted_children, "effect mounted"),
        }

        MountedEffect {
            id,
            teardown,
            instance,
            execution_failed: fault.is_some() && mounted_children == 0,
            fault,
            mount: weak,
        }
    }
}

/// An effect that has been handed its mount point.
pub struct MountedEffect {
    id: EffectId,
    teardown: TeardownHandle,
    instance: Option<Box<dyn EffectInstance>>,
    fault: Option<ExecutionFault>,
    execution_failed: bool,
    mount: MountRef,
}

impl MountedEffect {
    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn teardown_kind(&self) -> TeardownKind {
        self.teardown.kind()
    }

    /// The fault contained while mounting, if any.
    pub fn fault(&self) -> Option<&ExecutionFault> {
        self.fault.as_ref()
    }

    /// The effect faulted and left nothing in the mount point.
    pub fn execution_failed(&self) -> bool {
        self.execution_failed
    }

    /// Advance the mount clock to `now_ms` and run the callbacks now due.
    ///
    /// Returns how many callbacks ran. Faults are logged and do not stop the
    /// remaining callbacks.
    pub fn tick(&mut self, now_ms: f64) -> usize {
        if self.teardown.is_spent() {
            return 0;
        }
        let Some(due) = self.mount.with(|mount| mount.advance(now_ms)) else {
            return 0;
        };
        let Some(instance) = self.instance.as_mut() else {
            return 0;
        };

        let mut fired = 0;
        for callback in due {
            let outcome = catch_unwind(AssertUnwindSafe(|| instance.fire(callback, now_ms)));
            fired += 1;
            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(fault)) => fault,
                Err(payload) => ExecutionFault::from_panic(payload.as_ref()),
            };
            warn!(effect = %self.id, %callback, error = %fault, "effect callback faulted");
        }
        fired
    }

    /// Invoke the teardown handle. Only the first call has any effect.
    pub fn teardown(&mut self) -> TeardownOutcome {
        let outcome = self.teardown.invoke();
        match &outcome {
            TeardownOutcome::Completed => {
                debug!(effect = %self.id, kind = ?self.teardown.kind(), "effect torn down");
            }
            TeardownOutcome::Faulted(fault) => {
                warn!(effect = %self.id, error = %fault, "effect teardown faulted");
            }
            TeardownOutcome::AlreadyInvoked => {}
        }
        self.instance = None;
        outcome
    }
}

impl std::fmt::Debug for MountedEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedEffect")
            .field("id", &self.id)
            .field("teardown", &self.teardown)
            .field("fault", &self.fault)
            .field("execution_failed", &self.execution_failed)
            .finish_non_exhaustive()
    }
}
