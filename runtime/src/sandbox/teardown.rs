//! The one-shot action that removes a mounted effect.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;

use crate::mount::MountRef;
use crate::sandbox::ExecutionFault;

type TeardownAction = Box<dyn FnOnce() -> Result<(), ExecutionFault>>;

/// Where a teardown came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownKind {
    /// The `cleanup` function returned by the effect.
    Declared,
    /// The default used when the effect did not produce a usable teardown.
    Fallback,
}

/// Result of [`TeardownHandle::invoke`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    Completed,
    /// The action ran and failed. The handle is spent all the same.
    Faulted(ExecutionFault),
    AlreadyInvoked,
}

/// Zero-argument teardown, runnable at most once.
pub struct TeardownHandle {
    kind: TeardownKind,
    action: Option<TeardownAction>,
}

impl TeardownHandle {
    pub fn declared(action: impl FnOnce() -> Result<(), ExecutionFault> + 'static) -> Self {
        Self {
            kind: TeardownKind::Declared,
            action: Some(Box::new(action)),
        }
    }

    /// Teardown that empties the mount point and cancels every callback
    /// registered against it.
    pub fn fallback(mount: MountRef) -> Self {
        Self {
            kind: TeardownKind::Fallback,
            action: Some(Box::new(move || {
                mount.with(|mount| {
                    mount.clear();
                    mount.cancel_all_callbacks();
                });
                Ok(())
            })),
        }
    }

    pub fn kind(&self) -> TeardownKind {
        self.kind
    }

    pub fn is_spent(&self) -> bool {
        self.action.is_none()
    }

    /// Run the action the first time; every later call is a no-op.
    pub fn invoke(&mut self) -> TeardownOutcome {
        let Some(action) = self.action.take() else {
            return TeardownOutcome::AlreadyInvoked;
        };
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => TeardownOutcome::Completed,
            Ok(Err(fault)) => TeardownOutcome::Faulted(fault),
            Err(payload) => TeardownOutcome::Faulted(ExecutionFault::from_panic(payload.as_ref())),
        }
    }
}

impl fmt::Debug for TeardownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownHandle")
            .field("kind", &self.kind)
            .field("spent", &self.is_spent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::mount::{MountPoint, NodeId};

    #[test]
    fn second_invoke_is_a_noop() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let mut handle = TeardownHandle::declared(move || {
            counter.set(counter.get() + 1);
            Ok(())
        });

        assert_eq!(handle.invoke(), TeardownOutcome::Completed);
        assert_eq!(handle.invoke(), TeardownOutcome::AlreadyInvoked);
        assert_eq!(calls.get(), 1);
        assert!(handle.is_spent());
    }

    #[test]
    fn fallback_empties_mount_and_cancels_callbacks() {
        let mount = MountPoint::new(100.0, 100.0);
        for _ in 0..3 {
            let node = mount.create_element("div");
            mount.append_child(NodeId::ROOT, node);
        }
        mount.request_frame();
        mount.schedule_timer(10.0, true);

        let mut handle = TeardownHandle::fallback(mount.downgrade());
        assert_eq!(handle.kind(), TeardownKind::Fallback);
        assert_eq!(handle.invoke(), TeardownOutcome::Completed);
        assert!(mount.is_empty());
        assert_eq!(mount.pending_callbacks(), 0);
    }

    /// The fallback tolerates a mount point that is already gone.
    #[test]
    fn fallback_after_mount_dropped() {
        let mount = MountPoint::new(1.0, 1.0);
        let mut handle = TeardownHandle::fallback(mount.downgrade());
        drop(mount);
        assert_eq!(handle.invoke(), TeardownOutcome::Completed);
    }

    #[test]
    fn panicking_action_is_contained() {
        let mut handle = TeardownHandle::declared(|| panic!("boom"));
        match handle.invoke() {
            TeardownOutcome::Faulted(ExecutionFault::Panicked(message)) => {
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(handle.invoke(), TeardownOutcome::AlreadyInvoked);
    }
}
