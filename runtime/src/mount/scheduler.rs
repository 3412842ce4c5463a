//! Recurring-callback registry for a mount point.
//!
//! Scripts never hold timers of their own: every animation frame, timeout and
//! interval is registered here, so cancelling the registry is enough to stop
//! whatever an effect left running.

use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a scheduled callback. Starts at 1 so ids are always truthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u32);

impl CallbackId {
    pub fn get(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Schedule {
    Frame,
    Timeout { due: f64 },
    Interval { due: f64, period: f64 },
}

/// Pending callbacks plus the clock they are measured against (milliseconds).
#[derive(Debug)]
pub(crate) struct Scheduler {
    now: f64,
    next_id: u32,
    pending: BTreeMap<CallbackId, Schedule>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            now: 0.0,
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }
}

impl Scheduler {
    pub(crate) fn now(&self) -> f64 {
        self.now
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn request_frame(&mut self) -> CallbackId {
        self.insert(Schedule::Frame)
    }

    /// Register a timeout (`repeat == false`) or an interval.
    pub(crate) fn schedule_timer(&mut self, delay_ms: f64, repeat: bool) -> CallbackId {
        let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms
        } else {
            0.0
        };
        let due = self.now + delay;
        if repeat {
            // Zero-period intervals would fire on every advance; browsers clamp too.
            self.insert(Schedule::Interval {
                due,
                period: delay.max(1.0),
            })
        } else {
            self.insert(Schedule::Timeout { due })
        }
    }

    pub(crate) fn cancel(&mut self, id: CallbackId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub(crate) fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Move the clock to `now_ms` and return the callbacks due, in id order.
    ///
    /// Frames and timeouts are removed when returned; intervals are re-armed
    /// one period after `now_ms`. Callbacks registered while the returned ones
    /// run are only considered on the next advance. The clock never moves back.
    pub(crate) fn advance(&mut self, now_ms: f64) -> Vec<CallbackId> {
        if now_ms.is_finite() && now_ms > self.now {
            self.now = now_ms;
        }
        let now = self.now;

        let mut due = Vec::new();
        self.pending.retain(|id, schedule| match schedule {
            Schedule::Frame => {
                due.push(*id);
                false
            }
            Schedule::Timeout { due: at } if *at <= now => {
                due.push(*id);
                false
            }
            Schedule::Interval { due: at, period } if *at <= now => {
                due.push(*id);
                *at = now + *period;
                true
            }
            _ => true,
        });
        due
    }

    fn insert(&mut self, schedule: Schedule) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.pending.insert(id, schedule);
        id
    }
}
