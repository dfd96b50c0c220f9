//! Turn admission: the collector's view of which contexts are running.
//!
//! A context inside a turn may touch domains at any moment, so a collector
//! must wait for every turn to end or be suspended before it runs. A context
//! blocked in `claim` suspends its admission around the wait so it cannot
//! starve the collector.

use std::sync::{Condvar, Mutex, PoisonError};

use super::ContextId;

/// Admission collaborator consumed by the ownership protocol.
pub trait Admission: Send + Sync {
    /// The context is about to block; stop counting it as running.
    fn suspend_turn(&self, cx: ContextId);

    /// The context woke up and is running again.
    fn resume_turn(&self, cx: ContextId);

    /// The context entered its outermost turn.
    fn begin_turn(&self, cx: ContextId) {
        self.resume_turn(cx);
    }

    /// The context left its outermost turn.
    fn end_turn(&self, cx: ContextId) {
        self.suspend_turn(cx);
    }
}

/// Counts running turns so a collector can wait for quiescence.
#[derive(Debug, Default)]
pub struct TurnLedger {
    active: Mutex<usize>,
    idle: Condvar,
}

impl TurnLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns currently running (not ended, not suspended).
    pub fn active_turns(&self) -> usize {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no turn is running.
    pub fn wait_until_idle(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        while *active > 0 {
            active = self.idle.wait(active).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Admission for TurnLedger {
    fn suspend_turn(&self, _cx: ContextId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*active > 0, "turn ledger underflow");
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    fn resume_turn(&self, _cx: ContextId) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
