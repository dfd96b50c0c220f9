//! Protocol counters.

use core::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Relaxed event counters bumped by the claim/share protocol.
#[derive(Debug, Default)]
pub(crate) struct Meters {
    claim_attempts: AtomicUsize,
    claimed: AtomicUsize,
    deadlocks_avoided: AtomicUsize,
    shared: AtomicUsize,
    waits: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Meter {
    ClaimAttempt,
    Claimed,
    DeadlockAvoided,
    Shared,
    Wait,
}

impl Meters {
    #[inline]
    pub(crate) fn bump(&self, meter: Meter) {
        let counter = match meter {
            Meter::ClaimAttempt => &self.claim_attempts,
            Meter::Claimed => &self.claimed,
            Meter::DeadlockAvoided => &self.deadlocks_avoided,
            Meter::Shared => &self.shared,
            Meter::Wait => &self.waits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            claim_attempts: self.claim_attempts.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            deadlocks_avoided: self.deadlocks_avoided.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a runtime's protocol counters.
///
/// Counters are read one at a time, so a snapshot taken while other threads
/// claim may be slightly inconsistent across fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Claims that could not be settled without the claim table.
    pub claim_attempts: usize,
    /// Exclusive domains handed from one context to another.
    pub claimed: usize,
    /// Domains shared because waiting would have closed a cycle.
    pub deadlocks_avoided: usize,
    /// Exclusive → shared transitions, for any reason.
    pub shared: usize,
    /// Times a claimer blocked waiting for an owner to share.
    pub waits: usize,
}
