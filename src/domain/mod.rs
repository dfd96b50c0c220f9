//! Domains: the ownership unit guarding one property slot table.
//!
//! A domain starts **exclusive**: a single context owns it and touches its
//! slots with no lock at all. The owner's nesting depth lives in the same
//! word as its identity (a [`Tenure`]), so a claim can never take a domain
//! away from a context that is inside it. The first time a second context on
//! another thread needs it while the owner is busy, the domain is either
//! waited for or, when waiting would deadlock or starve the collector, turned
//! **shared**. Shared domains are guarded by a [`ThinLock`] plus a
//! reentrancy count. The transition is one-way.
//!
//! The protocol itself lives on [`Runtime`]; this module holds the state.

pub mod context;
pub mod pending;
pub mod protocol;
pub mod runtime;
pub mod stats;
pub mod turn;

#[cfg(test)]
mod tests;

use core::cell::UnsafeCell;
use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::concurrency::sync::ThinLock;
use crate::value::Value;

pub use context::{Context, ContextId, TurnGuard};
pub use runtime::{Runtime, RuntimeBuilder};
pub use stats::LockStats;
pub use turn::{Admission, TurnLedger};

/// Identity of an [`Object`](crate::Object), used to recognize self-owned domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(NonZeroUsize);

impl ObjectId {
    /// The `n`th id handed out (zero-based).
    pub(crate) fn nth(n: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(n))
    }

    /// Raw integer form.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Which branch of the domain's state is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DomainMode {
    /// One owning context, no locking.
    Exclusive = 0,
    /// Thin lock plus reentrancy count.
    Shared = 1,
}

/// Terminal result of [`Runtime::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The domain is exclusive and the caller now owns it (or already did).
    Claimed,
    /// The domain is shared; use the thin lock path.
    NowShared,
}

const NOT_PENDING: usize = usize::MAX;

const HOLD_BITS: u32 = 24;
const HOLD_MASK: u64 = (1 << HOLD_BITS) - 1;

/// Deepest exclusive nesting a [`Tenure`] can record.
pub const MAX_HOLDS: usize = HOLD_MASK as usize;

/// Highest context id a [`Tenure`] can name.
pub const MAX_CONTEXT_ID: usize = (u64::MAX >> HOLD_BITS) as usize;

/// Exclusive owner and its nesting depth, packed into one word.
///
/// `0` means no owner: the domain is shared (or being made so).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenure(u64);

impl Tenure {
    pub(crate) const VACANT: Self = Self(0);

    pub(crate) fn new(owner: ContextId, holds: usize) -> Self {
        debug_assert!(owner.get() <= MAX_CONTEXT_ID && holds <= MAX_HOLDS);
        Self(((owner.get() as u64) << HOLD_BITS) | holds as u64)
    }

    /// Owning context, `None` once shared.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn owner(self) -> Option<ContextId> {
        ContextId::from_raw((self.0 >> HOLD_BITS) as usize)
    }

    #[inline]
    pub(crate) fn is_owned_by(self, cx: ContextId) -> bool {
        self.0 >> HOLD_BITS == cx.get() as u64
    }

    /// Outstanding `lock` calls by the owner.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn holds(self) -> usize {
        (self.0 & HOLD_MASK) as usize
    }

    /// Same owner, `holds` adjusted. `None` past [`MAX_HOLDS`].
    pub(crate) fn with_holds(self, holds: usize) -> Option<Self> {
        (holds <= MAX_HOLDS).then(|| Self((self.0 & !HOLD_MASK) | holds as u64))
    }
}

/// The lock/ownership unit attached to one slot table.
pub struct Domain {
    mode: AtomicU8,
    /// Exclusive branch: owner and nesting depth, vacant once shared.
    tenure: AtomicU64,
    /// Holds a forced share took away from an owner that was blocked.
    revoked: AtomicU64,
    /// Exclusive branch: index in the runtime's pending-share list.
    pending: AtomicUsize,
    /// Shared branch.
    thin: ThinLock,
    /// Shared branch: nested acquisitions by the holder. Holder-only access.
    count: AtomicUsize,
    sealed: AtomicBool,
    origin: Option<ObjectId>,
    slots: UnsafeCell<Vec<Value>>,
}

// SAFETY: `slots` is only touched by whoever holds the domain (exclusive
// owner, shared-lock holder, or the collector); all other state is atomic or
// guarded by the runtime's claim table.
unsafe impl Send for Domain {}
unsafe impl Sync for Domain {}

impl Domain {
    /// Creates an exclusive domain owned by `owner`.
    ///
    /// `origin` names the object the domain was created for; only that object
    /// may use the sealed fast path.
    pub fn new(owner: ContextId, origin: Option<ObjectId>, slots: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            mode: AtomicU8::new(DomainMode::Exclusive as u8),
            tenure: AtomicU64::new(Tenure::new(owner, 0).0),
            revoked: AtomicU64::new(Tenure::VACANT.0),
            pending: AtomicUsize::new(NOT_PENDING),
            thin: ThinLock::new(),
            count: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            origin,
            slots: UnsafeCell::new(slots),
        })
    }

    /// Current mode.
    #[inline]
    pub fn mode(&self) -> DomainMode {
        if self.is_shared() {
            DomainMode::Shared
        } else {
            DomainMode::Exclusive
        }
    }

    /// `true` once the domain has turned shared. Never reverts.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.mode.load(Ordering::Acquire) == DomainMode::Shared as u8
    }

    /// Exclusive owner, `None` once shared.
    #[inline]
    pub fn owner(&self) -> Option<ContextId> {
        self.tenure().owner()
    }

    /// Exclusive owner together with its nesting depth.
    #[inline]
    pub fn tenure(&self) -> Tenure {
        Tenure(self.tenure.load(Ordering::Acquire))
    }

    /// Exclusive nesting depth of the owner (`0` when shared).
    #[inline]
    pub fn holds(&self) -> usize {
        self.tenure().holds()
    }

    /// Swaps the tenure if it is still `current`.
    pub(crate) fn replace_tenure(&self, current: Tenure, new: Tenure) -> bool {
        self.tenure
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Adds one hold if `cx` is the owner. `Ok(false)` if it is not.
    ///
    /// Claims only swap a tenure with no holds, so once this succeeds the
    /// domain stays with `cx` until the matching release.
    pub(crate) fn try_hold(&self, cx: ContextId) -> crate::Result<bool> {
        loop {
            let current = self.tenure();
            if !current.is_owned_by(cx) {
                return Ok(false);
            }
            let next = current
                .with_holds(current.holds() + 1)
                .ok_or(crate::DomainError::NestingOverflow { max: MAX_HOLDS })?;
            if self.replace_tenure(current, next) {
                return Ok(true);
            }
        }
    }

    /// Drops one hold if `cx` is the owner, unless it is the last one and
    /// `keep_last` is set. Returns `false` when nothing was released.
    pub(crate) fn release_hold(&self, cx: ContextId, keep_last: bool) -> bool {
        loop {
            let current = self.tenure();
            if !current.is_owned_by(cx) || (keep_last && current.holds() <= 1) {
                return false;
            }
            let Some(next) = current.holds().checked_sub(1).and_then(|n| current.with_holds(n))
            else {
                debug_assert!(false, "unbalanced unlock");
                return true;
            };
            if self.replace_tenure(current, next) {
                return true;
            }
        }
    }

    /// Holds `cx` lost when the domain was shared out from under it.
    pub(crate) fn revoked_holds(&self, cx: ContextId) -> usize {
        let revoked = Tenure(self.revoked.load(Ordering::Acquire));
        if revoked.is_owned_by(cx) {
            revoked.holds()
        } else {
            0
        }
    }

    pub(crate) fn set_revoked(&self, tenure: Tenure) {
        self.revoked.store(tenure.0, Ordering::Release);
    }

    /// Consumes one revoked hold of `cx`. `false` if it has none left.
    pub(crate) fn release_revoked(&self, cx: ContextId) -> bool {
        let mut current = self.revoked.load(Ordering::Acquire);
        loop {
            let revoked = Tenure(current);
            if !revoked.is_owned_by(cx) || revoked.holds() == 0 {
                return false;
            }
            match self.revoked.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Nested acquisitions by the current shared-lock holder.
    #[inline]
    pub fn reentrancy(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_reentrancy(&self, count: usize) {
        self.count.store(count, Ordering::Relaxed);
    }

    /// Raw thin lock word (`0` when unlocked).
    #[inline]
    pub fn thin_word(&self) -> usize {
        self.thin.word()
    }

    #[inline]
    pub(crate) fn thin(&self) -> &ThinLock {
        &self.thin
    }

    /// `true` while some context is blocked waiting for this domain to be shared.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed) != NOT_PENDING
    }

    /// Caller must hold the claim table.
    pub(crate) fn pending_slot(&self) -> Option<usize> {
        match self.pending.load(Ordering::Relaxed) {
            NOT_PENDING => None,
            slot => Some(slot),
        }
    }

    /// Caller must hold the claim table.
    pub(crate) fn set_pending_slot(&self, slot: Option<usize>) {
        self.pending.store(slot.unwrap_or(NOT_PENDING), Ordering::Relaxed);
    }

    /// `true` if the slot table is permanently read-only.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Object this domain was created for, if any.
    #[inline]
    pub fn origin(&self) -> Option<ObjectId> {
        self.origin
    }

    /// Flips the mode to shared. Must be the last step of the transition,
    /// after the tenure was vacated.
    pub(crate) fn mark_shared(&self) {
        debug_assert_eq!(self.tenure(), Tenure::VACANT);
        self.mode.store(DomainMode::Shared as u8, Ordering::Release);
    }

    /// # Safety
    /// The caller must hold the domain, or the domain must be sealed.
    #[inline]
    pub(crate) unsafe fn slots(&self) -> &Vec<Value> {
        &*self.slots.get()
    }

    /// # Safety
    /// The caller must hold the domain and not retain any other reference
    /// into the slot table for the lifetime of the result.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slots_mut(&self) -> &mut Vec<Value> {
        &mut *self.slots.get()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("mode", &self.mode())
            .field("owner", &self.owner())
            .field("holds", &self.holds())
            .field("thin_word", &self.thin_word())
            .field("reentrancy", &self.reentrancy())
            .field("pending", &self.is_pending())
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // Waiters keep the domain alive, so an escalated word cannot reach here.
        debug_assert_eq!(
            self.thin.word() & crate::concurrency::sync::WAIT_BIT,
            0,
            "domain dropped with threads queued on its lock"
        );
    }
}
