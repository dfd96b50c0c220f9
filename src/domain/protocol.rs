//! Claim, share, lock, unlock and transfer.
//!
//! # Fast paths
//! - exclusive domain owned by the caller: one CAS on the tenure word to lock
//!   and one to unlock; slot reads inside a turn skip even that
//! - shared domain, uncontended: one CAS to lock, one CAS to unlock
//! - shared domain already held by the caller's thread: counter bump
//! - collector: nothing at all
//!
//! # Claiming
//! An exclusive domain changes hands only while its owner holds none of it
//! and is outside a turn, or when the claimer runs on the owner's own thread.
//! Otherwise the claimer checks whether the owner is (transitively) waiting
//! on something the claimer owns; if so, or if the claimer is the collector,
//! the domain is shared on the spot and the owner's holds are revoked.
//! Otherwise the domain goes on the pending-share list and the owner shares
//! it when its turn ends or, outside a turn, when its last hold goes.

use std::sync::Arc;

use super::runtime::ClaimTable;
use super::stats::Meter;
use super::{ClaimOutcome, Context, Domain, Runtime, Tenure, MAX_HOLDS};
use crate::concurrency::sync::ThreadWord;
use crate::error::{DomainError, Result};
use crate::value::Value;

/// Fate of the exclusive holds outstanding when a domain turns shared.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Holds {
    /// The sharing thread owns them; they become thin lock nesting.
    Keep(ThreadWord),
    /// The owner is blocked or stopped; its matching unlocks become no-ops.
    Revoke,
}

/// What the claimer does with a domain it wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Own,
    Hold,
    Share,
}

impl Runtime {
    /// Tries to become the exclusive owner of `domain`, waiting if needed.
    ///
    /// Returns [`ClaimOutcome::Claimed`] if the domain is (still) exclusive
    /// and now owned by `cx`, or [`ClaimOutcome::NowShared`] if it is shared
    /// and must be locked through its thin lock.
    ///
    /// Ownership never moves while the owner holds the domain, except to
    /// another context on the owner's thread; holds then travel with it.
    /// Outside a turn, ownership lasts only while `cx` holds the domain.
    /// `cx` may hold other domains while it waits here. If that closes a
    /// cycle, those domains are shared and `cx`'s holds on them revoked.
    pub fn claim(&self, domain: &Arc<Domain>, cx: &Context) -> Result<ClaimOutcome> {
        self.claim_for(domain, cx, Intent::Own)
    }

    fn claim_for(&self, domain: &Arc<Domain>, cx: &Context, intent: Intent) -> Result<ClaimOutcome> {
        if domain.is_shared() {
            return Ok(ClaimOutcome::NowShared);
        }
        if intent == Intent::Own && domain.tenure().is_owned_by(cx.id()) {
            return Ok(ClaimOutcome::Claimed);
        }
        self.meter(Meter::ClaimAttempt);

        let mut table = self.lock_claims();
        loop {
            if domain.is_shared() {
                return Ok(ClaimOutcome::NowShared);
            }
            let tenure = domain.tenure();
            // Vacated tenures are marked shared before the claim table is released.
            let Some(owner) = tenure.owner() else {
                debug_assert!(false, "exclusive domain without an owner");
                return Ok(ClaimOutcome::NowShared);
            };

            if owner == cx.id() {
                match intent {
                    Intent::Own => return Ok(ClaimOutcome::Claimed),
                    Intent::Hold => {
                        if domain.try_hold(cx.id())? {
                            return Ok(ClaimOutcome::Claimed);
                        }
                    }
                    Intent::Share => {
                        if self.share_locked(&mut table, domain, tenure, Holds::Keep(cx.thread())) {
                            return Ok(ClaimOutcome::NowShared);
                        }
                    }
                }
                continue;
            }

            let state = table.contexts.get(&owner);
            let same_thread = state.is_some_and(|x| x.thread == cx.thread());
            let busy = state.is_some_and(|x| x.in_turn() || tenure.holds() > 0);

            if same_thread {
                if domain.is_pending() {
                    // The waiters need a share and this thread is the only one
                    // that could end the owner's turn.
                    tracing::debug!(cx = cx.id().get(), owner = owner.get(), "sharing pending domain of same-thread owner");
                    if self.share_locked(&mut table, domain, tenure, Holds::Keep(cx.thread())) {
                        return Ok(ClaimOutcome::NowShared);
                    }
                    continue;
                }
                let holds = tenure.holds() + usize::from(intent == Intent::Hold);
                if holds > MAX_HOLDS {
                    return Err(DomainError::NestingOverflow { max: MAX_HOLDS });
                }
                if domain.replace_tenure(tenure, Tenure::new(cx.id(), holds)) {
                    self.meter(Meter::Claimed);
                    if intent != Intent::Share {
                        return Ok(ClaimOutcome::Claimed);
                    }
                }
                continue;
            }

            if !busy {
                if domain.is_pending() {
                    // Others are already queued on it; never hand it over quietly.
                    tracing::debug!(cx = cx.id().get(), owner = owner.get(), "pending domain's owner went idle");
                    if self.share_locked(&mut table, domain, tenure, Holds::Revoke) {
                        return Ok(ClaimOutcome::NowShared);
                    }
                    continue;
                }
                // A retired owner's holds die with it.
                let holds = usize::from(intent == Intent::Hold);
                if domain.replace_tenure(tenure, Tenure::new(cx.id(), holds)) {
                    self.meter(Meter::Claimed);
                    if intent != Intent::Share {
                        return Ok(ClaimOutcome::Claimed);
                    }
                }
                continue;
            }

            if cx.is_collecting() {
                tracing::debug!(cx = cx.id().get(), owner = owner.get(), "collector forcing share");
                if self.share_locked(&mut table, domain, tenure, Holds::Revoke) {
                    return Ok(ClaimOutcome::NowShared);
                }
                continue;
            }
            if table.would_deadlock(owner, cx.id()) {
                tracing::debug!(cx = cx.id().get(), owner = owner.get(), "sharing to avoid deadlock");
                if self.share_locked(&mut table, domain, tenure, Holds::Revoke) {
                    self.meter(Meter::DeadlockAvoided);
                    return Ok(ClaimOutcome::NowShared);
                }
                continue;
            }

            table.pending.link(domain)?;
            table.sharing_targets.insert(cx.id(), Arc::clone(domain));
            self.meter(Meter::Wait);
            tracing::debug!(cx = cx.id().get(), owner = owner.get(), "waiting for domain to be shared");

            let admitted = cx.in_turn();
            if admitted {
                self.admission().suspend_turn(cx.id());
            }
            table = self.wait_sharing(table);
            if admitted {
                // Resuming may block on a running collector.
                drop(table);
                self.admission().resume_turn(cx.id());
                table = self.lock_claims();
            }
            // Cleared only now so a collector still sees this wait edge while we resume.
            table.sharing_targets.remove(&cx.id());
        }
    }

    /// Turns `domain` shared. No-op if it already is.
    ///
    /// `cx` first claims the domain the way [`claim`](Self::claim) does,
    /// waiting for a busy owner, so nobody inside the domain is disturbed.
    /// Holds `cx` has on it carry over to the shared lock.
    pub fn share(&self, domain: &Arc<Domain>, cx: &Context) -> Result<()> {
        if !domain.is_shared() {
            tracing::debug!(cx = cx.id().get(), "explicit share");
            self.claim_for(domain, cx, Intent::Share)?;
        }
        Ok(())
    }

    /// Shares `domain` if its tenure is still `observed`. Caller holds the
    /// claim table. Returns `false` if the tenure moved and the caller must
    /// look again.
    pub(crate) fn share_locked(
        &self,
        table: &mut ClaimTable,
        domain: &Domain,
        observed: Tenure,
        holds: Holds,
    ) -> bool {
        if domain.is_shared() {
            return true;
        }
        if !domain.replace_tenure(observed, Tenure::VACANT) {
            return false;
        }
        if table.pending.unlink(domain) {
            self.sharing_done.notify_all();
        }
        self.finish_sharing(domain, observed, holds);
        true
    }

    /// Exclusive → shared once the tenure `taken` has been vacated: settle
    /// its holds, reset the lock state, freeze the slots, then flip the mode.
    /// Caller holds the claim table.
    pub(crate) fn finish_sharing(&self, domain: &Domain, taken: Tenure, holds: Holds) {
        let thin = domain.thin();
        match holds {
            Holds::Keep(me) if taken.holds() > 0 => {
                thin.seize(me);
                domain.set_reentrancy(taken.holds());
            }
            _ => {
                thin.reset();
                domain.set_reentrancy(0);
                if taken.holds() > 0 {
                    domain.set_revoked(taken);
                    tracing::debug!(
                        owner = taken.owner().map_or(0, |id| id.get()),
                        holds = taken.holds(),
                        "exclusive holds revoked"
                    );
                }
            }
        }
        // SAFETY: the tenure is vacant and the claim table is held, so no
        // claimer or owner fast path can reach the slots. A revoked owner is
        // blocked in a claim or stopped by the collector.
        let slots = unsafe { domain.slots_mut() };
        let (frozen, lost) = self.freeze_slots(slots);
        domain.mark_shared();
        self.meter(Meter::Shared);
        tracing::debug!(frozen, lost, "domain shared");
    }

    /// Freezes every mutable string slot, substituting the placeholder for
    /// values the immutability layer refuses. Returns (frozen, replaced).
    pub(crate) fn freeze_slots(&self, slots: &mut [Value]) -> (usize, usize) {
        let mut frozen = 0;
        let mut lost = 0;
        for (index, value) in slots.iter_mut().enumerate() {
            if !value.is_mutable_string() {
                continue;
            }
            if self.freeze_value(value, index) {
                frozen += 1;
            } else {
                lost += 1;
            }
        }
        (frozen, lost)
    }

    /// Freezes one string value in place. On refusal the value becomes
    /// [`Value::Undefined`] and `false` is returned.
    pub(crate) fn freeze_value(&self, value: &mut Value, index: usize) -> bool {
        match self.immutability.make_immutable(value) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(index, error = %err, "could not freeze slot value; replacing with undefined");
                *value = Value::Undefined;
                false
            }
        }
    }

    /// Locks `domain` for `cx`.
    ///
    /// On an exclusive domain owned by `cx` this only adds a hold. Otherwise
    /// the domain is claimed, and if that yields a shared domain its thin
    /// lock is taken (or its count bumped if this thread already holds it).
    ///
    /// Locks on different domains may nest. A hold on an exclusive domain is
    /// revoked if that domain has to be shared to break a wait cycle while
    /// `cx` is blocked claiming another one; the matching `unlock` is then a
    /// no-op and the next access locks the shared domain normally.
    pub fn lock(&self, domain: &Arc<Domain>, cx: &Context) -> Result<()> {
        if cx.is_collecting() {
            return Ok(());
        }
        if !domain.is_shared() {
            if domain.try_hold(cx.id())? {
                return Ok(());
            }
            if self.claim_for(domain, cx, Intent::Hold)? == ClaimOutcome::Claimed {
                return Ok(());
            }
        }

        let me = cx.thread();
        let thin = domain.thin();
        if thin.is_held_by(me) {
            debug_assert!(domain.reentrancy() > 0);
            domain.set_reentrancy(domain.reentrancy() + 1);
            return Ok(());
        }
        thin.acquire(me, &self.pool, self.config().spin_before_inflate)?;
        debug_assert_eq!(domain.reentrancy(), 0);
        domain.set_reentrancy(1);
        Ok(())
    }

    /// Releases one level of `cx`'s hold on `domain`.
    pub fn unlock(&self, domain: &Arc<Domain>, cx: &Context) {
        if cx.is_collecting() {
            return;
        }
        if cx.take_sealed_cache(domain) {
            return;
        }
        if !domain.is_shared() {
            // Outside a turn the last hold may owe waiters a share.
            if domain.release_hold(cx.id(), !cx.in_turn()) {
                return;
            }
            if self.unlock_exclusive(domain, cx) {
                return;
            }
        }

        let me = cx.thread();
        let thin = domain.thin();
        if !thin.is_held_by(me) {
            if domain.release_revoked(cx.id()) {
                tracing::trace!(cx = cx.id().get(), "unlock of a revoked hold");
                return;
            }
            debug_assert!(false, "unlock of a domain this thread does not hold");
            return;
        }
        let count = domain.reentrancy();
        debug_assert!(count > 0, "unbalanced unlock");
        if count <= 1 {
            domain.set_reentrancy(0);
            thin.release(me, &self.pool);
        } else {
            domain.set_reentrancy(count - 1);
        }
    }

    /// Exclusive unlock under the claim table: the last hold outside a turn,
    /// or an unlock by another context on the owner's thread. Returns `false`
    /// if the domain turned out to be shared.
    #[cold]
    fn unlock_exclusive(&self, domain: &Domain, cx: &Context) -> bool {
        let mut table = self.lock_claims();
        loop {
            if domain.is_shared() {
                return false;
            }
            let tenure = domain.tenure();
            let Some(owner) = tenure.owner() else {
                return false;
            };
            if owner != cx.id() {
                let same_thread = table
                    .contexts
                    .get(&owner)
                    .map_or(true, |x| x.thread == cx.thread());
                if !same_thread {
                    debug_assert!(false, "unlock of a domain owned on another thread");
                    return true;
                }
            }
            let Some(remaining) = tenure.holds().checked_sub(1) else {
                debug_assert!(false, "unbalanced unlock");
                return true;
            };

            let pending = domain.is_pending();
            // Non-nested use by two contexts on one thread re-claims for `cx`.
            let keeper = if owner == cx.id() || pending { owner } else { cx.id() };
            let released = Tenure::new(keeper, remaining);
            if !domain.replace_tenure(tenure, released) {
                continue;
            }
            if pending && (owner != cx.id() || (remaining == 0 && !cx.in_turn())) {
                tracing::debug!(cx = cx.id().get(), owner = owner.get(), "released pending domain outside its owner's turn");
                self.share_locked(&mut table, domain, released, Holds::Keep(cx.thread()));
            }
            return true;
        }
    }

    /// Drops every hold `cx` has on the exclusive `domain` and returns how
    /// many there were, sharing it if waiters can no longer count on a turn
    /// end.
    fn surrender(&self, domain: &Domain, cx: &Context) -> usize {
        let mut table = self.lock_claims();
        loop {
            let tenure = domain.tenure();
            if domain.is_shared() || !tenure.is_owned_by(cx.id()) {
                return 0;
            }
            let released = Tenure::new(cx.id(), 0);
            if !domain.replace_tenure(tenure, released) {
                continue;
            }
            if domain.is_pending() && !cx.in_turn() {
                self.share_locked(&mut table, domain, released, Holds::Keep(cx.thread()));
            }
            return tenure.holds();
        }
    }

    /// Moves `cx`'s hold from `old` to `new` after copy-on-write branching.
    ///
    /// `new` must already be locked by `cx`. `old` is `None` if its last
    /// reference went away before it was ever locked. `old` ends this call
    /// fully released and its nesting depth becomes `new`'s.
    pub fn transfer(&self, old: Option<&Arc<Domain>>, new: &Arc<Domain>, cx: &Context) {
        let Some(old) = old else {
            return;
        };
        if cx.is_collecting() {
            return;
        }
        debug_assert!(!cx.sealed_cache_is(new));
        if cx.take_sealed_cache(old) {
            return;
        }

        let nesting = if old.is_shared() {
            let me = cx.thread();
            if !old.thin().is_held_by(me) {
                debug_assert!(false, "transfer from a domain this thread does not hold");
                return;
            }
            let nesting = old.reentrancy();
            old.set_reentrancy(0);
            old.thin().release(me, &self.pool);
            nesting
        } else {
            self.surrender(old, cx)
        };
        if nesting == 0 {
            return;
        }

        if new.is_shared() {
            if new.thin().is_held_by(cx.thread()) {
                new.set_reentrancy(nesting);
            }
            return;
        }
        loop {
            let tenure = new.tenure();
            if !tenure.is_owned_by(cx.id()) {
                debug_assert!(false, "transfer into a domain `cx` does not own");
                return;
            }
            let Some(next) = tenure.with_holds(nesting) else {
                return;
            };
            if new.replace_tenure(tenure, next) {
                return;
            }
        }
    }
}
