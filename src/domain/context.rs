//! Thread-bound execution contexts and their turns.

use core::cell::Cell;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Domain, Runtime};
use crate::concurrency::sync::ThreadWord;

/// Identity of a [`Context`]. Never reused within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(NonZeroUsize);

impl ContextId {
    /// The `n`th id handed out (zero-based).
    pub(crate) fn nth(n: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(n))
    }

    pub(crate) fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    /// Raw integer form.
    #[inline]
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// The part of a context other threads inspect while claiming.
#[derive(Debug)]
pub(crate) struct ContextState {
    pub(crate) id: ContextId,
    pub(crate) thread: ThreadWord,
    turn_depth: AtomicUsize,
}

impl ContextState {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            thread: ThreadWord::current(),
            turn_depth: AtomicUsize::new(0),
        }
    }

    /// `true` while the context is inside an active turn.
    #[inline]
    pub(crate) fn in_turn(&self) -> bool {
        self.turn_depth.load(Ordering::Acquire) > 0
    }
}

/// A thread-bound execution handle.
///
/// Contexts are created by [`Runtime::new_context`] on the thread that will
/// use them and cannot be sent elsewhere. Several contexts may live on one
/// thread; they share that thread's lock identity.
pub struct Context {
    state: Arc<ContextState>,
    runtime: Arc<Runtime>,
    collecting: Cell<bool>,
    /// Address of a sealed self-owned domain "locked" without a lock.
    sealed_cache: Cell<usize>,
    _thread_bound: PhantomData<*const ()>,
}

impl Context {
    pub(crate) fn new(state: Arc<ContextState>, runtime: Arc<Runtime>) -> Self {
        Self {
            state,
            runtime,
            collecting: Cell::new(false),
            sealed_cache: Cell::new(0),
            _thread_bound: PhantomData,
        }
    }

    /// This context's identity.
    #[inline]
    pub fn id(&self) -> ContextId {
        self.state.id
    }

    /// Lock identity of the thread this context is bound to.
    #[inline]
    pub fn thread(&self) -> ThreadWord {
        self.state.thread
    }

    /// The runtime this context belongs to.
    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Marks this context as running the garbage collector.
    ///
    /// While set, lock and unlock are no-ops, slot access goes straight to
    /// the table, and claims never block: a busy owner's domain is shared on
    /// the spot and its holds revoked.
    ///
    /// # Safety
    /// Until the flag is cleared, no other thread may use this runtime's
    /// domains in any way (lock, unlock, claim, share, slot access). They
    /// must be stopped: blocked in a claim, parked by the admission
    /// collaborator (see [`TurnLedger::wait_until_idle`](super::TurnLedger::wait_until_idle)),
    /// or otherwise kept away from the runtime.
    pub unsafe fn set_collecting(&self, collecting: bool) {
        self.collecting.set(collecting);
    }

    /// `true` while this context runs the collector.
    #[inline]
    pub fn is_collecting(&self) -> bool {
        self.collecting.get()
    }

    /// `true` while inside an active turn.
    #[inline]
    pub fn in_turn(&self) -> bool {
        self.state.in_turn()
    }

    /// Current turn nesting depth.
    pub fn turn_depth(&self) -> usize {
        self.state.turn_depth.load(Ordering::Acquire)
    }

    /// Enters a turn. Nests.
    pub fn begin_turn(&self) {
        let depth = self.state.turn_depth.load(Ordering::Relaxed);
        if depth > 0 {
            self.state.turn_depth.store(depth + 1, Ordering::Relaxed);
            return;
        }
        self.runtime.admission().begin_turn(self.id());
        let _table = self.runtime.lock_claims();
        self.state.turn_depth.store(1, Ordering::Release);
    }

    /// Leaves a turn. Leaving the outermost turn shares every domain this
    /// context owns that another context is blocked waiting for.
    pub fn end_turn(&self) {
        let depth = self.state.turn_depth.load(Ordering::Relaxed);
        debug_assert!(depth > 0, "end_turn without a matching begin_turn");
        match depth {
            0 => {}
            1 => {
                {
                    let mut table = self.runtime.lock_claims();
                    self.state.turn_depth.store(0, Ordering::Release);
                    self.runtime.share_waiting(&mut table, self.id(), self.thread());
                }
                self.runtime.admission().end_turn(self.id());
            }
            _ => self.state.turn_depth.store(depth - 1, Ordering::Relaxed),
        }
    }

    /// Enters a turn for the lifetime of the returned guard.
    pub fn turn(&self) -> TurnGuard<'_> {
        self.begin_turn();
        TurnGuard { cx: self }
    }

    /// Domain this context is currently blocked waiting to share, if any.
    pub fn sharing_target(&self) -> Option<Arc<Domain>> {
        self.runtime.sharing_target(self.id())
    }

    /// `true` if `domain` is held through the sealed fast path.
    pub fn sealed_cache_is(&self, domain: &Domain) -> bool {
        self.sealed_cache.get() == domain as *const Domain as usize
    }

    pub(crate) fn sealed_cache_empty(&self) -> bool {
        self.sealed_cache.get() == 0
    }

    pub(crate) fn set_sealed_cache(&self, domain: &Domain) {
        self.sealed_cache.set(domain as *const Domain as usize);
    }

    /// Clears the cache if it holds `domain`.
    pub(crate) fn take_sealed_cache(&self, domain: &Domain) -> bool {
        if self.sealed_cache_is(domain) {
            self.sealed_cache.set(0);
            true
        } else {
            false
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("thread", &self.thread())
            .field("turn_depth", &self.turn_depth())
            .field("collecting", &self.is_collecting())
            .finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.state.in_turn() {
            self.state.turn_depth.store(1, Ordering::Relaxed);
            self.end_turn();
        }
        self.runtime.retire_context(self.id());
    }
}

/// RAII turn; ends the turn on drop.
#[must_use = "the turn ends when the guard is dropped"]
pub struct TurnGuard<'a> {
    cx: &'a Context,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.cx.end_turn();
    }
}
