//! The process-wide structure the protocol runs against.
//!
//! Two tiers of locking: each domain has its own thin lock, while the claim
//! table (context registry, pending-share worklist, sharing targets) and the
//! fat lock shards each have their own coarser mutexes. Domain escalation
//! never needs the domain's own lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::context::{Context, ContextId, ContextState};
use super::pending::PendingShares;
use super::protocol::Holds;
use super::stats::{LockStats, Meter, Meters};
use super::turn::{Admission, TurnLedger};
use super::{Domain, ObjectId, Tenure, MAX_CONTEXT_ID};
use crate::concurrency::sync::{FatLockPool, ThreadWord};
use crate::config::LockConfig;
use crate::error::{DomainError, Result};
use crate::object::Object;
use crate::value::{FreezeStrings, Immutability, Value};

/// Bookkeeping guarded by the claim lock.
#[derive(Debug)]
pub(crate) struct ClaimTable {
    pub(crate) contexts: HashMap<ContextId, Arc<ContextState>>,
    pub(crate) pending: PendingShares,
    pub(crate) sharing_targets: HashMap<ContextId, Arc<Domain>>,
}

impl ClaimTable {
    fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            pending: PendingShares::new(),
            sharing_targets: HashMap::new(),
        }
    }

    /// `true` if blocking `cx` on a domain owned by `owner` would close a
    /// wait cycle: following owner → the domain it waits for → that domain's
    /// owner → ... reaches `cx`.
    pub(crate) fn would_deadlock(&self, owner: ContextId, cx: ContextId) -> bool {
        let mut current = owner;
        for _ in 0..=self.sharing_targets.len() {
            let Some(target) = self.sharing_targets.get(&current) else {
                return false;
            };
            match target.owner() {
                Some(next) if next == cx => return true,
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }
}

/// Shared state for one set of cooperating contexts.
pub struct Runtime {
    config: LockConfig,
    pub(crate) pool: FatLockPool,
    claims: Mutex<ClaimTable>,
    /// Broadcast whenever a pending domain is shared or a context retires.
    pub(crate) sharing_done: Condvar,
    admission: Arc<dyn Admission>,
    pub(crate) immutability: Arc<dyn Immutability>,
    meters: Meters,
    next_context: AtomicUsize,
    next_object: AtomicUsize,
}

impl Runtime {
    /// A runtime with the default collaborators.
    pub fn new(config: LockConfig) -> Result<Arc<Self>> {
        Self::builder().config(config).build()
    }

    /// Starts building a runtime with custom collaborators.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Active configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// The turn admission collaborator.
    pub fn admission(&self) -> &Arc<dyn Admission> {
        &self.admission
    }

    pub(crate) fn lock_claims(&self) -> MutexGuard<'_, ClaimTable> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_sharing<'a>(
        &self,
        table: MutexGuard<'a, ClaimTable>,
    ) -> MutexGuard<'a, ClaimTable> {
        self.sharing_done
            .wait(table)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a context bound to the calling thread.
    ///
    /// Fails once [`MAX_CONTEXT_ID`] contexts have been created.
    pub fn new_context(self: &Arc<Self>) -> Result<Context> {
        let n = self.next_context.fetch_add(1, Ordering::Relaxed);
        if n >= MAX_CONTEXT_ID {
            return Err(DomainError::ContextsExhausted {
                max: MAX_CONTEXT_ID,
            });
        }
        let id = ContextId::nth(n);
        let state = Arc::new(ContextState::new(id));
        self.lock_claims().contexts.insert(id, Arc::clone(&state));
        tracing::debug!(cx = id.get(), thread = state.thread.get(), "context registered");
        Ok(Context::new(state, Arc::clone(self)))
    }

    /// Removes a context from the registry; domains it owned become claimable.
    pub(crate) fn retire_context(&self, id: ContextId) {
        {
            let mut table = self.lock_claims();
            table.contexts.remove(&id);
            table.sharing_targets.remove(&id);
        }
        self.sharing_done.notify_all();
        tracing::debug!(cx = id.get(), "context retired");
    }

    /// Contexts currently registered.
    pub fn context_count(&self) -> usize {
        self.lock_claims().contexts.len()
    }

    /// Creates an exclusive domain owned by `cx`, not tied to any object.
    pub fn new_domain(&self, cx: &Context, slots: Vec<Value>) -> Arc<Domain> {
        Domain::new(cx.id(), None, slots)
    }

    /// Creates an object with its own exclusive domain owned by `cx`.
    pub fn new_object(&self, cx: &Context, slots: Vec<Value>) -> Object {
        let id = self.next_object_id();
        Object::new(id, Domain::new(cx.id(), Some(id), slots))
    }

    /// Creates an object that shares an existing domain (e.g. a prototype's).
    pub fn new_object_in(&self, domain: &Arc<Domain>) -> Object {
        Object::new(self.next_object_id(), Arc::clone(domain))
    }

    fn next_object_id(&self) -> ObjectId {
        ObjectId::nth(self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    /// Domain the context `id` is blocked waiting to share, if any.
    pub fn sharing_target(&self, id: ContextId) -> Option<Arc<Domain>> {
        self.lock_claims().sharing_targets.get(&id).cloned()
    }

    /// Domains currently on the pending-share worklist.
    pub fn pending_shares(&self) -> usize {
        self.lock_claims().pending.len()
    }

    /// Fat locks currently bound to a contended thin lock.
    pub fn fat_locks_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Protocol counters accumulated since the runtime was built.
    pub fn stats(&self) -> LockStats {
        self.meters.snapshot()
    }

    #[inline]
    pub(crate) fn meter(&self, meter: Meter) {
        self.meters.bump(meter);
    }

    /// `true` if `cx` may touch `domain`'s slots right now.
    ///
    /// The collector holds everything. A sealed domain held through the
    /// sealed cache counts. Exclusive domains count while held by `cx` or
    /// another context on its thread; shared ones while the thin lock
    /// belongs to `cx`'s thread.
    pub fn is_locked(&self, domain: &Domain, cx: &Context) -> bool {
        if cx.is_collecting() || cx.sealed_cache_is(domain) {
            return true;
        }
        if domain.is_shared() {
            return domain.thin().is_held_by(cx.thread());
        }
        let tenure = domain.tenure();
        if tenure.holds() == 0 {
            return false;
        }
        match tenure.owner() {
            Some(owner) if owner == cx.id() => true,
            Some(owner) => self
                .lock_claims()
                .contexts
                .get(&owner)
                .is_some_and(|state| state.thread == cx.thread()),
            None => false,
        }
    }

    /// Shares every pending domain owned by `owner` and wakes waiters.
    ///
    /// Runs on `owner`'s thread, so holds it still has carry over into the
    /// thin lock.
    pub(crate) fn share_waiting(&self, table: &mut ClaimTable, owner: ContextId, me: ThreadWord) {
        let owned = table.pending.take_owned_by(owner);
        if owned.is_empty() {
            return;
        }
        for domain in &owned {
            let tenure = domain.tenure();
            if domain.replace_tenure(tenure, Tenure::VACANT) {
                self.finish_sharing(domain, tenure, Holds::Keep(me));
            }
        }
        tracing::debug!(cx = owner.get(), shared = owned.len(), "turn ended with waiters");
        self.sharing_done.notify_all();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: LockConfig,
    admission: Option<Arc<dyn Admission>>,
    immutability: Option<Arc<dyn Immutability>>,
}

impl RuntimeBuilder {
    /// Replaces the configuration.
    pub fn config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a custom turn admission collaborator instead of a [`TurnLedger`].
    pub fn admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Uses a custom immutability layer instead of [`FreezeStrings`].
    pub fn immutability(mut self, immutability: Arc<dyn Immutability>) -> Self {
        self.immutability = Some(immutability);
        self
    }

    /// Validates the configuration and builds the runtime.
    pub fn build(self) -> Result<Arc<Runtime>> {
        let pool = FatLockPool::new(&self.config)?;
        let admission = self
            .admission
            .unwrap_or_else(|| Arc::new(TurnLedger::new()));
        let immutability = self
            .immutability
            .unwrap_or_else(|| Arc::new(FreezeStrings::new(self.config.max_string_length)));
        Ok(Arc::new(Runtime {
            config: self.config,
            pool,
            claims: Mutex::new(ClaimTable::new()),
            sharing_done: Condvar::new(),
            admission,
            immutability,
            meters: Meters::default(),
            next_context: AtomicUsize::new(0),
            next_object: AtomicUsize::new(0),
        }))
    }
}
