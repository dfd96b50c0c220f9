//! Objects: a stable identity pointing at a (replaceable) domain.
//!
//! Several objects may point at one domain (e.g. a prototype's), and an
//! object may be re-pointed at a fresh domain of its own by
//! [`Runtime::branch_object`]. Because the pointer can move while a thread
//! waits for the old domain, [`Runtime::lock_object`] re-checks it after
//! locking and retries.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::domain::{Context, Domain, ObjectId, Runtime};
use crate::error::{DomainError, Result};
use crate::value::Value;

/// A resource handle whose slot table lives in a [`Domain`].
pub struct Object {
    id: ObjectId,
    domain: ArcSwap<Domain>,
}

impl Object {
    pub(crate) fn new(id: ObjectId, domain: Arc<Domain>) -> Self {
        Self {
            id,
            domain: ArcSwap::new(domain),
        }
    }

    /// This object's identity.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The domain the object currently points at.
    pub fn domain(&self) -> Arc<Domain> {
        self.domain.load_full()
    }

    /// `true` if the object currently points at `domain`.
    pub fn points_at(&self, domain: &Arc<Domain>) -> bool {
        Arc::ptr_eq(&*self.domain.load(), domain)
    }

    /// `true` if the current domain was created for this object.
    pub fn owns_domain(&self) -> bool {
        self.domain.load().origin() == Some(self.id)
    }

    fn repoint(&self, domain: Arc<Domain>) {
        self.domain.store(domain);
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("domain", &*self.domain.load())
            .finish()
    }
}

impl Runtime {
    /// Locks whatever domain `obj` points at and returns it.
    ///
    /// A sealed domain created for `obj` is "locked" through the context's
    /// one-entry sealed cache without touching any lock, provided the cache
    /// is free.
    pub fn lock_object(&self, obj: &Object, cx: &Context) -> Result<Arc<Domain>> {
        loop {
            let domain = obj.domain();
            if cx.is_collecting() {
                return Ok(domain);
            }
            if domain.is_sealed() && domain.origin() == Some(obj.id()) && cx.sealed_cache_empty()
            {
                cx.set_sealed_cache(&domain);
                return Ok(domain);
            }
            self.lock(&domain, cx)?;
            if obj.points_at(&domain) {
                return Ok(domain);
            }
            // Re-pointed while we waited.
            self.unlock(&domain, cx);
        }
    }

    /// Unlocks the domain `obj` currently points at.
    pub fn unlock_object(&self, obj: &Object, cx: &Context) {
        self.unlock(&obj.domain(), cx);
    }

    /// `true` if `cx` may touch `obj`'s current slot table right now.
    pub fn is_object_locked(&self, obj: &Object, cx: &Context) -> bool {
        self.is_locked(&obj.domain(), cx)
    }

    /// Slot access that skips the full protocol: the collector, a sealed
    /// domain created for `obj`, an exclusive domain `cx` owns inside a turn,
    /// and a shared domain whose thin lock is free or already this thread's.
    /// `None` if the caller has to lock.
    fn enter_fast(&self, obj: &Object, cx: &Context) -> Option<FastEntry> {
        let domain = obj.domain();
        if cx.is_collecting() || (domain.is_sealed() && domain.origin() == Some(obj.id())) {
            return Some(FastEntry::Direct(domain));
        }
        if !domain.is_shared() {
            // In a turn the owner cannot lose the domain without blocking first.
            let owned = cx.in_turn() && domain.tenure().is_owned_by(cx.id());
            return owned.then_some(FastEntry::Direct(domain));
        }
        let me = cx.thread();
        if domain.thin().is_held_by(me) {
            return Some(FastEntry::Direct(domain));
        }
        if domain.thin().try_acquire(me) {
            if obj.points_at(&domain) {
                return Some(FastEntry::Thin(domain));
            }
            domain.thin().release(me, &self.pool);
        }
        None
    }

    fn leave_fast(&self, entry: FastEntry, cx: &Context) {
        if let FastEntry::Thin(domain) = entry {
            domain.thin().release(cx.thread(), &self.pool);
        }
    }

    /// Reads slot `index` of `obj`.
    pub fn get_slot(&self, obj: &Object, index: usize, cx: &Context) -> Result<Value> {
        if let Some(entry) = self.enter_fast(obj, cx) {
            // SAFETY: `enter_fast` only admits holders and sealed tables.
            let value = read_slot(unsafe { entry.domain().slots() }, index);
            self.leave_fast(entry, cx);
            return value;
        }
        let domain = self.lock_object(obj, cx)?;
        // SAFETY: held by `cx` (or sealed) until the unlock below.
        let value = read_slot(unsafe { domain.slots() }, index);
        self.unlock(&domain, cx);
        value
    }

    /// Overwrites slot `index` of `obj`.
    ///
    /// Strings stored into a shared domain are frozen first; one the
    /// immutability layer refuses is stored as [`Value::Undefined`].
    pub fn set_slot(&self, obj: &Object, index: usize, value: Value, cx: &Context) -> Result<()> {
        if let Some(entry) = self.enter_fast(obj, cx) {
            let result = self.write_slot(entry.domain(), index, value);
            self.leave_fast(entry, cx);
            return result;
        }
        let domain = self.lock_object(obj, cx)?;
        let result = self.write_slot(&domain, index, value);
        self.unlock(&domain, cx);
        result
    }

    /// Caller holds `domain`.
    fn write_slot(&self, domain: &Domain, index: usize, mut value: Value) -> Result<()> {
        if domain.is_sealed() {
            return Err(DomainError::Sealed);
        }
        if domain.is_shared() && value.is_mutable_string() {
            self.freeze_value(&mut value, index);
        }
        // SAFETY: the caller holds the unsealed domain.
        let slots = unsafe { domain.slots_mut() };
        let len = slots.len();
        match slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DomainError::SlotOutOfRange { index, len }),
        }
    }

    /// Appends a slot to `obj` and returns its index.
    pub fn add_slot(&self, obj: &Object, mut value: Value, cx: &Context) -> Result<usize> {
        let domain = self.lock_object(obj, cx)?;
        let result = if domain.is_sealed() {
            Err(DomainError::Sealed)
        } else {
            // SAFETY: held by `cx` until the unlock below.
            let slots = unsafe { domain.slots_mut() };
            if domain.is_shared() && value.is_mutable_string() {
                self.freeze_value(&mut value, slots.len());
            }
            match slots.try_reserve(1) {
                Ok(()) => {
                    slots.push(value);
                    Ok(slots.len() - 1)
                }
                Err(err) => Err(err.into()),
            }
        };
        self.unlock(&domain, cx);
        result
    }

    /// Number of slots in `obj`'s current domain.
    pub fn slot_count(&self, obj: &Object, cx: &Context) -> Result<usize> {
        let domain = self.lock_object(obj, cx)?;
        // SAFETY: held by `cx` (or sealed) until the unlock below.
        let len = unsafe { domain.slots() }.len();
        self.unlock(&domain, cx);
        Ok(len)
    }

    /// Makes `obj`'s slot table permanently read-only.
    ///
    /// Strings in it are frozen first, exactly as when a domain turns shared.
    pub fn seal_object(&self, obj: &Object, cx: &Context) -> Result<()> {
        let domain = self.lock_object(obj, cx)?;
        if !domain.is_sealed() {
            // SAFETY: held by `cx` until the unlock below.
            let slots = unsafe { domain.slots_mut() };
            let (frozen, lost) = self.freeze_slots(slots);
            domain.seal();
            tracing::debug!(object = obj.id().get(), frozen, lost, "object sealed");
        }
        self.unlock(&domain, cx);
        Ok(())
    }

    /// Gives `obj` a private copy of its slot table (copy-on-write).
    ///
    /// `cx` must hold `obj` locked. The new domain is exclusive, owned by
    /// `cx`, and locked on return; the old one has been released by
    /// [`Runtime::transfer`].
    pub fn branch_object(&self, obj: &Object, cx: &Context) -> Result<Arc<Domain>> {
        let old = obj.domain();
        if old.is_sealed() {
            return Err(DomainError::Sealed);
        }
        // SAFETY: the caller holds `old`.
        let source = unsafe { old.slots() };
        let mut slots = Vec::new();
        slots.try_reserve_exact(source.len())?;
        slots.extend(source.iter().cloned());

        let new = Domain::new(cx.id(), Some(obj.id()), slots);
        self.lock(&new, cx)?;
        obj.repoint(Arc::clone(&new));
        self.transfer(Some(&old), &new, cx);
        tracing::debug!(object = obj.id().get(), shared = old.is_shared(), "object branched");
        Ok(new)
    }
}

/// How [`Runtime::enter_fast`] got at the slots.
enum FastEntry {
    /// Nothing to release.
    Direct(Arc<Domain>),
    /// Thin lock taken with one CAS; released on exit.
    Thin(Arc<Domain>),
}

impl FastEntry {
    fn domain(&self) -> &Arc<Domain> {
        match self {
            Self::Direct(domain) | Self::Thin(domain) => domain,
        }
    }
}

fn read_slot(slots: &[Value], index: usize) -> Result<Value> {
    slots.get(index).cloned().ok_or(DomainError::SlotOutOfRange {
        index,
        len: slots.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;

    #[test]
    fn slots_round_trip_on_owned_object() {
        let rt = Runtime::new(LockConfig::default()).unwrap();
        let cx = rt.new_context().unwrap();
        let obj = rt.new_object(&cx, vec![Value::Int(1)]);

        assert!(obj.owns_domain());
        assert_eq!(rt.get_slot(&obj, 0, &cx).unwrap(), Value::Int(1));
        rt.set_slot(&obj, 0, Value::Bool(true), &cx).unwrap();
        assert_eq!(rt.add_slot(&obj, Value::Int(9), &cx).unwrap(), 1);
        assert_eq!(rt.slot_count(&obj, &cx).unwrap(), 2);
        assert_eq!(rt.get_slot(&obj, 0, &cx).unwrap(), Value::Bool(true));

        let err = rt.get_slot(&obj, 5, &cx).unwrap_err();
        assert!(matches!(err, DomainError::SlotOutOfRange { index: 5, len: 2 }));
    }

    #[test]
    fn object_in_foreign_domain_does_not_own_it() {
        let rt = Runtime::new(LockConfig::default()).unwrap();
        let cx = rt.new_context().unwrap();
        let proto = rt.new_object(&cx, Vec::new());
        let child = rt.new_object_in(&proto.domain());

        assert!(!child.owns_domain());
        assert!(child.points_at(&proto.domain()));
        assert_ne!(child.id(), proto.id());
    }

    #[test]
    fn sealed_object_uses_cache_and_rejects_writes() {
        let rt = Runtime::new(LockConfig::default()).unwrap();
        let cx = rt.new_context().unwrap();
        let obj = rt.new_object(&cx, vec![Value::from("frozen soon")]);
        rt.seal_object(&obj, &cx).unwrap();

        let domain = rt.lock_object(&obj, &cx).unwrap();
        assert!(cx.sealed_cache_is(&domain));
        rt.unlock_object(&obj, &cx);
        assert!(!cx.sealed_cache_is(&domain));

        assert!(matches!(
            rt.set_slot(&obj, 0, Value::Int(0), &cx),
            Err(DomainError::Sealed)
        ));
        assert!(matches!(
            rt.add_slot(&obj, Value::Int(0), &cx),
            Err(DomainError::Sealed)
        ));
        let value = rt.get_slot(&obj, 0, &cx).unwrap();
        assert!(value.as_str().is_some_and(|s| s.is_frozen()));
    }

    #[test]
    fn owner_in_turn_reads_without_holding() {
        let rt = Runtime::new(LockConfig::default()).unwrap();
        let cx = rt.new_context().unwrap();
        let _turn = cx.turn();
        let obj = rt.new_object(&cx, vec![Value::Int(3)]);

        rt.set_slot(&obj, 0, Value::Int(4), &cx).unwrap();
        assert_eq!(rt.get_slot(&obj, 0, &cx).unwrap(), Value::Int(4));
        assert_eq!(obj.domain().holds(), 0);
        assert!(!rt.is_object_locked(&obj, &cx));

        rt.lock_object(&obj, &cx).unwrap();
        assert!(rt.is_object_locked(&obj, &cx));
        rt.unlock_object(&obj, &cx);
        assert!(!rt.is_object_locked(&obj, &cx));
    }

    #[test]
    fn shared_slot_access_leaves_thin_lock_free() {
        let rt = Runtime::new(LockConfig::default()).unwrap();
        let cx = rt.new_context().unwrap();
        let obj = rt.new_object(&cx, vec![Value::Int(0)]);
        rt.share(&obj.domain(), &cx).unwrap();

        rt.set_slot(&obj, 0, Value::from("thawed"), &cx).unwrap();
        let value = rt.get_slot(&obj, 0, &cx).unwrap();
        assert!(value.as_str().is_some_and(|s| s.is_frozen()));
        assert_eq!(obj.domain().thin_word(), 0);

        let domain = rt.lock_object(&obj, &cx).unwrap();
        assert!(rt.is_object_locked(&obj, &cx));
        // Nested access reuses this thread's thin lock.
        assert_eq!(rt.get_slot(&obj, 0, &cx).unwrap(), value);
        assert_eq!(domain.reentrancy(), 1);
        rt.unlock(&domain, &cx);
        assert!(!rt.is_object_locked(&obj, &cx));
    }
}
