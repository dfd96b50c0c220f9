//! Worklist of exclusive domains some context is blocked waiting to share.
//!
//! An indexed intrusive list: each linked domain stores its slot index, so
//! link and unlink are O(1) and a domain is never linked twice. Freed slots
//! are reused through a free list. Only touched under the runtime's claim
//! table lock.

use std::sync::Arc;

use super::{ContextId, Domain};
use crate::error::Result;

#[derive(Debug, Default)]
pub(crate) struct PendingShares {
    slots: Vec<Option<Arc<Domain>>>,
    free: Vec<usize>,
    len: usize,
}

impl PendingShares {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Links `domain` if it is not already on the list.
    pub(crate) fn link(&mut self, domain: &Arc<Domain>) -> Result<()> {
        if domain.pending_slot().is_some() {
            return Ok(());
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(Arc::clone(domain));
                slot
            }
            None => {
                self.slots.try_reserve(1)?;
                let needed = (self.slots.len() + 1).saturating_sub(self.free.len());
                self.free.try_reserve(needed)?;
                self.slots.push(Some(Arc::clone(domain)));
                self.slots.len() - 1
            }
        };
        domain.set_pending_slot(Some(slot));
        self.len += 1;
        Ok(())
    }

    /// Unlinks `domain`. Returns `false` if it was not linked.
    pub(crate) fn unlink(&mut self, domain: &Domain) -> bool {
        let Some(slot) = domain.pending_slot() else {
            return false;
        };
        domain.set_pending_slot(None);
        self.release(slot);
        true
    }

    fn release(&mut self, slot: usize) {
        if self.slots[slot].take().is_some() {
            self.len -= 1;
            // Capacity for every slot was reserved in `link`.
            self.free.push(slot);
        }
    }

    /// Unlinks and returns every pending domain exclusively owned by `owner`.
    pub(crate) fn take_owned_by(&mut self, owner: ContextId) -> Vec<Arc<Domain>> {
        let mut taken = Vec::new();
        for slot in 0..self.slots.len() {
            let owned = self.slots[slot]
                .as_ref()
                .is_some_and(|d| d.owner() == Some(owner));
            if owned {
                if let Some(domain) = self.slots[slot].clone() {
                    domain.set_pending_slot(None);
                    self.release(slot);
                    taken.push(domain);
                }
            }
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
