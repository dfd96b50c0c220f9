use core::sync::atomic::{AtomicUsize, Ordering};

/// One machine word with compare-and-swap.
///
/// Every lock word in the crate is built on this; it carries no state of its
/// own beyond the word.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct AtomicWord {
    inner: AtomicUsize,
}

impl AtomicWord {
    /// Creates a new word.
    #[inline(always)]
    pub const fn new(value: usize) -> Self {
        Self {
            inner: AtomicUsize::new(value),
        }
    }

    /// Loads the current value.
    #[inline(always)]
    pub fn load(&self, order: Ordering) -> usize {
        self.inner.load(order)
    }

    /// Stores a new value.
    #[inline(always)]
    pub fn store(&self, value: usize, order: Ordering) {
        self.inner.store(value, order);
    }

    /// Stores a value if the current value equals `current`.
    #[inline(always)]
    pub fn compare_exchange(
        &self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        self.inner.compare_exchange(current, new, success, failure)
    }

    /// Native CAS: `AcqRel` on success, `Acquire` on failure.
    ///
    /// Returns `true` when the word held `current` and now holds `new`.
    #[inline(always)]
    pub fn cas(&self, current: usize, new: usize) -> bool {
        self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
