//! Per-OS-thread identity words for thin locks.
//!
//! A thin lock word stores the owning thread's identity with bit 0 reserved
//! for the waiters flag, so identities are even and never zero.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Waiters-present flag packed into bit 0 of a thin lock word.
pub const WAIT_BIT: usize = 1;

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT: ThreadWord = ThreadWord::allocate();
}

/// Identity of an OS thread as stored in a thin lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadWord(usize);

impl ThreadWord {
    fn allocate() -> Self {
        let n = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
        Self(n << 1)
    }

    /// The calling thread's identity. Stable for the thread's lifetime.
    #[inline]
    pub fn current() -> Self {
        CURRENT.with(|word| *word)
    }

    /// The raw word, waiters bit clear.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// The same identity with the waiters bit set.
    #[inline]
    pub const fn with_wait(self) -> usize {
        self.0 | WAIT_BIT
    }

    /// Strips the waiters bit from a raw lock word.
    #[inline]
    pub const fn strip(word: usize) -> usize {
        word & !WAIT_BIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_even_nonzero_and_stable() {
        let me = ThreadWord::current();
        assert_ne!(me.get(), 0);
        assert_eq!(me.get() & WAIT_BIT, 0);
        assert_eq!(me, ThreadWord::current());
        assert_eq!(ThreadWord::strip(me.with_wait()), me.get());
    }

    #[test]
    fn threads_get_distinct_identities() {
        let me = ThreadWord::current();
        let other = std::thread::spawn(ThreadWord::current).join().unwrap();
        assert_ne!(me, other);
    }
}
