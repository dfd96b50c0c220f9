//! Thin locks: one CAS word, escalating to a pooled fat lock under contention.
//!
//! # Word states
//! - `0`: free
//! - `me`: owned by thread `me`, nobody waiting
//! - `me | WAIT_BIT`: owned, and a fat lock exists for this word that must be
//!   consulted on release
//!
//! The waiters bit is only ever set while holding the word's pool shard, and a
//! flagged word is only cleared by its owner while holding the same shard. A
//! thread woken from the fat lock re-acquires with the waiters bit already set
//! if others are still suspended, so its own release goes through the slow
//! path and wakes the next one.

use core::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use super::fat::FatLockPool;
use super::identity::{ThreadWord, WAIT_BIT};
use crate::concurrency::atomic::AtomicWord;
use crate::error::Result;

/// A single-word lock owned by an OS thread.
#[derive(Debug, Default)]
pub struct ThinLock {
    word: AtomicWord,
}

impl ThinLock {
    /// Creates a free lock.
    pub const fn new() -> Self {
        Self {
            word: AtomicWord::new(0),
        }
    }

    /// Raw word, for diagnostics.
    #[inline]
    pub fn word(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// Owner identity with the waiters bit stripped (`0` if free).
    #[inline]
    pub fn owner(&self) -> usize {
        ThreadWord::strip(self.word())
    }

    /// `true` if `me` currently owns the word.
    #[inline]
    pub fn is_held_by(&self, me: ThreadWord) -> bool {
        self.owner() == me.get()
    }

    /// Resets to free. Only valid while no thread can observe the word.
    pub(crate) fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Hands the free word to `me` outright. Same precondition as [`reset`](Self::reset).
    pub(crate) fn seize(&self, me: ThreadWord) {
        self.word.store(me.get(), Ordering::Release);
    }

    /// One CAS from free to `me`; never waits.
    #[inline]
    pub fn try_acquire(&self, me: ThreadWord) -> bool {
        self.word.cas(0, me.get())
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquires the lock for `me`, blocking on a fat lock if contended.
    ///
    /// The caller must not already hold the lock; reentrancy is counted a
    /// layer above. Fails only if a fat lock cannot be allocated, in which
    /// case the word is left as it was found.
    pub fn acquire(&self, me: ThreadWord, pool: &FatLockPool, spin: bool) -> Result<()> {
        if self.try_acquire(me) {
            return Ok(());
        }
        debug_assert!(!self.is_held_by(me), "thin lock re-entered by its owner");
        if spin {
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                if self.word.load(Ordering::Relaxed) == 0 && self.word.cas(0, me.get()) {
                    return Ok(());
                }
                backoff.snooze();
            }
        }
        self.enqueue(me, pool)
    }

    #[cold]
    fn enqueue(&self, me: ThreadWord, pool: &FatLockPool) -> Result<()> {
        let key = self.key();
        let mut me_word = me.get();
        let mut shard = pool.shard(key);
        loop {
            let o = self.word.load(Ordering::Acquire);
            if o == 0 {
                if self.word.cas(0, me_word) {
                    return Ok(());
                }
                continue;
            }

            // Reserve the fat lock before advertising contention.
            let fat = shard.allocate(key)?;
            fat.add_suspended();
            if !self.word.cas(o, o | WAIT_BIT) {
                if fat.remove_suspended() == 0 {
                    shard.recycle(key);
                }
                continue;
            }

            // Hold the fat mutex across the shard handoff so a release cannot
            // signal before we are waiting.
            let os = fat.lock_os();
            drop(shard);
            let os = fat.wait(os);
            drop(os);

            shard = pool.shard(key);
            if fat.remove_suspended() == 0 {
                shard.recycle(key);
                me_word = me.get();
            } else {
                me_word = me.with_wait();
            }
        }
    }

    /// Releases the lock held by `me`, waking one waiter if any are queued.
    pub fn release(&self, me: ThreadWord, pool: &FatLockPool) {
        if self.word.cas(me.get(), 0) {
            return;
        }
        if !self.is_held_by(me) {
            debug_assert!(false, "thin lock released by a thread that does not own it");
            return;
        }
        self.dequeue(pool);
    }

    #[cold]
    fn dequeue(&self, pool: &FatLockPool) {
        let key = self.key();
        let shard = pool.shard(key);
        let o = self.word.load(Ordering::Acquire);
        debug_assert_ne!(o & WAIT_BIT, 0);
        // Under the shard only the owner changes a flagged word.
        let cleared = self.word.cas(o, 0);
        debug_assert!(cleared, "flagged thin lock word changed under its shard");
        if let Some(fat) = shard.find(key) {
            let os = fat.lock_os();
            drop(shard);
            fat.notify_one();
            drop(os);
        }
    }
}
