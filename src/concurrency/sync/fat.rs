//! Fat locks and the sharded pool they live in.
//!
//! A fat lock is an OS mutex plus condition variable, created only once a thin
//! lock is contended. Fat locks are keyed by the address of the thin lock word
//! they serve and striped across a power-of-two table of shards ("global
//! locks"). A shard's mutex guards its in-use table, its free list, and every
//! `suspended` count of the fat locks it hands out.
//!
//! Lock order: shard mutex, then fat lock mutex. Nothing acquires a shard
//! while holding a fat lock mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;

use crate::config::LockConfig;
use crate::error::Result;

/// An OS mutex/condvar pair a contended thin lock escalates to.
#[derive(Debug, Default)]
pub struct FatLock {
    mutex: Mutex<()>,
    cond: Condvar,
    suspended: AtomicUsize,
}

impl FatLock {
    fn new() -> Self {
        Self::default()
    }

    /// Threads currently suspended (or about to suspend) on this lock.
    #[inline]
    pub fn suspended(&self) -> usize {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Caller must hold the owning shard.
    pub(crate) fn add_suspended(&self) {
        self.suspended.fetch_add(1, Ordering::Relaxed);
    }

    /// Caller must hold the owning shard. Returns the remaining count.
    pub(crate) fn remove_suspended(&self) -> usize {
        let prev = self.suspended.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "fat lock suspended count underflow");
        prev - 1
    }

    pub(crate) fn lock_os(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_one(&self) {
        self.cond.notify_one();
    }
}

/// One stripe of the pool.
#[derive(Debug, Default)]
pub struct Shard {
    in_use: HashMap<usize, Arc<FatLock>>,
    free: Vec<Arc<FatLock>>,
}

impl Shard {
    /// Returns the fat lock serving `key`, allocating one if none is in use.
    ///
    /// Pops the free list before constructing. On allocation failure the shard
    /// is left unchanged.
    pub fn allocate(&mut self, key: usize) -> Result<Arc<FatLock>> {
        if let Some(fat) = self.in_use.get(&key) {
            return Ok(Arc::clone(fat));
        }
        self.in_use.try_reserve(1)?;
        let fat = match self.free.pop() {
            Some(fat) => fat,
            None => Arc::new(FatLock::new()),
        };
        tracing::trace!(key, "inflated thin lock");
        self.in_use.insert(key, Arc::clone(&fat));
        Ok(fat)
    }

    /// Looks up the fat lock serving `key` without allocating.
    pub fn find(&self, key: usize) -> Option<Arc<FatLock>> {
        self.in_use.get(&key).cloned()
    }

    /// Returns the fat lock serving `key` to the free list.
    ///
    /// Must only be called once its suspended count has dropped to zero.
    pub fn recycle(&mut self, key: usize) {
        let Some(fat) = self.in_use.remove(&key) else {
            return;
        };
        debug_assert_eq!(fat.suspended(), 0, "recycled a fat lock with suspended threads");
        tracing::trace!(key, "deflated thin lock");
        if self.free.try_reserve(1).is_ok() {
            self.free.push(fat);
        }
    }

    /// Fat locks currently bound to a thin lock.
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Fat locks parked on the free list.
    pub fn free(&self) -> usize {
        self.free.len()
    }
}

/// Sharded table of fat locks, allocated on demand and recycled per shard.
#[derive(Debug)]
pub struct FatLockPool {
    shards: Box<[CachePadded<Mutex<Shard>>]>,
    mask: usize,
}

impl FatLockPool {
    /// Builds the shard table and preallocates each shard's free list.
    pub fn new(config: &LockConfig) -> Result<Self> {
        config.validate()?;
        let count = config.global_lock_count;
        let mut shards = Vec::new();
        shards.try_reserve_exact(count)?;
        for _ in 0..count {
            let mut free = Vec::new();
            free.try_reserve_exact(config.fat_locks_per_shard)?;
            free.extend((0..config.fat_locks_per_shard).map(|_| Arc::new(FatLock::new())));
            shards.push(CachePadded::new(Mutex::new(Shard {
                in_use: HashMap::new(),
                free,
            })));
        }
        Ok(Self {
            shards: shards.into_boxed_slice(),
            mask: config.shard_mask(),
        })
    }

    #[inline]
    fn index(&self, key: usize) -> usize {
        ((key >> 3) ^ (key >> 11)) & self.mask
    }

    /// Locks the shard responsible for `key`.
    pub fn shard(&self, key: usize) -> MutexGuard<'_, Shard> {
        self.shards[self.index(key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Fat locks bound to a thin lock across all shards.
    pub fn in_use(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).in_use())
            .sum()
    }

    /// Fat locks on free lists across all shards.
    pub fn free(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).free())
            .sum()
    }
}
