//! Runtime configuration for the lock subsystem.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Tunables for a [`Runtime`](crate::Runtime).
///
/// Missing fields in a JSON document fall back to [`LockConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Number of global lock shards striping fat-lock bookkeeping. Power of two.
    pub global_lock_count: usize,
    /// Fat locks preallocated on each shard's free list.
    pub fat_locks_per_shard: usize,
    /// Spin with exponential backoff before escalating a contended thin lock.
    pub spin_before_inflate: bool,
    /// Longest string the default immutability layer will freeze.
    pub max_string_length: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            global_lock_count: 32,
            fat_locks_per_shard: 4,
            spin_before_inflate: true,
            max_string_length: 1 << 30,
        }
    }
}

impl LockConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.global_lock_count == 0 || !self.global_lock_count.is_power_of_two() {
            return Err(DomainError::InvalidConfig {
                reason: format!(
                    "global_lock_count must be a non-zero power of two, got {}",
                    self.global_lock_count
                ),
            });
        }
        if self.max_string_length == 0 {
            return Err(DomainError::InvalidConfig {
                reason: "max_string_length must be non-zero".to_owned(),
            });
        }
        Ok(())
    }

    /// Mask applied to a hashed key to select a shard.
    #[inline]
    pub(crate) fn shard_mask(&self) -> usize {
        self.global_lock_count - 1
    }
}
