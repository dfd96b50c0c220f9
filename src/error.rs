//! Error type shared by every fallible operation in the crate.

use std::collections::TryReserveError;

/// Errors surfaced by the ownership protocol and its collaborators.
///
/// Only allocation failure and nesting overflow can escape `lock`/`claim`;
/// everything else comes from configuration, context registration or the
/// object slot layer.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    /// Allocating a fat lock, a shard table, or a frozen string buffer failed.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),

    /// A configuration value is out of range.
    #[error("invalid lock configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with it.
        reason: String,
    },

    /// A configuration document could not be parsed.
    #[error("malformed lock configuration")]
    Config(#[from] serde_json::Error),

    /// Slot index past the end of the domain's slot table.
    #[error("slot {index} out of range (domain has {len} slots)")]
    SlotOutOfRange {
        /// Requested slot.
        index: usize,
        /// Slots present.
        len: usize,
    },

    /// Attempted to write through a sealed (read-only) domain.
    #[error("domain is sealed")]
    Sealed,

    /// An exclusive domain was locked more deeply than its tenure can count.
    #[error("exclusive nesting deeper than {max}")]
    NestingOverflow {
        /// Deepest nesting supported.
        max: usize,
    },

    /// The runtime has handed out every context id it can represent.
    #[error("context ids exhausted (limit {max})")]
    ContextsExhausted {
        /// Highest representable id.
        max: usize,
    },

    /// A string exceeded the immutability layer's length limit.
    #[error("string of length {len} exceeds the limit of {max}")]
    StringTooLong {
        /// Length of the rejected string.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Result alias defaulting to [`DomainError`].
pub type Result<T, E = DomainError> = core::result::Result<T, E>;
