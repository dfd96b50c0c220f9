//! Low-level concurrency primitives: the CAS word and the thin/fat locks
//! built from it.
//!
//! Nothing here knows about contexts or domains; see [`crate::domain`] for
//! the ownership protocol layered on top.

pub mod atomic;
pub mod sync;
