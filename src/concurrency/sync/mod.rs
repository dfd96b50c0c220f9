//! Thin/fat lock machinery.
//!
//! [`ThinLock`] is the per-domain word; [`FatLockPool`] holds the OS
//! mutex/condvar pairs it escalates to. Lock identities are per OS thread
//! ([`ThreadWord`]), not per context.

pub mod fat;
pub mod identity;
pub mod thin;

pub use fat::{FatLock, FatLockPool, Shard};
pub use identity::{ThreadWord, WAIT_BIT};
pub use thin::ThinLock;
