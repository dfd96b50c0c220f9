//! # `domain-lock` - Hybrid Ownership Locking
//!
//! Per-object locking for a multi-threaded runtime that lets single-threaded
//! code pay nothing for it. Every object's slot table lives in a [`Domain`],
//! which starts out owned by one [`Context`] and needs no synchronization at
//! all while that stays true. Only when another thread's context needs it is
//! the domain either handed over or escalated to a shared lock.
//!
//! ## Tiers
//!
//! 1. **Exclusive**: a domain owned by the current context. Lock and unlock
//!    adjust a nesting depth packed beside the owner's id; no lock word is
//!    touched, and slot reads inside a turn skip even that.
//! 2. **Shared, uncontended**: a [`ThinLock`](concurrency::sync::ThinLock),
//!    one machine word taken and released with a single CAS each, plus a
//!    reentrancy count.
//! 3. **Shared, contended**: the thin lock inflates into a pooled fat lock
//!    (mutex + condition variable) looked up through a small set of sharded
//!    global locks. The fat lock goes back to its shard's free list when the
//!    last waiter leaves.
//!
//! ## Escalation
//!
//! A context that wants a domain owned by a busy context on another thread
//! either waits for the owner to finish its turn (the owner then shares the
//! domain) or, when waiting would deadlock or the claimer is the garbage
//! collector, shares the domain on the spot. Sharing freezes every mutable
//! string in the domain through the [`Immutability`] collaborator; values it
//! refuses are replaced by [`Value::Undefined`]. Shared domains never become
//! exclusive again.
//!
//! Nesting locks on two domains is allowed. If the outer one is shared out
//! from under a context blocked claiming the inner one, the outer hold is
//! revoked: its `unlock` becomes a no-op and further access re-locks.
//!
//! ## Example
//!
//! ```
//! use domain_lock::{LockConfig, Runtime, Value};
//!
//! # fn main() -> domain_lock::Result<()> {
//! let rt = Runtime::new(LockConfig::default())?;
//! let cx = rt.new_context()?;
//! let _turn = cx.turn();
//!
//! let obj = rt.new_object(&cx, vec![Value::Int(1)]);
//! rt.set_slot(&obj, 0, Value::from("hello"), &cx)?;
//! assert_eq!(rt.get_slot(&obj, 0, &cx)?, Value::from("hello"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod concurrency;
pub mod config;
pub mod domain;
pub mod error;
pub mod object;
pub mod value;

pub use config::LockConfig;
pub use domain::{
    Admission, ClaimOutcome, Context, ContextId, Domain, DomainMode, LockStats, ObjectId, Runtime,
    RuntimeBuilder, Tenure, TurnGuard, TurnLedger,
};
pub use error::{DomainError, Result};
pub use object::Object;
pub use value::{FreezeStrings, Immutability, JsString, Value};

// Compile-time layout checks.
const _: () = {
    use core::mem;

    // A thin lock is exactly one machine word.
    assert!(mem::size_of::<concurrency::sync::ThinLock>() == mem::size_of::<usize>());
    assert!(mem::size_of::<concurrency::atomic::AtomicWord>() == mem::size_of::<usize>());

    // Ids keep the niche so `Option<Id>` stays word-sized.
    assert!(mem::size_of::<Option<ContextId>>() == mem::size_of::<usize>());
    assert!(mem::size_of::<Option<ObjectId>>() == mem::size_of::<usize>());

    // Every context id fits beside a full nesting depth.
    assert!(domain::MAX_CONTEXT_ID > 0 && domain::MAX_HOLDS > 0);
};
