use std::sync::Arc;

use super::protocol::Holds;
use super::*;
use crate::config::LockConfig;
use crate::value::{Immutability, JsString};
use crate::{DomainError, Result};

fn runtime() -> Arc<Runtime> {
    Runtime::new(LockConfig::default()).unwrap()
}

#[test]
fn new_domain_is_exclusive_to_its_creator() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());

    assert_eq!(d.mode(), DomainMode::Exclusive);
    assert_eq!(d.owner(), Some(cx.id()));
    assert_eq!(rt.claim(&d, &cx).unwrap(), ClaimOutcome::Claimed);
    rt.lock(&d, &cx).unwrap();
    rt.lock(&d, &cx).unwrap();
    assert_eq!(d.holds(), 2);
    assert_eq!(d.thin_word(), 0);
    assert_eq!(d.reentrancy(), 0);
    rt.unlock(&d, &cx);
    rt.unlock(&d, &cx);
    assert_eq!(d.holds(), 0);
    assert_eq!(d.owner(), Some(cx.id()));
}

#[test]
fn tenure_packs_owner_and_depth() {
    let id = ContextId::from_raw(7).unwrap();
    let t = Tenure::new(id, 3);
    assert_eq!(t.owner(), Some(id));
    assert_eq!(t.holds(), 3);
    assert!(t.is_owned_by(id));
    assert_eq!(t.with_holds(0).map(Tenure::holds), Some(0));
    assert_eq!(t.with_holds(MAX_HOLDS).map(Tenure::owner), Some(Some(id)));
    assert_eq!(t.with_holds(MAX_HOLDS + 1), None);
    assert_eq!(Tenure::VACANT.owner(), None);

    let last = ContextId::from_raw(MAX_CONTEXT_ID).unwrap();
    assert_eq!(Tenure::new(last, MAX_HOLDS).owner(), Some(last));
}

#[test]
fn idle_owner_hands_over_on_claim() {
    let rt = runtime();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let d = rt.new_domain(&a, Vec::new());

    assert_eq!(rt.claim(&d, &b).unwrap(), ClaimOutcome::Claimed);
    assert_eq!(d.owner(), Some(b.id()));
    assert!(!d.is_shared());

    let stats = rt.stats();
    assert_eq!(stats.claim_attempts, 1);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.shared, 0);
}

#[test]
fn pending_domain_of_idle_owner_is_shared_not_handed_over() {
    use std::sync::mpsc;
    use std::thread;

    let rt = runtime();
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let rt = &rt;
        s.spawn(move || {
            // Alive and idle: no turn, no holds.
            let a = rt.new_context().unwrap();
            tx.send(rt.new_domain(&a, vec![Value::from("queued")])).unwrap();
            done_rx.recv().unwrap();
        });

        let d = rx.recv().unwrap();
        rt.lock_claims().pending.link(&d).unwrap();
        let b = rt.new_context().unwrap();
        assert_eq!(rt.claim(&d, &b).unwrap(), ClaimOutcome::NowShared);
        assert!(d.is_shared());
        assert_eq!(d.thin_word(), 0);
        assert_eq!(rt.pending_shares(), 0);
        assert_eq!(rt.stats().claimed, 0);
        done_tx.send(()).unwrap();
    });
}

#[test]
fn same_thread_contexts_alias_ownership() {
    let rt = runtime();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let d = rt.new_domain(&a, Vec::new());

    let _turn = a.turn();
    rt.lock(&d, &a).unwrap();
    assert_eq!(rt.claim(&d, &b).unwrap(), ClaimOutcome::Claimed);
    assert_eq!(d.owner(), Some(b.id()));
    assert_eq!(d.holds(), 1, "holds travel with a same-thread handover");
    assert!(rt.is_locked(&d, &a));

    // `a` unlocking after `b` re-claimed: ownership quietly returns to `a`.
    rt.unlock(&d, &a);
    assert_eq!(d.owner(), Some(a.id()));
    assert_eq!(d.holds(), 0);
}

#[test]
fn same_thread_claim_shares_pending_domain() {
    let rt = runtime();
    let owner = rt.new_context().unwrap();
    let other = rt.new_context().unwrap();
    let d = rt.new_domain(&owner, Vec::new());

    let _turn = owner.turn();
    rt.lock(&d, &owner).unwrap();
    rt.lock_claims().pending.link(&d).unwrap();

    assert_eq!(rt.claim(&d, &other).unwrap(), ClaimOutcome::NowShared);
    assert!(d.is_shared());
    assert_eq!(rt.pending_shares(), 0);
    // The owner's hold became this thread's thin lock nesting.
    assert_eq!(d.thin_word(), owner.thread().get());
    assert_eq!(d.reentrancy(), 1);
    rt.unlock(&d, &owner);
    assert_eq!(d.thin_word(), 0);
}

#[test]
fn unlock_after_turn_shares_pending_domain_of_same_thread_owner() {
    let rt = runtime();
    let x = rt.new_context().unwrap();
    let y = rt.new_context().unwrap();
    let d = rt.new_domain(&x, Vec::new());

    x.begin_turn();
    rt.lock(&d, &x).unwrap();
    {
        let _turn = y.turn();
        assert_eq!(rt.claim(&d, &y).unwrap(), ClaimOutcome::Claimed);
        // Another thread starts waiting on it while `y` owns it.
        rt.lock_claims().pending.link(&d).unwrap();
        x.end_turn();

        // `x` releasing must not hand a pending domain back to a context
        // whose turn is over.
        rt.unlock(&d, &x);
        assert!(d.is_shared());
        assert_eq!(rt.pending_shares(), 0);
    }
    assert_eq!(d.thin_word(), 0);
    assert_eq!(d.reentrancy(), 0);
}

#[test]
fn last_unlock_outside_turn_shares_pending_domain() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());

    rt.lock(&d, &cx).unwrap();
    rt.lock(&d, &cx).unwrap();
    rt.lock_claims().pending.link(&d).unwrap();

    rt.unlock(&d, &cx);
    assert!(!d.is_shared());
    rt.unlock(&d, &cx);
    assert!(d.is_shared());
    assert_eq!(rt.pending_shares(), 0);
    assert_eq!(d.thin_word(), 0);
}

#[test]
fn share_is_idempotent_and_monotonic() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());

    rt.share(&d, &cx).unwrap();
    assert_eq!(d.mode(), DomainMode::Shared);
    assert_eq!(d.owner(), None);
    rt.share(&d, &cx).unwrap();
    assert!(d.is_shared());
    assert_eq!(rt.stats().shared, 1);

    assert_eq!(rt.claim(&d, &cx).unwrap(), ClaimOutcome::NowShared);
    rt.lock(&d, &cx).unwrap();
    rt.unlock(&d, &cx);
    assert!(d.is_shared());
}

#[test]
fn share_keeps_the_sharers_holds() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());

    rt.lock(&d, &cx).unwrap();
    rt.lock(&d, &cx).unwrap();
    rt.share(&d, &cx).unwrap();
    assert_eq!(d.thin_word(), cx.thread().get());
    assert_eq!(d.reentrancy(), 2);
    assert!(rt.is_locked(&d, &cx));

    rt.unlock(&d, &cx);
    rt.unlock(&d, &cx);
    assert_eq!(d.thin_word(), 0);
    assert!(!rt.is_locked(&d, &cx));
}

#[test]
fn shared_lock_is_reentrant() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());
    rt.share(&d, &cx).unwrap();

    for n in 1..=5 {
        rt.lock(&d, &cx).unwrap();
        assert_eq!(d.reentrancy(), n);
        assert_eq!(d.thin_word(), cx.thread().get());
    }
    for n in (0..5).rev() {
        rt.unlock(&d, &cx);
        assert_eq!(d.reentrancy(), n);
    }
    assert_eq!(d.thin_word(), 0);
}

#[test]
fn revoked_holds_unlock_quietly() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let d = rt.new_domain(&cx, Vec::new());
    rt.lock(&d, &cx).unwrap();

    // What a deadlock-breaking claimer does while `cx` is blocked elsewhere.
    {
        let mut table = rt.lock_claims();
        assert!(rt.share_locked(&mut table, &d, d.tenure(), Holds::Revoke));
    }
    assert!(d.is_shared());
    assert_eq!(d.thin_word(), 0);
    assert_eq!(d.revoked_holds(cx.id()), 1);
    assert!(!rt.is_locked(&d, &cx));

    rt.unlock(&d, &cx);
    assert_eq!(d.revoked_holds(cx.id()), 0);

    rt.lock(&d, &cx).unwrap();
    assert_eq!(d.thin_word(), cx.thread().get());
    rt.unlock(&d, &cx);
    assert_eq!(d.thin_word(), 0);
}

#[test]
fn transfer_moves_count_to_shared_target() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let old = rt.new_domain(&cx, Vec::new());
    let new = rt.new_domain(&cx, Vec::new());
    rt.share(&old, &cx).unwrap();
    rt.share(&new, &cx).unwrap();

    for _ in 0..3 {
        rt.lock(&old, &cx).unwrap();
    }
    rt.lock(&new, &cx).unwrap();
    rt.transfer(Some(&old), &new, &cx);

    assert_eq!(new.reentrancy(), 3);
    assert_eq!(old.reentrancy(), 0);
    assert_eq!(old.thin_word(), 0);
}

#[test]
fn transfer_into_owned_domain_moves_nesting_to_holds() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let old = rt.new_domain(&cx, Vec::new());
    rt.share(&old, &cx).unwrap();
    rt.lock(&old, &cx).unwrap();
    rt.lock(&old, &cx).unwrap();

    let new = rt.new_domain(&cx, Vec::new());
    rt.lock(&new, &cx).unwrap();
    rt.transfer(Some(&old), &new, &cx);

    assert_eq!(new.reentrancy(), 0);
    assert_eq!(new.holds(), 2);
    assert_eq!(old.thin_word(), 0);
}

#[test]
fn transfer_from_owned_domain_releases_it() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let old = rt.new_domain(&cx, Vec::new());
    rt.lock(&old, &cx).unwrap();
    rt.lock(&old, &cx).unwrap();

    let new = rt.new_domain(&cx, Vec::new());
    rt.lock(&new, &cx).unwrap();
    rt.transfer(Some(&old), &new, &cx);

    assert_eq!(old.holds(), 0);
    assert_eq!(old.owner(), Some(cx.id()));
    assert_eq!(new.holds(), 2);
}

#[test]
fn transfer_without_old_domain_is_noop() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let new = rt.new_domain(&cx, Vec::new());
    rt.transfer(None, &new, &cx);
    assert_eq!(new.owner(), Some(cx.id()));
}

#[test]
fn collector_bypasses_everything() {
    let rt = runtime();
    let owner = rt.new_context().unwrap();
    let gc = rt.new_context().unwrap();
    let d = rt.new_domain(&owner, Vec::new());
    rt.share(&d, &owner).unwrap();

    // SAFETY: single-threaded; nothing else touches the runtime meanwhile.
    unsafe { gc.set_collecting(true) };
    rt.lock(&d, &gc).unwrap();
    assert_eq!(d.thin_word(), 0);
    assert_eq!(d.reentrancy(), 0);
    assert!(rt.is_locked(&d, &gc));
    rt.unlock(&d, &gc);
    assert_eq!(d.thin_word(), 0);

    let other = rt.new_domain(&owner, Vec::new());
    assert_eq!(rt.claim(&other, &gc).unwrap(), ClaimOutcome::Claimed);
}

#[test]
fn share_freezes_strings() {
    let rt = runtime();
    let cx = rt.new_context().unwrap();
    let s = JsString::new("abc");
    let d = rt.new_domain(&cx, vec![Value::Str(s.clone()), Value::Int(4)]);

    rt.share(&d, &cx).unwrap();
    assert!(s.is_frozen());
    let grown = s.append("d");
    assert_eq!(s.text(), "abc");
    assert_eq!(grown.text(), "abcd");
}

struct RefuseAll;

impl Immutability for RefuseAll {
    fn make_immutable(&self, _value: &Value) -> Result<()> {
        Err(DomainError::StringTooLong { len: 0, max: 0 })
    }
}

#[test]
fn refused_values_become_undefined() {
    let rt = Runtime::builder()
        .immutability(Arc::new(RefuseAll))
        .build()
        .unwrap();
    let cx = rt.new_context().unwrap();
    let obj = rt.new_object(&cx, vec![Value::from("gone"), Value::Int(7)]);

    rt.share(&obj.domain(), &cx).unwrap();
    assert_eq!(rt.get_slot(&obj, 0, &cx).unwrap(), Value::Undefined);
    assert_eq!(rt.get_slot(&obj, 1, &cx).unwrap(), Value::Int(7));

    // Strings written into a shared domain go through the same layer.
    rt.set_slot(&obj, 1, Value::from("also gone"), &cx).unwrap();
    assert_eq!(rt.get_slot(&obj, 1, &cx).unwrap(), Value::Undefined);
}

#[test]
fn deadlock_detection_follows_sharing_targets() {
    let rt = runtime();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let c = rt.new_context().unwrap();
    let owned_by_a = rt.new_domain(&a, Vec::new());
    let owned_by_b = rt.new_domain(&b, Vec::new());

    let mut table = rt.lock_claims();
    assert!(!table.would_deadlock(b.id(), a.id()));

    // b waits on a's domain; a waiting on b's would close the cycle.
    table.sharing_targets.insert(b.id(), Arc::clone(&owned_by_a));
    assert!(table.would_deadlock(b.id(), a.id()));
    assert!(!table.would_deadlock(b.id(), c.id()));

    // c → b → a: a blocking on c's domain is a cycle too.
    table.sharing_targets.insert(c.id(), Arc::clone(&owned_by_b));
    assert!(table.would_deadlock(c.id(), a.id()));
}

#[test]
fn turns_nest_and_notify_admission() {
    let ledger = Arc::new(TurnLedger::new());
    let rt = Runtime::builder().admission(ledger.clone()).build().unwrap();
    let cx = rt.new_context().unwrap();

    cx.begin_turn();
    cx.begin_turn();
    assert_eq!(cx.turn_depth(), 2);
    assert_eq!(ledger.active_turns(), 1);
    cx.end_turn();
    assert!(cx.in_turn());
    cx.end_turn();
    assert!(!cx.in_turn());
    assert_eq!(ledger.active_turns(), 0);

    {
        let _turn = cx.turn();
        assert_eq!(ledger.active_turns(), 1);
    }
    assert_eq!(ledger.active_turns(), 0);
}

#[test]
fn dropping_a_context_retires_it() {
    let rt = runtime();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    assert_eq!(rt.context_count(), 2);

    a.begin_turn();
    drop(a);
    assert_eq!(rt.context_count(), 1);
    drop(b);
    assert_eq!(rt.context_count(), 0);
}
