use domain_lock::{LockConfig, Runtime};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Each thread repeatedly nests the lock to its own depth; no two threads
    /// are ever inside at once and every nesting unwinds completely.
    #[test]
    fn test_nested_locking_is_exclusive(
        depths in proptest::collection::vec(1usize..5, 2..5),
        rounds in 1usize..40,
        spin in any::<bool>(),
    ) {
        let config = LockConfig { spin_before_inflate: spin, ..LockConfig::default() };
        let rt = Runtime::new(config).unwrap();
        let setup = rt.new_context().unwrap();
        let d = rt.new_domain(&setup, Vec::new());
        rt.share(&d, &setup).unwrap();
        let holders = AtomicUsize::new(0);

        thread::scope(|s| {
            for &depth in &depths {
                let (rt, d, holders) = (&rt, &d, &holders);
                s.spawn(move || {
                    let cx = rt.new_context().unwrap();
                    for _ in 0..rounds {
                        rt.lock(d, &cx).unwrap();
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        for level in 2..=depth {
                            rt.lock(d, &cx).unwrap();
                            assert_eq!(d.reentrancy(), level);
                        }
                        holders.fetch_sub(1, Ordering::SeqCst);
                        for _ in 0..depth {
                            rt.unlock(d, &cx);
                        }
                    }
                });
            }
        });

        prop_assert_eq!(d.thin_word(), 0);
        prop_assert_eq!(d.reentrancy(), 0);
        prop_assert_eq!(rt.fat_locks_in_use(), 0);
    }
}
