use quickcheck_macros::quickcheck;
use std::collections::BTreeMap;

use super::*;
use crate::inherit;

stub_system!(mod pooled_lifecycle {
    store: crate::holder::PooledHolders<4>,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 2,
});

#[test]
fn pooled_add_release_restore() {
    use pooled_lifecycle::*;
    reset(&[10, 20, 30]);
    let mut lock = lock();

    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    add_holder(lock.borrow_mut(), sem(0));

    assert_eq!(
        live_holders(lock.borrow_mut(), sem(0)),
        vec![(thread(0) as *const _, 2)]
    );

    release_holder(lock.borrow_mut(), sem(0));

    // The entry lingers with the count spent; only the restore engine
    // frees it
    assert_eq!(
        live_holders(lock.borrow_mut(), sem(0)),
        vec![(thread(0) as *const _, 1)]
    );

    release_holder(lock.borrow_mut(), sem(0));
    assert_eq!(
        live_holders(lock.borrow_mut(), sem(0)),
        vec![(thread(0) as *const _, 0)]
    );

    inherit::restore_baseprio(lock.borrow_mut(), None, sem(0));
    assert!(live_holders(lock.borrow_mut(), sem(0)).is_empty());
}

stub_system!(mod pooled_free_accounting {
    store: crate::holder::PooledHolders<4>,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 2,
});

#[cfg(feature = "holder_debug")]
#[test]
fn pooled_free_list_accounting() {
    use pooled_free_accounting::*;
    reset(&[10, 20, 30]);
    let mut lock = lock();

    assert_eq!(n_free_holders(lock.borrow_mut()), 4);

    for i in 0..3 {
        run_as(i);
        add_holder(lock.borrow_mut(), sem(i % 2));
    }
    assert_eq!(n_free_holders(lock.borrow_mut()), 1);
    enum_holders(lock.borrow_mut(), sem(0));

    destroy_holder(lock.borrow_mut(), sem(0));
    destroy_holder(lock.borrow_mut(), sem(1));
    assert_eq!(n_free_holders(lock.borrow_mut()), 4);
    assert!(live_holders(lock.borrow_mut(), sem(0)).is_empty());
    assert!(live_holders(lock.borrow_mut(), sem(1)).is_empty());
}

stub_system!(mod inline_capacity {
    store: crate::holder::InlineHolders,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 1,
});

#[test]
fn inline_store_capacity_exhausted() {
    use inline_capacity::*;
    reset(&[10, 10, 10]);
    let mut lock = lock();

    for i in 0..3 {
        run_as(i);
        add_holder(lock.borrow_mut(), sem(0));
    }

    // The third holder does not fit; it is silently not tracked
    let live = live_holders(lock.borrow_mut(), sem(0));
    assert_eq!(live.len(), 2);
    assert!(live.contains(&(thread(0) as *const _, 1)));
    assert!(live.contains(&(thread(1) as *const _, 1)));
    assert!(
        <InlineHolders as Store<SystemTraits>>::find(lock.borrow_mut(), sem(0), thread(2))
            .is_none()
    );

    // A repeat acquisition by an existing holder still lands in its entry
    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    assert!(live_holders(lock.borrow_mut(), sem(0)).contains(&(thread(0) as *const _, 2)));
}

stub_system!(mod pooled_capacity {
    store: crate::holder::PooledHolders<2>,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 2,
});

#[test]
fn pooled_store_capacity_exhausted() {
    use pooled_capacity::*;
    reset(&[10, 10, 10]);
    let mut lock = lock();

    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    run_as(1);
    add_holder(lock.borrow_mut(), sem(1));

    // The pool is shared between semaphores and is now dry
    run_as(2);
    add_holder(lock.borrow_mut(), sem(0));
    assert_eq!(live_holders(lock.borrow_mut(), sem(0)).len(), 1);
}

stub_system!(mod destroy_with_holders {
    store: crate::holder::InlineHolders,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 1,
});

#[test]
fn destroy_recovers_stranded_entries() {
    use destroy_with_holders::*;
    reset(&[10, 20, 30]);
    let mut lock = lock();

    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    run_as(1);
    add_holder(lock.borrow_mut(), sem(0));

    destroy_holder(lock.borrow_mut(), sem(0));
    assert!(live_holders(lock.borrow_mut(), sem(0)).is_empty());
    assert!(
        <InlineHolders as Store<SystemTraits>>::find(lock.borrow_mut(), sem(0), thread(0))
            .is_none()
    );

    // The slots are usable again
    run_as(2);
    add_holder(lock.borrow_mut(), sem(0));
    assert_eq!(live_holders(lock.borrow_mut(), sem(0)).len(), 1);
}

stub_system!(mod disabled_flag {
    store: crate::holder::InlineHolders,
    policy: crate::inherit::SingleBoost,
    threads: 2,
    sems: 1,
});

#[test]
fn prioinherit_disable_skips_tracking() {
    use disabled_flag::*;
    reset(&[10, 30]);
    let mut lock = lock();

    sem(0).set_priority_inheritance(lock.borrow_mut(), false);

    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    assert!(live_holders(lock.borrow_mut(), sem(0)).is_empty());

    // With no holders tracked, a waiter's boost finds nothing to do
    run_as(1);
    inherit::boost_priority(lock.borrow_mut(), sem(0));
    assert_eq!(thread(0).effective_priority(&*lock), 10);

    sem(0).set_priority_inheritance(lock.borrow_mut(), true);
    run_as(0);
    add_holder(lock.borrow_mut(), sem(0));
    assert_eq!(live_holders(lock.borrow_mut(), sem(0)).len(), 1);
}

stub_system!(mod qc_store {
    store: crate::holder::PooledHolders<3>,
    policy: crate::inherit::SingleBoost,
    threads: 3,
    sems: 1,
});

/// A modifying operation on the holder store.
#[derive(Debug)]
enum Cmd {
    Add(usize),
    Release(usize),
    Restore(usize),
}

/// Map random bytes to operations on the store.
fn interpret(bytecode: &[u8], num_threads: usize) -> impl Iterator<Item = Cmd> + '_ {
    bytecode.iter().map(move |&b| {
        let thread = (b as usize / 3) % num_threads;
        match b % 3 {
            0 => Cmd::Add(thread),
            1 => Cmd::Release(thread),
            _ => Cmd::Restore(thread),
        }
    })
}

#[quickcheck]
fn qc_store_matches_model(bytecode: Vec<u8>) {
    use qc_store::*;
    const CAPACITY: usize = 3;

    reset(&[10, 10, 10]);
    let mut lock = lock();

    // Reference model: thread index -> outstanding counts. An entry is
    // present iff the store has a live slot for the thread.
    let mut model: BTreeMap<usize, HolderCount> = BTreeMap::new();

    for cmd in interpret(&bytecode, 3) {
        match cmd {
            Cmd::Add(t) => {
                run_as(t);
                add_holder(lock.borrow_mut(), sem(0));
                if let Some(counts) = model.get_mut(&t) {
                    *counts += 1;
                } else if model.len() < CAPACITY {
                    model.insert(t, 1);
                }
            }
            Cmd::Release(t) => {
                run_as(t);
                release_holder(lock.borrow_mut(), sem(0));
                if let Some(counts) = model.get_mut(&t) {
                    if *counts > 0 {
                        *counts -= 1;
                    }
                }
            }
            Cmd::Restore(t) => {
                run_as(t);
                inherit::restore_baseprio(lock.borrow_mut(), None, sem(0));
                if model.get(&t) == Some(&0) {
                    model.remove(&t);
                }
            }
        }

        let mut live = live_holders(lock.borrow_mut(), sem(0));
        live.sort();

        // No thread may appear in more than one entry
        let mut threads: Vec<_> = live.iter().map(|&(htcb, _)| htcb).collect();
        threads.dedup();
        assert_eq!(threads.len(), live.len());

        let mut expected: Vec<_> = model
            .iter()
            .map(|(&t, &counts)| (thread(t) as *const _, counts))
            .collect();
        expected.sort();
        assert_eq!(live, expected, "after {cmd:?}");
    }
}
