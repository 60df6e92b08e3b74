//! Isolation Tests
//!
//! - A read invalidated by a later commit aborts the reader at commit
//! - Running transactions never see a mix of old and new values
//! - Write skew is observable when allowed and prevented when not

use crate::common::*;
use orecstm::ConflictKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// ============================================================================
// Stale Reads
// ============================================================================

#[test]
fn stale_read_aborts_at_commit() {
    let stm = stm_with(fat_config());
    let x = TxnRef::new(5u64);

    let mut a = stm.new_transaction();
    assert_eq!(x.get(&mut a).unwrap(), 5);

    stm.atomic(|tx| x.set(tx, 6)).unwrap();

    let err = a.commit().unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::Read));
    assert_eq!(a.status(), TxnStatus::Aborted);
    assert_eq!(x.atomic_get().unwrap(), 6);
    assert_eq!(x.orec_state().surplus, 0);
}

#[test]
fn stale_read_aborts_when_next_cell_opened() {
    let stm = stm_with(fat_config());
    let x = TxnRef::new(1u64);
    let y = TxnRef::new(1u64);

    let mut a = stm.new_transaction();
    assert_eq!(x.get(&mut a).unwrap(), 1);

    stm.atomic(|tx| {
        x.set(tx, 2)?;
        y.set(tx, 2)
    })
    .unwrap();

    // y alone is consistent, but together with the old x it would not be
    let err = y.get(&mut a).unwrap_err();
    assert!(matches!(err, StmError::ReadConflict { cell } if cell == x.id()));
    assert_eq!(a.status(), TxnStatus::Aborted);
}

#[test]
fn unrelated_commit_does_not_abort_reader() {
    let stm = stm_with(fat_config());
    let x = TxnRef::new(1u64);
    let unrelated = TxnRef::new(1u64);

    let mut a = stm.new_transaction();
    x.get(&mut a).unwrap();
    stm.atomic_set(&unrelated, 9).unwrap();

    a.commit().unwrap();
    assert_eq!(a.status(), TxnStatus::Committed);
}

#[test]
fn first_committer_wins_on_same_cell() {
    let stm = stm_with(fat_config());
    let x = TxnRef::new(0u64);

    let mut t1 = stm.new_transaction();
    let mut t2 = stm.new_transaction();
    let v1 = x.get(&mut t1).unwrap();
    let v2 = x.get(&mut t2).unwrap();
    x.set(&mut t1, v1 + 1).unwrap();
    x.set(&mut t2, v2 + 1).unwrap();

    t1.commit().unwrap();
    assert!(t2.commit().unwrap_err().is_conflict());
    assert_eq!(x.atomic_get().unwrap(), 1);
}

#[test]
fn pairs_always_observed_consistent() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let x = TxnRef::new(0u64);
    let y = TxnRef::new(0u64);
    let checks = Arc::new(AtomicU64::new(0));

    let writer = {
        let stm = Arc::clone(&stm);
        let (x, y) = (x.clone(), y.clone());
        thread::spawn(move || {
            for i in 1..=2_000u64 {
                stm.atomic(|tx| {
                    x.set(tx, i)?;
                    y.set(tx, i)
                })
                .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let (x, y) = (x.clone(), y.clone());
            let checks = Arc::clone(&checks);
            thread::spawn(move || {
                let mut last = 0;
                while last < 2_000 {
                    let (a, b) = stm
                        .atomic(|tx| {
                            let a = x.get(tx)?;
                            // inside the body: an inconsistent pair must never be seen
                            let b = y.get(tx)?;
                            assert_eq!(a, b, "torn read inside a transaction");
                            Ok((a, b))
                        })
                        .unwrap();
                    assert_eq!(a, b);
                    assert!(a >= last, "values went backwards");
                    last = a;
                    checks.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert!(checks.load(Ordering::Relaxed) >= 3);
}

// ============================================================================
// Write Skew
// ============================================================================

/// Two withdrawals, each from a different account, each checking the
/// combined balance; both prepare before either commits
fn race_withdrawals(skew_allowed: bool) -> (bool, bool, i64) {
    let config = fat_config().with_write_skew_allowed(skew_allowed);
    let stm = Arc::new(stm_with(config));
    let x = TxnRef::new(50i64);
    let y = TxnRef::new(50i64);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|t| {
            let stm = Arc::clone(&stm);
            let (x, y) = (x.clone(), y.clone());
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut tx = stm.new_transaction();
                let sum = x.get(&mut tx).unwrap() + y.get(&mut tx).unwrap();
                assert_eq!(sum, 100);
                let target = if t == 0 { &x } else { &y };
                target.alter(&mut tx, |v| v - 90).unwrap();

                barrier.wait();
                let prepared = tx.prepare();
                barrier.wait();
                prepared.and_then(|_| tx.commit()).is_ok()
            })
        })
        .collect();

    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let total = x.atomic_get().unwrap() + y.atomic_get().unwrap();
    (results[0], results[1], total)
}

#[test]
fn write_skew_observable_when_allowed() {
    for _ in 0..20 {
        let (first, second, total) = race_withdrawals(true);
        assert!(first && second, "both withdrawals should commit");
        assert_eq!(total, -80);
    }
}

#[test]
fn write_skew_prevented_when_disallowed() {
    for _ in 0..20 {
        let (first, second, total) = race_withdrawals(false);
        assert!(!(first && second), "at least one withdrawal must be rejected");
        assert!(total >= 0);
    }
}

#[test]
fn write_skew_disallowed_under_executor_load() {
    let config = unbounded_config()
        .with_speculative(false)
        .with_write_skew_allowed(false);
    let stm = Arc::new(stm_with(config));
    let x = TxnRef::new(1_000i64);
    let y = TxnRef::new(1_000i64);

    {
        let stm = Arc::clone(&stm);
        let (x, y) = (x.clone(), y.clone());
        run_concurrent(4, move |t| {
            let target = if t % 2 == 0 { &x } else { &y };
            for _ in 0..400 {
                stm.atomic(|tx| {
                    let sum = x.get(tx)? + y.get(tx)?;
                    if sum >= 10 {
                        target.alter(tx, |v| v - 10)?;
                    }
                    Ok(())
                })
                .unwrap();
            }
        });
    }

    let total = x.atomic_get().unwrap() + y.atomic_get().unwrap();
    assert!(total >= 0, "invariant broken: {}", total);
}
