//! Transaction Lifecycle Tests
//!
//! - Reset round-trip: a reused transaction behaves like a new one
//! - Prepared transactions hold their locks until commit or abort
//! - Cells constructed inside a transaction
//! - Pessimistic locking and readonly families

use crate::common::*;
use orecstm::LockMode;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Reset Round-Trip
// ============================================================================

#[test]
fn reset_round_trip_matches_fresh_transaction() {
    let stm = stm_with(fat_config());
    let a = TxnRef::new(1u64);
    let b = TxnRef::new(2u64);

    let mut reused = stm.new_transaction();
    a.set(&mut reused, 10).unwrap();
    b.get(&mut reused).unwrap();
    reused.commit().unwrap();

    reused.reset();
    assert_eq!(reused.status(), TxnStatus::Active);
    assert_eq!(reused.attempt(), 1);
    assert_eq!(reused.record_count(), 0);

    assert_eq!(a.get(&mut reused).unwrap(), 10);
    b.set(&mut reused, 20).unwrap();
    reused.commit().unwrap();

    let mut fresh = stm.new_transaction();
    assert_eq!(a.get(&mut fresh).unwrap(), 10);
    assert_eq!(b.get(&mut fresh).unwrap(), 20);
    fresh.commit().unwrap();

    for cell in [&a, &b] {
        let state = cell.orec_state();
        assert_eq!(state.surplus, 0);
        assert!(!state.write_lock && !state.exclusive_lock);
    }
    assert_eq!(a.version(), 2);
    assert_eq!(b.version(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any history of commits and aborts on a reused transaction leaves
    /// the cells exactly where a fresh transaction per round would
    #[test]
    fn reused_transaction_matches_model(
        rounds in proptest::collection::vec(
            (proptest::collection::vec((0usize..4, 0u64..100), 0..6), any::<bool>()),
            1..20,
        )
    ) {
        let stm = stm_with(fat_config());
        let cells: Vec<TxnRef<u64>> = (0..4).map(|_| TxnRef::new(0)).collect();
        let mut model = [0u64; 4];
        let mut tx = stm.new_transaction();

        for (writes, commit) in rounds {
            let mut pending = model;
            for (idx, value) in writes {
                cells[idx].set(&mut tx, value).unwrap();
                pending[idx] = value;
            }
            if commit {
                tx.commit().unwrap();
                model = pending;
            } else {
                tx.abort().unwrap();
            }
            tx.reset();
            prop_assert_eq!(tx.record_count(), 0);
        }

        for (cell, expected) in cells.iter().zip(model.iter()) {
            prop_assert_eq!(cell.get(&mut tx).unwrap(), *expected);
        }
        tx.commit().unwrap();
        for cell in &cells {
            let state = cell.orec_state();
            prop_assert!(!state.write_lock && !state.exclusive_lock);
            prop_assert!(state.surplus <= 1);
        }
    }
}

#[test]
fn reset_after_abort_releases_everything() {
    let stm = stm_with(fat_config());
    let cell = TxnRef::new(0u64);

    let mut tx = stm.new_transaction();
    cell.get_and_lock(&mut tx, LockMode::Exclusive).unwrap();
    tx.reset();
    assert!(!cell.orec_state().exclusive_lock);

    cell.set(&mut tx, 3).unwrap();
    tx.commit().unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 3);
}

#[test]
fn soft_reset_counts_attempts() {
    let stm = stm_with(fat_config().with_max_retries(2));
    let mut tx = stm.new_transaction();
    assert!(tx.soft_reset());
    assert_eq!(tx.attempt(), 2);
    assert!(!tx.soft_reset());
    assert_eq!(tx.status(), TxnStatus::Aborted);
}

// ============================================================================
// Prepared State
// ============================================================================

#[test]
fn prepared_transaction_blocks_other_writers() {
    let stm = Arc::new(stm_with(fat_config()));
    let cell = TxnRef::new(0u64);

    let mut holder = stm.new_transaction();
    cell.set(&mut holder, 1).unwrap();
    holder.prepare().unwrap();
    assert_eq!(holder.status(), TxnStatus::Prepared);

    let mut other = stm.new_transaction();
    cell.set(&mut other, 2).unwrap();
    let err = other.commit().unwrap_err();
    assert!(err.is_conflict());

    holder.commit().unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 1);
}

#[test]
fn abort_after_prepare_restores_cell() {
    let stm = stm_with(fat_config());
    let cell = TxnRef::new(7u64);

    let mut tx = stm.new_transaction();
    cell.set(&mut tx, 8).unwrap();
    tx.prepare().unwrap();
    tx.abort().unwrap();

    assert_eq!(cell.atomic_get().unwrap(), 7);
    assert_eq!(cell.version(), 1);
    stm.atomic_set(&cell, 9).unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 9);
}

#[test]
fn atomic_get_on_prepared_cell_gives_up() {
    let config = fat_config()
        .with_write_skew_allowed(false)
        .with_max_retries(3)
        .with_backoff(1_000, 10_000);
    let stm = stm_with(config);
    let cell = TxnRef::new(1u64);

    let mut holder = stm.new_transaction();
    cell.set(&mut holder, 2).unwrap();
    holder.prepare().unwrap();
    assert!(cell.orec_state().exclusive_lock);

    let err = stm.atomic_get(&cell).unwrap_err();
    assert!(matches!(err, StmError::Locked { .. }));

    holder.commit().unwrap();
    assert_eq!(stm.atomic_get(&cell).unwrap(), 2);
}

#[test]
fn committed_transaction_rejects_further_use() {
    let stm = stm_with(fat_config());
    let cell = TxnRef::new(0u64);

    let mut tx = stm.new_transaction();
    tx.commit().unwrap();
    assert!(matches!(
        cell.get(&mut tx),
        Err(StmError::DeadTransaction { .. })
    ));
    assert!(matches!(tx.abort(), Err(StmError::DeadTransaction { .. })));
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn constructed_cell_invisible_until_commit() {
    let stm = Arc::new(stm_with(fat_config()));
    let mut tx = stm.new_transaction();
    let cell = TxnRef::new_in(&mut tx, String::from("new")).unwrap();
    assert_eq!(cell.version(), 0);

    let observer = {
        let stm = Arc::clone(&stm);
        let cell = cell.clone();
        thread::spawn(move || {
            let mut observer_tx = stm.new_transaction();
            cell.get(&mut observer_tx).map(|_| ())
        })
    };
    let seen = observer.join().unwrap();
    assert!(seen.unwrap_err().is_conflict());

    tx.commit().unwrap();
    assert_eq!(cell.version(), 1);
    assert_eq!(stm.atomic(|tx| cell.get(tx)).unwrap(), "new");
}

// ============================================================================
// Locking Families
// ============================================================================

#[test]
fn pessimistic_writes_lock_at_open() {
    let config = fat_config().with_pessimistic_lock_level(PessimisticLockLevel::LockWrites);
    let stm = stm_with(config);
    let cell = TxnRef::new(0u64);

    let mut tx = stm.new_transaction();
    cell.set(&mut tx, 1).unwrap();
    let state = cell.orec_state();
    assert!(state.write_lock || state.exclusive_lock);

    let mut other = stm.new_transaction();
    assert!(cell.set(&mut other, 2).unwrap_err().is_conflict());

    tx.commit().unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 1);
}

#[test]
fn readonly_family_from_toml() {
    let stm = Stm::from_toml_str(
        r#"
[families.report]
readonly = true
"#,
    )
    .unwrap();
    let report = stm.family("report").unwrap();
    let cell = TxnRef::new(5u64);

    assert_eq!(report.execute(|tx| cell.get(tx)).unwrap(), 5);
    let err = report.execute(|tx| cell.set(tx, 6)).unwrap_err();
    assert!(matches!(err, StmError::ReadonlyViolation { .. }));
    assert_eq!(cell.atomic_get().unwrap(), 5);
}

#[test]
fn speculative_family_upgrades_once() {
    let stm = test_stm();
    let exec = stm
        .executor(TxnConfig::default().with_family_name("grow"))
        .unwrap();
    let cells: Vec<TxnRef<u64>> = (0..4).map(TxnRef::new).collect();

    for _ in 0..5 {
        let sum = exec
            .execute(|tx| {
                let mut sum = 0;
                for cell in &cells {
                    sum += cell.get(tx)?;
                }
                Ok(sum)
            })
            .unwrap();
        assert_eq!(sum, 6);
    }

    assert!(exec.speculative_config().is_fat());
    assert_eq!(exec.metrics().total_speculative_upgrades, 1);
}

#[test]
fn transactions_can_move_between_threads() {
    let stm = stm_with(fat_config());
    let cell = TxnRef::new(1u64);

    let mut tx = stm.new_transaction();
    cell.set(&mut tx, 2).unwrap();
    let tx = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1));
        let mut tx = tx;
        tx.commit().unwrap();
        tx
    })
    .join()
    .unwrap();

    assert_eq!(tx.status(), TxnStatus::Committed);
    assert_eq!(cell.atomic_get().unwrap(), 2);
}
