//! Atomicity Tests
//!
//! A committed transaction's writes become visible together or not at all:
//! - Concurrent transfers preserve the total
//! - Readers never observe half of a transfer
//! - Aborted and failed transactions leave no trace

use crate::common::*;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const ACCOUNTS: usize = 8;
const INITIAL_BALANCE: i64 = 1_000;

fn accounts() -> Arc<Vec<TxnRef<i64>>> {
    Arc::new((0..ACCOUNTS).map(|_| TxnRef::new(INITIAL_BALANCE)).collect())
}

fn transfer(tx: &mut Transaction, from: &TxnRef<i64>, to: &TxnRef<i64>, amount: i64) -> StmResult<()> {
    from.alter(tx, |v| v - amount)?;
    to.alter(tx, |v| v + amount)?;
    Ok(())
}

// ============================================================================
// Sum Invariant
// ============================================================================

#[test]
fn concurrent_transfers_preserve_total() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let accounts = accounts();

    {
        let stm = Arc::clone(&stm);
        let accounts = Arc::clone(&accounts);
        run_concurrent(4, move |_| {
            let mut rng = rand::thread_rng();
            for _ in 0..500 {
                let from = &accounts[rng.gen_range(0..ACCOUNTS)];
                let to = &accounts[rng.gen_range(0..ACCOUNTS)];
                if from.ptr_eq(to) {
                    continue;
                }
                let amount = rng.gen_range(1..50);
                stm.atomic(|tx| transfer(tx, from, to, amount)).unwrap();
            }
        });
    }

    let total: i64 = accounts.iter().map(|a| a.atomic_get().unwrap()).sum();
    assert_eq!(total, INITIAL_BALANCE * ACCOUNTS as i64);
}

#[test]
fn readers_never_observe_partial_transfer() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let accounts = accounts();
    let done = Arc::new(AtomicBool::new(false));
    let observations = Arc::new(AtomicU64::new(0));

    let writers: Vec<_> = (0..2)
        .map(|t| {
            let stm = Arc::clone(&stm);
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for i in 0..1_000 {
                    let from = &accounts[(i + t) % ACCOUNTS];
                    let to = &accounts[(i + t + 1) % ACCOUNTS];
                    stm.atomic(|tx| transfer(tx, from, to, (i % 13) as i64 + 1))
                        .unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let accounts = Arc::clone(&accounts);
            let done = Arc::clone(&done);
            let observations = Arc::clone(&observations);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let total = stm
                        .atomic(|tx| {
                            let mut sum = 0i64;
                            for account in accounts.iter() {
                                sum += account.get(tx)?;
                            }
                            Ok(sum)
                        })
                        .unwrap();
                    assert_eq!(total, INITIAL_BALANCE * ACCOUNTS as i64);
                    observations.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert!(observations.load(Ordering::Relaxed) > 0);
}

// ============================================================================
// All-or-Nothing
// ============================================================================

#[test]
fn aborted_transaction_publishes_nothing() {
    let stm = stm_with(fat_config());
    let a = TxnRef::new(1u64);
    let b = TxnRef::new(2u64);

    let mut tx = stm.new_transaction();
    a.set(&mut tx, 10).unwrap();
    b.set(&mut tx, 20).unwrap();
    tx.abort().unwrap();

    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
    assert_eq!(a.version(), 1);
    assert_eq!(b.version(), 1);
    assert_eq!(a.orec_state().surplus, 0);
    assert!(!b.orec_state().exclusive_lock);
}

#[test]
fn failed_body_publishes_nothing() {
    let stm = test_stm();
    let a = TxnRef::new(1u64);
    let b = TxnRef::new(2u64);

    let result: StmResult<()> = stm.atomic(|tx| {
        a.set(tx, 10)?;
        b.set(tx, 20)?;
        Err(StmError::IllegalState("rollback".to_string()))
    });

    assert!(matches!(result, Err(StmError::IllegalState(_))));
    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
}

#[test]
fn dropped_transaction_releases_cells() {
    let stm = stm_with(fat_config());
    let cell = TxnRef::new(0u64);
    {
        let mut tx = stm.new_transaction();
        cell.set(&mut tx, 5).unwrap();
        tx.prepare().unwrap();
        assert!(cell.orec_state().write_lock || cell.orec_state().exclusive_lock);
    }
    let state = cell.orec_state();
    assert!(!state.write_lock);
    assert!(!state.exclusive_lock);
    assert_eq!(state.surplus, 0);
    assert_eq!(cell.atomic_get().unwrap(), 0);

    stm.atomic_set(&cell, 6).unwrap();
    assert_eq!(cell.atomic_get().unwrap(), 6);
}

#[test]
fn multi_cell_commit_shares_one_step() {
    let stm = stm_with(fat_config());
    let cells: Vec<TxnRef<u64>> = (0..16).map(TxnRef::new).collect();

    stm.atomic(|tx| {
        for cell in &cells {
            cell.alter(tx, |v| v + 100)?;
        }
        Ok(())
    })
    .unwrap();

    for (i, cell) in cells.iter().enumerate() {
        assert_eq!(cell.atomic_get().unwrap(), i as u64 + 100);
        assert_eq!(cell.version(), 2);
    }
}
