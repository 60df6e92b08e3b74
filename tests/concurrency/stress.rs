//! Stress Tests
//!
//! Contended counters and version monotonicity. The full-size counter run is
//! marked #[ignore] for opt-in execution.
//! Run with: cargo test --test concurrency stress -- --ignored

use crate::common::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn hammer_counter(threads: usize, increments: u64) -> (u64, TransactionMetrics) {
    let stm = Arc::new(stm_with(unbounded_config()));
    let counter = TxnRef::new(0u64);

    {
        let stm = Arc::clone(&stm);
        let counter = counter.clone();
        run_concurrent(threads, move |_| {
            for _ in 0..increments {
                stm.atomic(|tx| counter.alter(tx, |v| v + 1)).unwrap();
            }
        });
    }

    (counter.atomic_get().unwrap(), stm.metrics())
}

#[test]
fn counter_increments_are_never_lost() {
    let (value, metrics) = hammer_counter(4, 10_000);
    assert_eq!(value, 40_000);
    assert_eq!(metrics.total_committed, 40_000);
    assert_eq!(metrics.total_failed, 0);
}

/// Two threads, 1,000,000 increments each
#[test]
#[ignore]
fn stress_two_million_increments() {
    let start = Instant::now();
    let (value, metrics) = hammer_counter(2, 1_000_000);
    println!(
        "2M increments in {:?}: conflicts {}, commit rate {:.3}",
        start.elapsed(),
        metrics.total_conflicts,
        metrics.commit_rate
    );
    assert_eq!(value, 2_000_000);
}

#[test]
fn commute_increments_are_never_lost() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let counter = TxnRef::new(0u64);

    {
        let stm = Arc::clone(&stm);
        let counter = counter.clone();
        run_concurrent(4, move |_| {
            for _ in 0..2_000 {
                stm.atomic(|tx| counter.commute(tx, |v| v + 1)).unwrap();
            }
        });
    }

    assert_eq!(counter.atomic_get().unwrap(), 8_000);
}

#[test]
fn versions_strictly_increase_per_commit() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let cell = TxnRef::new(0u64);
    let commits = Arc::new(AtomicU64::new(0));

    let observed: Vec<Vec<u64>> = {
        let stm = Arc::clone(&stm);
        let cell = cell.clone();
        let commits = Arc::clone(&commits);
        run_concurrent(4, move |_| {
            let mut seen = Vec::new();
            for _ in 0..1_000 {
                stm.atomic(|tx| cell.alter(tx, |v| v + 1)).unwrap();
                commits.fetch_add(1, Ordering::Relaxed);
                seen.push(cell.version());
            }
            seen
        })
    };

    for seen in &observed {
        assert!(
            seen.windows(2).all(|w| w[0] < w[1]),
            "a thread saw a version go backwards or repeat"
        );
    }
    // version 1 is the initial publication
    assert_eq!(cell.version(), commits.load(Ordering::Relaxed) + 1);
    assert_eq!(cell.atomic_get().unwrap(), 4_000);
}

#[test]
fn hot_read_mostly_cell_stays_correct() {
    let stm = Arc::new(stm_with(unbounded_config()));
    let config = TxnRef::new(1u64);
    let writes = 200u64;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let config = config.clone();
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..5_000 {
                    let v = stm.atomic(|tx| config.get(tx)).unwrap();
                    assert!(v >= last);
                    last = v;
                }
            })
        })
        .collect();

    for _ in 0..writes {
        stm.atomic_alter(&config, |v| v + 1).unwrap();
        thread::yield_now();
    }

    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(config.atomic_get().unwrap(), writes + 1);
    let state = config.orec_state();
    assert!(!state.exclusive_lock);
    assert!(!state.write_lock);
}
