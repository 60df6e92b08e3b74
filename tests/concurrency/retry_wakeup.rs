//! Blocking Retry Tests
//!
//! A transaction that retries on a cell must wake once that cell changes,
//! whichever way the registration and the update interleave.

use crate::common::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn waiter_wakes_on_commit() {
    let stm = Arc::new(test_stm());
    let ready = TxnRef::new(false);
    let payload = TxnRef::new(0u64);

    let consumer = {
        let stm = Arc::clone(&stm);
        let (ready, payload) = (ready.clone(), payload.clone());
        thread::spawn(move || {
            stm.atomic(|tx| {
                if !ready.get(tx)? {
                    return retry();
                }
                payload.get(tx)
            })
        })
    };

    thread::sleep(Duration::from_millis(20));
    stm.atomic(|tx| {
        payload.set(tx, 42)?;
        ready.set(tx, true)
    })
    .unwrap();

    assert_eq!(consumer.join().unwrap().unwrap(), 42);
}

/// Two threads hand a token back and forth; every handoff depends on the
/// other side's retry waking up. A single lost wakeup hangs the test.
#[test]
fn ping_pong_never_loses_a_wakeup() {
    const ROUNDS: u64 = 2_000;
    let stm = Arc::new(stm_with(unbounded_config()));
    let turn = TxnRef::new(0u64);

    let players: Vec<_> = (0..2u64)
        .map(|me| {
            let stm = Arc::clone(&stm);
            let turn = turn.clone();
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let expected = round * 2 + me;
                    stm.atomic(|tx| {
                        if turn.get(tx)? != expected {
                            return retry();
                        }
                        turn.set(tx, expected + 1)
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for p in players {
        p.join().unwrap();
    }
    assert_eq!(turn.atomic_get().unwrap(), ROUNDS * 2);
}

#[test]
fn many_waiters_all_wake() {
    let stm = Arc::new(test_stm());
    let gate = TxnRef::new(false);

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let gate = gate.clone();
            thread::spawn(move || stm.atomic(|tx| gate.await_value(tx, |open| *open)))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    stm.atomic_set(&gate, true).unwrap();

    for w in waiters {
        w.join().unwrap().unwrap();
    }
}

#[test]
fn producer_consumer_queue() {
    const ITEMS: u64 = 500;
    let stm = Arc::new(stm_with(unbounded_config()));
    let queue: TxnRef<Vec<u64>> = TxnRef::new(Vec::new());

    let consumer = {
        let stm = Arc::clone(&stm);
        let queue = queue.clone();
        thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < ITEMS as usize {
                let item = stm
                    .atomic(|tx| {
                        let mut items = queue.get(tx)?;
                        if items.is_empty() {
                            return retry();
                        }
                        let item = items.remove(0);
                        queue.set(tx, items)?;
                        Ok(item)
                    })
                    .unwrap();
                received.push(item);
            }
            received
        })
    };

    for i in 0..ITEMS {
        stm.atomic(|tx| queue.alter(tx, |items| {
            let mut items = items.clone();
            items.push(i);
            items
        }))
        .unwrap();
    }

    let received = consumer.join().unwrap();
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn retry_times_out_without_update() {
    let stm = stm_with(TxnConfig::default().with_timeout(Duration::from_millis(30)));
    let cell = TxnRef::new(0u64);

    let err = stm
        .atomic(|tx| {
            cell.get(tx)?;
            retry::<()>()
        })
        .unwrap_err();
    assert!(matches!(err, StmError::RetryTimeout { .. }));
    assert_eq!(cell.orec_state().surplus, 0);
}

#[test]
fn interrupt_wakes_blocked_retry() {
    let stm = stm_with(fat_config().with_interruptible(true).with_family_name("sleeper"));
    let cell = TxnRef::new(0u64);
    let mut tx = stm.new_transaction();
    let handle = tx.interrupt_handle();

    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.interrupt();
    });

    cell.get(&mut tx).unwrap();
    let err = tx.retry().unwrap_err();
    assert!(matches!(err, StmError::Interrupted { ref family } if family == "sleeper"));
    assert_eq!(tx.status(), TxnStatus::Aborted);
    interrupter.join().unwrap();
}

#[test]
fn retry_with_no_reads_is_rejected() {
    let stm = test_stm();
    let err = stm.atomic(|_tx| retry::<()>()).unwrap_err();
    assert!(matches!(err, StmError::NoRetryPossible { .. }));
}
