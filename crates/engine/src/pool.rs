//! Thread-local transaction pool
//!
//! Reuses `Transaction` objects between executions. Each thread keeps up to
//! [`MAX_POOL_SIZE`] idle transactions.
//!
//! `Transaction::reconfigure` clears the record vector and the cell index
//! without giving back their allocations, so after warmup an execution that
//! touches a similar number of cells does not allocate for bookkeeping.
//! The retry latch is not carried over: an `InterruptHandle` taken during
//! one execution never reaches the next owner of the transaction.

use orecstm_concurrency::{GlobalConflictCounter, SpeculativeConfig, Transaction, TxnStatus};
use orecstm_core::TxnConfig;
use std::cell::RefCell;
use std::sync::Arc;

/// Maximum idle transactions per thread
///
/// Executions nest rarely, so a thread seldom needs more than one or two.
pub const MAX_POOL_SIZE: usize = 8;

thread_local! {
    static TXN_POOL: RefCell<Vec<Transaction>> = RefCell::new(Vec::with_capacity(MAX_POOL_SIZE));
}

/// Transaction pool operations
///
/// ```ignore
/// let mut tx = TransactionPool::acquire(&config, &speculative, &counter);
/// // ... run attempts ...
/// TransactionPool::release(tx);
/// ```
pub struct TransactionPool;

impl TransactionPool {
    /// Take a transaction configured for a family, ready at attempt 1
    ///
    /// Returns a pooled transaction if one is idle, allocates otherwise.
    pub fn acquire(
        config: &Arc<TxnConfig>,
        speculative: &Arc<SpeculativeConfig>,
        counter: &Arc<GlobalConflictCounter>,
    ) -> Transaction {
        let pooled = TXN_POOL.with(|pool| pool.borrow_mut().pop());
        match pooled {
            Some(mut tx) => {
                tx.reconfigure(Arc::clone(config), Arc::clone(speculative), counter);
                tx
            }
            None => Transaction::with_speculative(
                Arc::clone(config),
                Arc::clone(counter),
                Arc::clone(speculative),
            ),
        }
    }

    /// Return a transaction to the pool
    ///
    /// A live transaction is aborted first. Dropped if the pool is full.
    pub fn release(mut tx: Transaction) {
        if matches!(tx.status(), TxnStatus::Active | TxnStatus::Prepared) {
            // aborting a live transaction cannot fail
            let _ = tx.abort();
        }
        TXN_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < MAX_POOL_SIZE {
                pool.push(tx);
            }
        });
    }

    /// Idle transactions on this thread
    pub fn pool_size() -> usize {
        TXN_POOL.with(|pool| pool.borrow().len())
    }

    /// Drop every idle transaction on this thread
    #[cfg(test)]
    pub fn clear() {
        TXN_POOL.with(|pool| pool.borrow_mut().clear());
    }

    /// Pre-fill this thread's pool with `count` transactions (capped at
    /// [`MAX_POOL_SIZE`])
    pub fn warmup(count: usize) {
        let count = count.min(MAX_POOL_SIZE);
        TXN_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() >= count {
                return;
            }
            let config = Arc::new(TxnConfig::default());
            let counter = Arc::new(GlobalConflictCounter::new());
            for _ in pool.len()..count {
                pool.push(Transaction::new(Arc::clone(&config), Arc::clone(&counter)));
            }
        });
    }

    /// Sum of record capacity across idle transactions
    #[cfg(test)]
    pub fn total_capacity() -> usize {
        TXN_POOL.with(|pool| pool.borrow().iter().map(|tx| tx.capacity()).sum())
    }
}
