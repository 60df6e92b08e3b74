//! Transaction executor
//!
//! [`TxnExecutor`] runs a closure as a transaction until it commits or
//! fails terminally. Each attempt ends in a [`TxnOutcome`]:
//!
//! | outcome | action |
//! |---|---|
//! | `Completed` | commit (a commit conflict is handled as `Conflict`) |
//! | `RetryRequested` | block in `Transaction::retry` until a read cell changes |
//! | `Conflict` | back off, then `soft_reset` into the next attempt |
//! | `SpeculativeFailure` | rebuild as a fat transaction, same attempt |
//! | `Failed` | abort and return the error |
//!
//! An executor is the unit that shares speculative state: once one of its
//! executions needs a fat transaction, every later execution starts fat.

use crate::metrics::MetricsRecorder;
use crate::pool::TransactionPool;
use orecstm_concurrency::{
    BackoffPolicy, ExponentialBackoffPolicy, GlobalConflictCounter, SpeculativeConfig,
    Transaction, TxnRef, TxnValue,
};
use orecstm_core::{CellId, ConflictKind, SpeculativeReason, StmError, StmResult, TxnConfig};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request a blocking retry from inside a transaction body
///
/// ```ignore
/// executor.execute(|tx| {
///     let items = queue.get(tx)?;
///     if items.is_empty() {
///         return retry();
///     }
///     // ...
/// })
/// ```
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::RetryRequested)
}

/// How a single attempt ended
#[derive(Debug)]
pub enum TxnOutcome<T> {
    /// The body returned a value
    Completed(T),
    /// The body asked to block until something it read changes
    RetryRequested,
    /// A read, write or lock conflict aborted the attempt
    Conflict {
        /// Kind of conflict
        kind: ConflictKind,
        /// Cell it was detected on
        cell: CellId,
    },
    /// A lean transaction ran out of room or needed a fat-only feature
    SpeculativeFailure(SpeculativeReason),
    /// Anything else; terminal
    Failed(StmError),
}

impl<T> From<StmResult<T>> for TxnOutcome<T> {
    fn from(result: StmResult<T>) -> Self {
        match result {
            Ok(value) => TxnOutcome::Completed(value),
            Err(StmError::RetryRequested) => TxnOutcome::RetryRequested,
            Err(StmError::SpeculativeFailure { reason }) => TxnOutcome::SpeculativeFailure(reason),
            Err(err) => match (err.conflict_kind(), conflict_cell(&err)) {
                (Some(kind), Some(cell)) => TxnOutcome::Conflict { kind, cell },
                _ => TxnOutcome::Failed(err),
            },
        }
    }
}

fn conflict_cell(err: &StmError) -> Option<CellId> {
    match err {
        StmError::ReadConflict { cell }
        | StmError::WriteConflict { cell }
        | StmError::Locked { cell } => Some(*cell),
        _ => None,
    }
}

/// Runs transactions of one family
pub struct TxnExecutor {
    config: Arc<TxnConfig>,
    speculative: Arc<SpeculativeConfig>,
    counter: Arc<GlobalConflictCounter>,
    backoff: Arc<dyn BackoffPolicy>,
    metrics: Arc<MetricsRecorder>,
}

impl TxnExecutor {
    /// Executor for `config`, sharing `counter` with every other executor of
    /// the same runtime
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(config: TxnConfig, counter: Arc<GlobalConflictCounter>) -> StmResult<Self> {
        Self::with_metrics(config, counter, Arc::new(MetricsRecorder::default()))
    }

    pub(crate) fn with_metrics(
        config: TxnConfig,
        counter: Arc<GlobalConflictCounter>,
        metrics: Arc<MetricsRecorder>,
    ) -> StmResult<Self> {
        config.validate()?;
        let backoff = Arc::new(ExponentialBackoffPolicy::from(&config.backoff));
        let speculative = Arc::new(SpeculativeConfig::new(&config));
        Ok(TxnExecutor {
            config: Arc::new(config),
            speculative,
            counter,
            backoff,
            metrics,
        })
    }

    /// Replace the backoff policy
    pub fn with_backoff_policy(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Configuration of this family
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Speculative state shared by this family's executions
    pub fn speculative_config(&self) -> &Arc<SpeculativeConfig> {
        &self.speculative
    }

    /// Read the committed value of `cell` without a transaction
    ///
    /// Spins for `spin_count` rounds while the cell is exclusively locked,
    /// then backs off and tries again, up to `max_retries` times.
    ///
    /// # Errors
    /// `Locked` if the cell stayed locked throughout.
    pub fn atomic_get<V: TxnValue>(&self, cell: &TxnRef<V>) -> StmResult<V> {
        let mut attempt = 1;
        loop {
            match cell.atomic_get_with_spin(self.config.spin_count) {
                Err(StmError::Locked { .. }) if attempt < self.config.max_retries => {
                    self.backoff.backoff(attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Executions of this executor since it was created
    pub fn metrics(&self) -> crate::TransactionMetrics {
        self.metrics.snapshot()
    }

    /// A standalone transaction of this family, for manual control
    pub fn new_transaction(&self) -> Transaction {
        Transaction::with_speculative(
            Arc::clone(&self.config),
            Arc::clone(&self.counter),
            Arc::clone(&self.speculative),
        )
    }

    /// Run `body` as a transaction until it commits
    ///
    /// `body` may run several times and must not have side effects outside
    /// the cells it accesses through the transaction.
    ///
    /// # Errors
    /// - `TooManyRetries` when attempts run out
    /// - `RetryTimeout`, `Interrupted`, `NoRetryPossible` from blocking retries
    /// - any other error `body` returns, unchanged
    pub fn execute<T, F>(&self, mut body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        let mut tx = TransactionPool::acquire(&self.config, &self.speculative, &self.counter);
        self.metrics.record_started();
        let result = self.run(&mut tx, &mut body);
        match &result {
            Ok(_) => self.metrics.record_committed(),
            Err(_) => self.metrics.record_failed(),
        }
        TransactionPool::release(tx);
        result
    }

    fn run<T, F>(&self, tx: &mut Transaction, body: &mut F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        loop {
            let attempt = body(tx).and_then(|value| tx.commit().map(|()| value));
            match TxnOutcome::from(attempt) {
                TxnOutcome::Completed(value) => return Ok(value),
                TxnOutcome::RetryRequested => {
                    self.metrics.record_blocking_retry();
                    tx.retry()?;
                }
                TxnOutcome::Conflict { kind, cell } => {
                    self.metrics.record_conflict();
                    debug!(
                        target: "orecstm::executor",
                        family = %self.config.family_name,
                        attempt = tx.attempt(),
                        ?kind,
                        %cell,
                        "Attempt conflicted"
                    );
                    if !tx.soft_reset() {
                        warn!(
                            target: "orecstm::executor",
                            family = %self.config.family_name,
                            attempts = tx.attempt(),
                            "Too many retries"
                        );
                        return Err(StmError::TooManyRetries {
                            family: self.config.family_name.clone(),
                            attempts: tx.attempt(),
                        });
                    }
                    self.backoff.backoff(tx.attempt() - 1);
                }
                TxnOutcome::SpeculativeFailure(_) => {
                    self.metrics.record_speculative_upgrade();
                    tx.upgrade_to_fat();
                }
                TxnOutcome::Failed(err) => {
                    if tx.is_active() {
                        // live transactions always abort cleanly
                        let _ = tx.abort();
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl fmt::Debug for TxnExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnExecutor")
            .field("family", &self.config.family_name)
            .field("fat", &self.speculative.is_fat())
            .finish()
    }
}
