//! Transaction lifecycle and the commit protocol
//!
//! A [`Transaction`] owns the shadow records of every cell it opened and
//! drives them through the commit protocol:
//!
//! 1. **Prepare**: materialize deferred commutes, lock every dirty write with
//!    the commit lock mode and check its version, then revalidate the whole
//!    read set.
//! 2. **Publish**: upgrade each write lock to exclusive, swap in the new value
//!    with `version + 1` and detach the cell's listeners.
//! 3. **Signal**: if any published cell still had other transactions
//!    depending on the old version, bump the global conflict counter. This
//!    happens before any lock is released.
//! 4. **Release**: depart from every cell (update departures for published
//!    cells, read departures for the rest).
//! 5. **Wake**: open every detached listener latch.
//!
//! `prepare()` and `commit()` are separate so a transaction can sit in the
//! locked-but-unpublished `Prepared` state while an outside party decides
//! whether a group of transactions commits together.
//!
//! Records are stored type-erased in a `Vec` with an `FxHashMap` index by
//! cell id. `reset()` clears both but keeps their capacity.

use crate::cell::TxnValue;
use crate::conflict::{GlobalConflictCounter, LocalConflictCounter};
use crate::latch::{CheapLatch, LatchError, RetryLatch, StandardLatch};
use crate::listeners::{DetachedListeners, ListenerRegistration};
use crate::speculative::SpeculativeConfig;
use crate::tranlocal::{AccessMode, Tranlocal, TranlocalEntry};
use orecstm_core::{CellId, SpeculativeReason, StmError, StmResult, TxnConfig};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Status of a transaction in its lifecycle
///
/// State transitions:
/// - `Active` → `Prepared` (locks taken, reads validated)
/// - `Active` | `Prepared` → `Committed`
/// - `Active` | `Prepared` → `Aborted` (user abort, conflict, retry)
///
/// `Committed` and `Aborted` are terminal until `reset()` or
/// `soft_reset()` brings the transaction back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Executing; cells can be opened
    Active,
    /// Locked and validated, not yet published
    Prepared,
    /// Published
    Committed,
    /// Rolled back
    Aborted,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnStatus::Active => write!(f, "active"),
            TxnStatus::Prepared => write!(f, "prepared"),
            TxnStatus::Committed => write!(f, "committed"),
            TxnStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Handle that wakes a transaction blocked in an interruptible retry
#[derive(Clone)]
pub struct InterruptHandle {
    latch: Arc<dyn RetryLatch>,
}

impl InterruptHandle {
    /// Interrupt the current (or next) interruptible wait
    pub fn interrupt(&self) {
        self.latch.interrupt();
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}

/// A software transaction
pub struct Transaction {
    config: Arc<TxnConfig>,
    speculative: Arc<SpeculativeConfig>,
    conflict: LocalConflictCounter,
    status: TxnStatus,
    lean: bool,
    attempt: u32,
    remaining_timeout_ns: Option<u64>,
    records: Vec<Box<dyn TranlocalEntry>>,
    index: FxHashMap<CellId, usize>,
    latch: Option<Arc<dyn RetryLatch>>,
}

impl Transaction {
    /// New transaction with its own speculative state
    pub fn new(config: Arc<TxnConfig>, counter: Arc<GlobalConflictCounter>) -> Self {
        let speculative = Arc::new(SpeculativeConfig::new(&config));
        Self::with_speculative(config, counter, speculative)
    }

    /// New transaction sharing a family's speculative state
    pub fn with_speculative(
        config: Arc<TxnConfig>,
        counter: Arc<GlobalConflictCounter>,
        speculative: Arc<SpeculativeConfig>,
    ) -> Self {
        Transaction {
            lean: speculative.start_lean(),
            remaining_timeout_ns: config.timeout_ns,
            conflict: LocalConflictCounter::new(counter),
            status: TxnStatus::Active,
            attempt: 1,
            records: Vec::new(),
            index: FxHashMap::default(),
            latch: None,
            speculative,
            config,
        }
    }

    // === Accessors ===

    /// Current lifecycle status
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Can cells be opened?
    pub fn is_active(&self) -> bool {
        self.status == TxnStatus::Active
    }

    /// Holding records that still need releasing?
    fn is_live(&self) -> bool {
        matches!(self.status, TxnStatus::Active | TxnStatus::Prepared)
    }

    /// Configuration this transaction runs with
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Shared handle to the configuration
    pub fn config_arc(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    /// Family name used in logs and errors
    pub fn family_name(&self) -> &str {
        &self.config.family_name
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Override the attempt number (carried over when rebuilding)
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Blocking budget left for retries; `None` waits forever
    pub fn remaining_timeout_ns(&self) -> Option<u64> {
        self.remaining_timeout_ns
    }

    /// Override the remaining blocking budget
    pub fn set_remaining_timeout_ns(&mut self, timeout_ns: Option<u64>) {
        self.remaining_timeout_ns = timeout_ns;
    }

    /// Cells opened so far
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Records that will (or may) publish: writes, commutes, constructions
    pub fn pending_writes(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.meta().mode != AccessMode::Read)
            .count()
    }

    /// Running with the lean, fixed-capacity layout?
    pub fn is_lean(&self) -> bool {
        self.lean
    }

    /// Learned lean/fat state of this transaction's family
    pub fn speculative_config(&self) -> &Arc<SpeculativeConfig> {
        &self.speculative
    }

    /// Global conflict counter this transaction follows
    pub fn conflict_counter(&self) -> &Arc<GlobalConflictCounter> {
        self.conflict.global()
    }

    /// Capacity of the record storage (kept across resets)
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    /// Handle for interrupting a blocked, interruptible retry
    pub fn interrupt_handle(&mut self) -> InterruptHandle {
        InterruptHandle {
            latch: self.latch(),
        }
    }

    fn latch(&mut self) -> Arc<dyn RetryLatch> {
        let timed = self.config.timeout_ns.is_some() || self.remaining_timeout_ns.is_some();
        let latch = self.latch.get_or_insert_with(|| -> Arc<dyn RetryLatch> {
            if timed {
                Arc::new(StandardLatch::new())
            } else {
                Arc::new(CheapLatch::new())
            }
        });
        Arc::clone(latch)
    }

    // === Record access for cells ===

    pub(crate) fn ensure_active(&self, operation: &'static str) -> StmResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.dead(operation))
        }
    }

    fn dead(&self, operation: &'static str) -> StmError {
        StmError::DeadTransaction {
            operation,
            status: self.status.to_string(),
        }
    }

    pub(crate) fn index_of(&self, id: CellId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub(crate) fn record_mut<V: TxnValue>(&mut self, idx: usize) -> StmResult<&mut Tranlocal<V>> {
        self.records
            .get_mut(idx)
            .and_then(|record| record.as_any_mut().downcast_mut::<Tranlocal<V>>())
            .ok_or_else(|| {
                StmError::IllegalState(format!("no record of the requested type at slot {}", idx))
            })
    }

    pub(crate) fn push_record<V: TxnValue>(&mut self, record: Tranlocal<V>) -> usize {
        let idx = self.records.len();
        self.index.insert(record.cell().id(), idx);
        self.records.push(Box::new(record));
        idx
    }

    /// Make room for one more record, failing speculatively when lean
    pub(crate) fn admit(&mut self) -> StmResult<()> {
        let capacity = self.speculative.lean_capacity();
        if self.lean && self.records.len() >= capacity {
            return Err(self.speculative_failure(SpeculativeReason::CapacityExceeded { capacity }));
        }
        Ok(())
    }

    pub(crate) fn speculative_failure(&mut self, reason: SpeculativeReason) -> StmError {
        self.speculative.signal_failure(reason);
        self.fail(StmError::SpeculativeFailure { reason })
    }

    /// Abort and hand back `error`
    pub(crate) fn fail(&mut self, error: StmError) -> StmError {
        if self.is_live() {
            self.release_records();
            self.status = TxnStatus::Aborted;
        }
        debug!(
            target: "orecstm::txn",
            family = %self.config.family_name,
            attempt = self.attempt,
            error = %error,
            "Transaction aborted"
        );
        error
    }

    /// Revalidate the read set if some writer left readers behind since
    /// the last check
    pub(crate) fn check_read_consistency(&mut self) -> StmResult<()> {
        if !self.conflict.sync_and_check_conflict() {
            return Ok(());
        }
        let stale = self
            .records
            .iter()
            .find(|record| record.has_read_conflict())
            .map(|record| record.cell_id());
        match stale {
            Some(cell) => Err(self.fail(StmError::ReadConflict { cell })),
            None => Ok(()),
        }
    }

    // === Commit protocol ===

    /// Lock dirty writes and validate every read
    ///
    /// # State Transition
    /// `Active` → `Prepared`, or `Aborted` on conflict
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Active => {}
            TxnStatus::Prepared => return Ok(()),
            TxnStatus::Committed | TxnStatus::Aborted => return Err(self.dead("prepare")),
        }

        let spin = self.config.spin_count;
        let commit_mode = self.config.commit_lock_mode();
        let dirty_check = self.config.dirty_check;

        let mut failure = None;
        for record in self.records.iter_mut() {
            if let Err(kind) = record.prepare_for_commit(spin, commit_mode, dirty_check) {
                failure = Some(StmError::conflict(kind, record.cell_id()));
                break;
            }
        }

        if failure.is_none() {
            // lock acquisitions above must be visible to concurrent validators
            // before we inspect their locks below
            fence(Ordering::SeqCst);
            failure = self
                .records
                .iter()
                .find(|record| record.has_read_conflict())
                .map(|record| StmError::ReadConflict {
                    cell: record.cell_id(),
                });
        }

        if let Some(error) = failure {
            return Err(self.fail(error));
        }
        self.status = TxnStatus::Prepared;
        Ok(())
    }

    /// Publish every write and release every cell
    ///
    /// Prepares first if needed. Committing twice is a no-op.
    ///
    /// # State Transition
    /// `Active` | `Prepared` → `Committed`
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {}
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => return Err(self.dead("commit")),
        }

        let mut wakeups: SmallVec<[DetachedListeners; 4]> = SmallVec::new();
        let mut dependents = false;
        let mut published = 0usize;
        for record in self.records.iter_mut() {
            if record.is_write() {
                let (listeners, has_dependents) = record.publish();
                dependents |= has_dependents;
                published += 1;
                if !listeners.is_empty() {
                    wakeups.push(listeners);
                }
            }
        }

        if dependents {
            self.conflict.global().signal_conflict();
        }

        for record in self.records.iter_mut() {
            record.release_after_commit();
        }
        let records = self.records.len();
        self.clear_records();
        self.status = TxnStatus::Committed;

        for listeners in wakeups {
            listeners.open_all();
        }

        trace!(
            target: "orecstm::txn",
            family = %self.config.family_name,
            attempt = self.attempt,
            records,
            published,
            "Transaction committed"
        );
        Ok(())
    }

    /// Roll back, releasing every lock and arrival
    ///
    /// Aborting an aborted transaction is a no-op.
    ///
    /// # Errors
    /// `DeadTransaction` if the transaction already committed.
    pub fn abort(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Committed => Err(self.dead("abort")),
            TxnStatus::Active | TxnStatus::Prepared => {
                self.release_records();
                self.status = TxnStatus::Aborted;
                Ok(())
            }
        }
    }

    /// Block until one of the cells read so far changes, then restart
    ///
    /// Registers a latch on every read cell, aborts (releasing everything),
    /// and waits. On wake the transaction moves to its next attempt and is
    /// `Active` again; on failure it stays `Aborted`.
    ///
    /// # Errors
    /// - `NoRetryPossible` if nothing was read that could change
    /// - `RetryTimeout` if the remaining timeout ran out
    /// - `Interrupted` if an interruptible wait was interrupted
    /// - `TooManyRetries` if no attempts remain after waking
    pub fn retry(&mut self) -> StmResult<()> {
        self.ensure_active("retry")?;
        let family = self.config.family_name.clone();

        let mut latch = self.latch();
        if self.remaining_timeout_ns.is_some() && !latch.supports_timeout() {
            self.latch = None;
            latch = self.latch();
        }
        let era = latch.reset();
        let mut registered = false;
        for record in self.records.iter() {
            match record.register_listener(&latch, era) {
                ListenerRegistration::None => {}
                ListenerRegistration::Done | ListenerRegistration::NotNeeded => registered = true,
            }
        }
        self.release_records();
        self.status = TxnStatus::Aborted;

        if !registered {
            return Err(StmError::NoRetryPossible { family });
        }

        let interruptible = self.config.interruptible;
        let waited = match self.remaining_timeout_ns {
            None if interruptible => latch.await_open(era).map(|_| None),
            None => {
                latch.await_uninterruptible(era);
                Ok(None)
            }
            Some(ns) if interruptible => latch.try_await_ns(era, ns).map(Some),
            Some(ns) => latch.try_await_ns_uninterruptible(era, ns).map(Some),
        };

        match waited {
            Ok(remaining) => {
                if remaining.is_some() {
                    self.remaining_timeout_ns = remaining;
                }
            }
            Err(LatchError::TimedOut) => {
                latch.reset();
                self.remaining_timeout_ns = Some(0);
                warn!(target: "orecstm::txn", family = %family, attempt = self.attempt, "Retry timed out");
                return Err(StmError::RetryTimeout { family });
            }
            Err(LatchError::Interrupted) => {
                latch.reset();
                return Err(StmError::Interrupted { family });
            }
            Err(LatchError::TimeoutUnsupported) => {
                return Err(StmError::IllegalState(
                    "retry latch cannot wait with a timeout".to_string(),
                ))
            }
        }

        debug!(target: "orecstm::txn", family = %family, attempt = self.attempt, "Retry woke up");
        if !self.soft_reset() {
            warn!(target: "orecstm::txn", family = %family, attempts = self.attempt, "Too many retries");
            return Err(StmError::TooManyRetries {
                family,
                attempts: self.attempt,
            });
        }
        Ok(())
    }

    // === Reuse ===

    /// Move to the next attempt
    ///
    /// Aborts if still live. Returns false (leaving the transaction
    /// `Aborted`) when the attempt budget is used up.
    pub fn soft_reset(&mut self) -> bool {
        if self.is_live() {
            self.release_records();
            self.status = TxnStatus::Aborted;
        }
        if self.attempt >= self.config.max_retries {
            return false;
        }
        self.clear_records();
        self.attempt += 1;
        self.status = TxnStatus::Active;
        self.conflict.reset();
        true
    }

    /// Start over as a fresh transaction: attempt 1, full timeout budget
    ///
    /// Keeps the allocated record storage.
    pub fn reset(&mut self) {
        if self.is_live() {
            self.release_records();
        }
        self.clear_records();
        self.attempt = 1;
        self.remaining_timeout_ns = self.config.timeout_ns;
        self.lean = self.speculative.start_lean();
        self.status = TxnStatus::Active;
        self.conflict.reset();
    }

    /// Reconfigure for a new family and runtime; used when recycling
    pub fn reconfigure(
        &mut self,
        config: Arc<TxnConfig>,
        speculative: Arc<SpeculativeConfig>,
        counter: &Arc<GlobalConflictCounter>,
    ) {
        if self.is_live() {
            self.release_records();
            self.status = TxnStatus::Aborted;
        }
        // handles given out by the previous owner must not reach the next one
        self.latch = None;
        if !Arc::ptr_eq(self.conflict.global(), counter) {
            self.conflict = LocalConflictCounter::new(Arc::clone(counter));
        }
        self.config = config;
        self.speculative = speculative;
        self.reset();
    }

    /// Rebuild as a fat transaction after a speculative failure
    ///
    /// The attempt number and remaining timeout carry over.
    pub fn upgrade_to_fat(&mut self) {
        if self.is_live() {
            self.release_records();
        }
        self.clear_records();
        self.lean = false;
        self.status = TxnStatus::Active;
        self.conflict.reset();
        debug!(
            target: "orecstm::txn",
            family = %self.config.family_name,
            attempt = self.attempt,
            "Rebuilt as fat transaction"
        );
    }

    fn release_records(&mut self) {
        for record in self.records.iter_mut() {
            record.release_after_failure();
        }
        self.clear_records();
    }

    fn clear_records(&mut self) {
        self.records.clear();
        self.index.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_live() {
            self.release_records();
            self.status = TxnStatus::Aborted;
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("lean", &self.lean)
            .field("records", &self.records.len())
            .finish()
    }
}
