//! Transactional cells
//!
//! A [`TxnRef<V>`] is a shared handle to one transactional memory cell.
//! Each cell carries:
//! - an [`Orec`] for contention management
//! - a version counter, bumped once per published write
//! - the committed `(version, value)` node behind an epoch-managed pointer
//! - a [`ListenerChain`] of blocked retries waiting for the next change
//!
//! The committed node is only replaced by a writer holding the exclusive
//! lock. Readers clone the value out of whatever node they load under an
//! epoch guard; old nodes are reclaimed once no guard can still see them.
//!
//! # Usage
//!
//! ```ignore
//! let account = TxnRef::new(100u64);
//! let mut tx = Transaction::new(config, counter);
//! let balance = account.get(&mut tx)?;
//! account.set(&mut tx, balance - 10)?;
//! tx.commit()?;
//! ```

use crate::latch::RetryLatch;
use crate::listeners::{DetachedListeners, ListenerChain, ListenerRegistration};
use crate::orec::{self, word, ArriveStatus, Orec, OrecState};
use crate::tranlocal::{self, AccessMode, Tranlocal, TranlocalMeta};
use crate::transaction::Transaction;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use orecstm_core::{CellId, ConflictKind, LockMode, SpeculativeReason, StmError, StmResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Values that can live in a transactional cell
///
/// `PartialEq` drives the dirty check at commit time.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> TxnValue for T {}

/// Spin rounds [`TxnRef::atomic_get`] waits on an exclusively locked cell
pub const ATOMIC_GET_SPIN: u32 = 4096;

pub(crate) struct Committed<V> {
    version: u64,
    value: V,
}

/// The value-independent half of a cell
pub struct CellCore {
    id: CellId,
    orec: Orec,
    version: AtomicU64,
    listeners: ListenerChain,
}

impl CellCore {
    fn published() -> Self {
        CellCore {
            id: CellId::next(),
            orec: Orec::new(),
            version: AtomicU64::new(1),
            listeners: ListenerChain::new(),
        }
    }

    fn under_construction() -> Self {
        CellCore {
            id: CellId::next(),
            orec: Orec::new_for_construction(),
            version: AtomicU64::new(0),
            listeners: ListenerChain::new(),
        }
    }

    /// Cell identity
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The cell's ownership record
    pub fn orec(&self) -> &Orec {
        &self.orec
    }

    /// Latest published version; 0 while under construction
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Take `desired` (if not already held) and make sure the cell has not
    /// moved past `meta.version_seen`
    ///
    /// The lock stays recorded in `meta` even when the version check fails,
    /// so the caller's abort releases it.
    pub fn try_lock_and_check_conflict(
        &self,
        spin: u32,
        meta: &mut TranlocalMeta,
        desired: LockMode,
    ) -> Result<(), ConflictKind> {
        if meta.lock_mode >= desired {
            return Ok(());
        }
        if !self.orec.try_upgrade_lock(spin, meta.lock_mode, desired) {
            return Err(ConflictKind::Locked);
        }
        meta.lock_mode = desired;
        if self.version() != meta.version_seen {
            return Err(ConflictKind::Write);
        }
        Ok(())
    }

    /// Is a record based on `meta` stale?
    ///
    /// A record holding any lock cannot be overtaken. Otherwise the cell
    /// conflicts if someone else holds the exclusive lock (a publish may be
    /// in progress) or the version already moved.
    pub fn has_read_conflict(&self, meta: &TranlocalMeta) -> bool {
        if meta.lock_mode != LockMode::None {
            return false;
        }
        if word::has_exclusive_lock(self.orec.load()) {
            return true;
        }
        self.version() != meta.version_seen
    }

    /// Hang `latch` on the cell until it moves past `version_seen`
    pub fn register_change_listener(
        &self,
        latch: &Arc<dyn RetryLatch>,
        version_seen: u64,
        era: u64,
    ) -> ListenerRegistration {
        if self.version() != version_seen {
            latch.open(era);
            return ListenerRegistration::NotNeeded;
        }
        self.listeners.push(Arc::clone(latch), era);
        // a publish may have detached the chain just before the push
        if self.version() != version_seen {
            latch.open(era);
        }
        ListenerRegistration::Done
    }
}

struct RefInner<V> {
    core: CellCore,
    value: Atomic<Committed<V>>,
}

impl<V> Drop for RefInner<V> {
    fn drop(&mut self) {
        // SAFETY: last handle is gone, nobody else can reach the node
        unsafe {
            let guard = epoch::unprotected();
            let node = self.value.load(Ordering::Relaxed, guard);
            if !node.is_null() {
                drop(node.into_owned());
            }
        }
    }
}

/// Shared handle to a transactional memory cell
pub struct TxnRef<V> {
    inner: Arc<RefInner<V>>,
}

impl<V> Clone for TxnRef<V> {
    fn clone(&self) -> Self {
        TxnRef {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: TxnValue + fmt::Debug> fmt::Debug for TxnRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRef")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("orec", &self.inner.core.orec)
            .finish()
    }
}

impl<V: TxnValue> TxnRef<V> {
    /// A published cell holding `value` at version 1
    pub fn new(value: V) -> Self {
        TxnRef {
            inner: Arc::new(RefInner {
                core: CellCore::published(),
                value: Atomic::new(Committed { version: 1, value }),
            }),
        }
    }

    /// A cell created inside `tx`, published when `tx` commits
    ///
    /// Until then the cell is exclusively locked; nobody else can open it.
    pub fn new_in(tx: &mut Transaction, value: V) -> StmResult<Self> {
        tx.ensure_active("new_in")?;
        let cell = TxnRef {
            inner: Arc::new(RefInner {
                core: CellCore::under_construction(),
                value: Atomic::null(),
            }),
        };
        if tx.config().readonly {
            return Err(tx.fail(StmError::ReadonlyViolation { cell: cell.id() }));
        }
        tx.admit()?;
        tx.push_record(Tranlocal::constructing(cell.clone(), value));
        Ok(cell)
    }

    /// Cell identity
    pub fn id(&self) -> CellId {
        self.inner.core.id
    }

    /// Latest published version; 0 while under construction
    pub fn version(&self) -> u64 {
        self.inner.core.version()
    }

    /// Decoded snapshot of the cell's orec
    pub fn orec_state(&self) -> OrecState {
        self.inner.core.orec.state()
    }

    /// Do both handles point at the same cell?
    pub fn ptr_eq(&self, other: &TxnRef<V>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn core(&self) -> &CellCore {
        &self.inner.core
    }

    /// Committed `(version, value)`, or `None` before the first publish
    pub(crate) fn load_committed(&self) -> Option<(u64, V)> {
        let guard = &epoch::pin();
        let node = self.inner.value.load(Ordering::Acquire, guard);
        // SAFETY: replaced nodes are retired with `defer_destroy`, so a node
        // loaded under a pinned guard outlives the guard.
        unsafe { node.as_ref() }.map(|c| (c.version, c.value.clone()))
    }

    /// Swap in a new committed node and detach the waiting listeners
    ///
    /// Caller holds the exclusive lock.
    pub(crate) fn publish(&self, value: V, version: u64) -> DetachedListeners {
        let guard = &epoch::pin();
        let old = self.inner.value.swap(
            Owned::new(Committed { version, value }),
            Ordering::AcqRel,
            guard,
        );
        if !old.is_null() {
            // SAFETY: the node is unlinked; readers that still hold it are pinned
            unsafe { guard.defer_destroy(old) };
        }
        self.inner.core.version.store(version, Ordering::Release);
        self.inner.core.listeners.detach()
    }

    // ========================================================================
    // Opening
    // ========================================================================

    /// Open for reading, optionally taking `lock_mode` right away
    pub fn open_for_read<'t>(
        &self,
        tx: &'t mut Transaction,
        lock_mode: LockMode,
    ) -> StmResult<&'t mut Tranlocal<V>> {
        tx.ensure_active("open_for_read")?;
        let lock_mode = lock_mode.max(tx.config().read_lock_mode());
        self.check_eager_lock(tx, lock_mode)?;
        let idx = match tx.index_of(self.id()) {
            Some(idx) => idx,
            None => return self.open_new(tx, AccessMode::Read, lock_mode),
        };

        let spin = tx.config().spin_count;
        let record = tx.record_mut::<V>(idx)?;
        let materialized = record.mode() == AccessMode::Commute;
        let outcome = if materialized {
            record.materialize(spin, lock_mode)
        } else {
            record.ensure_lock(spin, lock_mode).map_err(|kind| match kind {
                ConflictKind::Write => ConflictKind::Read,
                other => other,
            })
        };
        if let Err(kind) = outcome {
            return Err(tx.fail(StmError::conflict(kind, self.id())));
        }
        if materialized {
            tx.check_read_consistency()?;
        }
        tx.record_mut::<V>(idx)
    }

    /// Open for writing, optionally taking `lock_mode` right away
    pub fn open_for_write<'t>(
        &self,
        tx: &'t mut Transaction,
        lock_mode: LockMode,
    ) -> StmResult<&'t mut Tranlocal<V>> {
        tx.ensure_active("open_for_write")?;
        if tx.config().readonly {
            return Err(tx.fail(StmError::ReadonlyViolation { cell: self.id() }));
        }
        let lock_mode = lock_mode.max(tx.config().write_lock_mode());
        self.check_eager_lock(tx, lock_mode)?;
        let idx = match tx.index_of(self.id()) {
            Some(idx) => idx,
            None => return self.open_new(tx, AccessMode::Write, lock_mode),
        };

        let spin = tx.config().spin_count;
        let record = tx.record_mut::<V>(idx)?;
        let materialized = record.mode() == AccessMode::Commute;
        let outcome = if materialized {
            record.materialize(spin, lock_mode)
        } else {
            record.upgrade_to_write();
            record.ensure_lock(spin, lock_mode)
        };
        if let Err(kind) = outcome {
            return Err(tx.fail(StmError::conflict(kind, self.id())));
        }
        if materialized {
            tx.check_read_consistency()?;
        }
        tx.record_mut::<V>(idx)
    }

    /// The record of a cell this transaction is constructing
    pub fn open_for_construction<'t>(
        &self,
        tx: &'t mut Transaction,
    ) -> StmResult<&'t mut Tranlocal<V>> {
        tx.ensure_active("open_for_construction")?;
        if let Some(idx) = tx.index_of(self.id()) {
            if tx.record_mut::<V>(idx)?.mode() == AccessMode::Constructing {
                return tx.record_mut::<V>(idx);
            }
        }
        Err(tx.fail(StmError::IllegalState(format!(
            "cell {} is not under construction in this transaction",
            self.id()
        ))))
    }

    /// Queue a commuting update without reading the cell
    ///
    /// If the cell is already open the function is applied immediately.
    pub fn open_for_commute<F>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: FnOnce(V) -> V + Send + 'static,
    {
        tx.ensure_active("open_for_commute")?;
        if tx.config().readonly {
            return Err(tx.fail(StmError::ReadonlyViolation { cell: self.id() }));
        }
        if let Some(idx) = tx.index_of(self.id()) {
            tx.record_mut::<V>(idx)?.add_commute(Box::new(function));
            return Ok(());
        }
        if tx.is_lean() {
            return Err(tx.speculative_failure(SpeculativeReason::CommuteRequired));
        }
        tx.admit()?;
        tx.push_record(Tranlocal::commuting(self.clone(), Box::new(function)));
        Ok(())
    }

    fn check_eager_lock(&self, tx: &mut Transaction, lock_mode: LockMode) -> StmResult<()> {
        if tx.is_lean() && lock_mode != LockMode::None {
            return Err(tx.speculative_failure(SpeculativeReason::EagerLockRequired));
        }
        Ok(())
    }

    fn open_new<'t>(
        &self,
        tx: &'t mut Transaction,
        mode: AccessMode,
        lock_mode: LockMode,
    ) -> StmResult<&'t mut Tranlocal<V>> {
        tx.admit()?;
        let status = self
            .core()
            .orec()
            .try_lock_and_arrive(tx.config().spin_count, lock_mode);
        if status == ArriveStatus::LockNotFree {
            return Err(tx.fail(StmError::Locked { cell: self.id() }));
        }
        let (version, value) = match self.load_committed() {
            Some(committed) => committed,
            None => {
                let mut meta = TranlocalMeta::arrived(mode, status, lock_mode, 0);
                tranlocal::release_after_failure(self.core().orec(), &mut meta);
                return Err(tx.fail(StmError::IllegalState(format!(
                    "cell {} has never been published",
                    self.id()
                ))));
            }
        };
        let idx = tx.push_record(Tranlocal::opened(
            self.clone(),
            mode,
            status,
            lock_mode,
            version,
            value,
        ));
        tx.check_read_consistency()?;
        tx.record_mut::<V>(idx)
    }

    /// Read without leaving a record behind (read tracking disabled)
    fn read_untracked(&self, tx: &mut Transaction) -> StmResult<V> {
        let orec = self.core().orec();
        let status = orec.arrive(tx.config().spin_count);
        if status == ArriveStatus::LockNotFree {
            return Err(tx.fail(StmError::Locked { cell: self.id() }));
        }
        let loaded = self.load_committed();
        if status == ArriveStatus::Normal {
            orec.depart_after_reading();
        }
        match loaded {
            Some((_, value)) => Ok(value),
            None => Err(tx.fail(StmError::IllegalState(format!(
                "cell {} has never been published",
                self.id()
            )))),
        }
    }

    fn loaded(&self, record: &Tranlocal<V>) -> StmResult<V> {
        record.value().cloned().ok_or_else(|| {
            StmError::IllegalState(format!("cell {} has no loaded value", self.id()))
        })
    }

    // ========================================================================
    // Transactional access
    // ========================================================================

    /// Read the cell
    pub fn get(&self, tx: &mut Transaction) -> StmResult<V> {
        let untracked = !tx.config().read_tracking
            && tx.config().read_lock_mode() == LockMode::None
            && tx.is_active()
            && tx.index_of(self.id()).is_none();
        if untracked {
            return self.read_untracked(tx);
        }
        let record = self.open_for_read(tx, LockMode::None)?;
        self.loaded(record)
    }

    /// Read the cell and take `lock_mode` on it
    pub fn get_and_lock(&self, tx: &mut Transaction, lock_mode: LockMode) -> StmResult<V> {
        let record = self.open_for_read(tx, lock_mode)?;
        self.loaded(record)
    }

    /// Write the cell
    pub fn set(&self, tx: &mut Transaction, value: V) -> StmResult<()> {
        self.open_for_write(tx, LockMode::None)?.replace(value);
        Ok(())
    }

    /// Write the cell, returning the previous value
    pub fn get_and_set(&self, tx: &mut Transaction, value: V) -> StmResult<V> {
        match self.open_for_write(tx, LockMode::None)?.replace(value) {
            Some(previous) => Ok(previous),
            None => Err(tx.fail(StmError::IllegalState(format!(
                "cell {} has no loaded value",
                self.id()
            )))),
        }
    }

    /// Replace the value with `function(current)`, returning the new value
    pub fn alter<F>(&self, tx: &mut Transaction, function: F) -> StmResult<V>
    where
        F: FnOnce(&V) -> V,
    {
        let record = self.open_for_write(tx, LockMode::None)?;
        let next = match record.value() {
            Some(current) => function(current),
            None => {
                let cell = self.id();
                return Err(tx.fail(StmError::IllegalState(format!(
                    "cell {} has no loaded value",
                    cell
                ))));
            }
        };
        record.replace(next.clone());
        Ok(next)
    }

    /// Apply `function` at commit time without reading the cell now
    pub fn commute<F>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: FnOnce(V) -> V + Send + 'static,
    {
        self.open_for_commute(tx, function)
    }

    /// Block (via retry) until `predicate` holds for the value
    ///
    /// Returns [`StmError::RetryRequested`] when it does not; the driving
    /// loop turns that into a blocking [`Transaction::retry`].
    pub fn await_value<P>(&self, tx: &mut Transaction, predicate: P) -> StmResult<()>
    where
        P: FnOnce(&V) -> bool,
    {
        let value = self.get(tx)?;
        if predicate(&value) {
            Ok(())
        } else {
            Err(StmError::RetryRequested)
        }
    }

    // ========================================================================
    // Non-transactional access
    // ========================================================================

    /// Read the latest committed value outside any transaction
    ///
    /// Waits out a concurrent publish, so a value seen here is never newer
    /// than what a transaction committing several cells has finished
    /// releasing. Gives up with [`StmError::Locked`] after
    /// [`ATOMIC_GET_SPIN`] rounds on an exclusively locked cell.
    pub fn atomic_get(&self) -> StmResult<V> {
        self.atomic_get_with_spin(ATOMIC_GET_SPIN)
    }

    /// [`atomic_get`](Self::atomic_get) with an explicit spin budget
    pub fn atomic_get_with_spin(&self, spin: u32) -> StmResult<V> {
        let orec = self.core().orec();
        let mut remaining = spin.max(1);
        loop {
            if self.version() == 0 {
                return Err(StmError::IllegalState(format!(
                    "cell {} has never been published",
                    self.id()
                )));
            }
            if !word::has_exclusive_lock(orec.load()) {
                if let Some((version, value)) = self.load_committed() {
                    if !word::has_exclusive_lock(orec.load()) && version == self.version() {
                        return Ok(value);
                    }
                }
            }
            remaining -= 1;
            if remaining == 0 {
                return Err(StmError::Locked { cell: self.id() });
            }
            orec::spin_wait(remaining);
        }
    }
}
