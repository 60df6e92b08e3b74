//! Transaction-local records
//!
//! A transaction keeps one [`Tranlocal`] per cell it opened: the value it
//! sees (and possibly modified), the version it read, the lock it holds
//! and how it arrived on the cell's orec. Everything the commit protocol
//! needs from a record goes through the type-erased [`TranlocalEntry`]
//! trait, so one transaction can hold cells of different value types.

use crate::cell::{CellCore, TxnRef, TxnValue};
use crate::latch::RetryLatch;
use crate::listeners::{DetachedListeners, ListenerRegistration};
use crate::orec::{ArriveStatus, Orec};
use orecstm_core::{CellId, ConflictKind, LockMode};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// How a cell was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read only
    Read,
    /// Read, may be modified
    Write,
    /// Blind commuting updates, not yet loaded
    Commute,
    /// Created by this transaction, not yet published
    Constructing,
}

/// Bookkeeping shared by every record, independent of the value type
#[derive(Debug, Clone, Copy)]
pub struct TranlocalMeta {
    /// How the cell was opened
    pub mode: AccessMode,
    /// Committed version the record is based on
    pub version_seen: u64,
    /// Lock currently held on the cell's orec
    pub lock_mode: LockMode,
    /// How this record arrived on the orec; `None` if it has not (yet)
    pub arrive_status: Option<ArriveStatus>,
}

impl TranlocalMeta {
    pub(crate) fn arrived(
        mode: AccessMode,
        status: ArriveStatus,
        lock_mode: LockMode,
        version: u64,
    ) -> Self {
        TranlocalMeta {
            mode,
            version_seen: version,
            lock_mode,
            arrive_status: Some(status),
        }
    }
}

/// Deferred commuting function
pub type CommuteFn<V> = Box<dyn FnOnce(V) -> V + Send>;

/// Undo an arrival after the attempt failed
pub(crate) fn release_after_failure(orec: &Orec, meta: &mut TranlocalMeta) {
    match (meta.arrive_status, meta.lock_mode) {
        (Some(ArriveStatus::Normal), LockMode::None) => orec.depart_after_failure(),
        (Some(ArriveStatus::Normal), held) => orec.depart_after_failure_and_unlock(held),
        (Some(ArriveStatus::Unregistered), LockMode::None) => {}
        (Some(ArriveStatus::Unregistered), held) => orec.unlock_when_unregistered(held),
        _ => {}
    }
    meta.arrive_status = None;
    meta.lock_mode = LockMode::None;
}

/// Undo an arrival after a commit that left the cell unchanged
pub(crate) fn release_after_reading(orec: &Orec, meta: &mut TranlocalMeta) {
    match (meta.arrive_status, meta.lock_mode) {
        (Some(ArriveStatus::Normal), LockMode::None) => orec.depart_after_reading(),
        (Some(ArriveStatus::Normal), held) => orec.depart_after_reading_and_unlock(held),
        (Some(ArriveStatus::Unregistered), LockMode::None) => {}
        (Some(ArriveStatus::Unregistered), held) => orec.unlock_when_unregistered(held),
        _ => {}
    }
    meta.arrive_status = None;
    meta.lock_mode = LockMode::None;
}

/// A transaction's private view of one cell
pub struct Tranlocal<V: TxnValue> {
    cell: TxnRef<V>,
    meta: TranlocalMeta,
    value: Option<V>,
    // value as loaded, kept once the record may be written
    prior: Option<V>,
    pending: Vec<CommuteFn<V>>,
    dirty: bool,
    published: bool,
}

impl<V: TxnValue> Tranlocal<V> {
    pub(crate) fn opened(
        cell: TxnRef<V>,
        mode: AccessMode,
        status: ArriveStatus,
        lock_mode: LockMode,
        version: u64,
        value: V,
    ) -> Self {
        let prior = match mode {
            AccessMode::Write => Some(value.clone()),
            _ => None,
        };
        Tranlocal {
            cell,
            meta: TranlocalMeta::arrived(mode, status, lock_mode, version),
            value: Some(value),
            prior,
            pending: Vec::new(),
            dirty: false,
            published: false,
        }
    }

    pub(crate) fn constructing(cell: TxnRef<V>, value: V) -> Self {
        Tranlocal {
            cell,
            meta: TranlocalMeta::arrived(
                AccessMode::Constructing,
                ArriveStatus::Normal,
                LockMode::Exclusive,
                0,
            ),
            value: Some(value),
            prior: None,
            pending: Vec::new(),
            dirty: true,
            published: false,
        }
    }

    pub(crate) fn commuting(cell: TxnRef<V>, function: CommuteFn<V>) -> Self {
        Tranlocal {
            cell,
            meta: TranlocalMeta {
                mode: AccessMode::Commute,
                version_seen: 0,
                lock_mode: LockMode::None,
                arrive_status: None,
            },
            value: None,
            prior: None,
            pending: vec![function],
            dirty: false,
            published: false,
        }
    }

    /// The cell this record belongs to
    pub fn cell(&self) -> &TxnRef<V> {
        &self.cell
    }

    /// Bookkeeping
    pub fn meta(&self) -> &TranlocalMeta {
        &self.meta
    }

    /// How the cell was opened
    pub fn mode(&self) -> AccessMode {
        self.meta.mode
    }

    /// Current value; `None` only while commutes are still deferred
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Replace the value, returning the previous one
    ///
    /// Only meaningful on records opened for write or construction.
    pub fn replace(&mut self, value: V) -> Option<V> {
        self.value.replace(value)
    }

    /// Commuting functions waiting to be applied
    pub fn pending_commutes(&self) -> usize {
        self.pending.len()
    }

    /// Was the value found to differ from the loaded one at prepare time?
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn upgrade_to_write(&mut self) {
        if self.meta.mode == AccessMode::Read {
            self.prior = self.value.clone();
            self.meta.mode = AccessMode::Write;
        }
    }

    /// Queue a commute, or apply it right away if the value is loaded
    pub(crate) fn add_commute(&mut self, function: CommuteFn<V>) {
        match self.meta.mode {
            AccessMode::Commute => self.pending.push(function),
            _ => {
                self.upgrade_to_write();
                if let Some(current) = self.value.take() {
                    self.value = Some(function(current));
                }
            }
        }
    }

    /// Arrive on the cell, load it and fold the deferred commutes into it
    pub(crate) fn materialize(&mut self, spin: u32, lock_mode: LockMode) -> Result<(), ConflictKind> {
        if self.meta.mode != AccessMode::Commute {
            return Ok(());
        }
        let status = self.cell.core().orec().try_lock_and_arrive(spin, lock_mode);
        if status == ArriveStatus::LockNotFree {
            return Err(ConflictKind::Locked);
        }
        self.meta.arrive_status = Some(status);
        self.meta.lock_mode = lock_mode;

        let (version, loaded) = match self.cell.load_committed() {
            Some(committed) => committed,
            None => return Err(ConflictKind::Locked),
        };
        let mut current = loaded.clone();
        for function in self.pending.drain(..) {
            current = function(current);
        }
        self.meta.version_seen = version;
        self.meta.mode = AccessMode::Write;
        self.prior = Some(loaded);
        self.value = Some(current);
        Ok(())
    }

    /// Take `lock_mode` on the cell if not held yet, checking the version
    pub(crate) fn ensure_lock(&mut self, spin: u32, lock_mode: LockMode) -> Result<(), ConflictKind> {
        self.cell
            .core()
            .try_lock_and_check_conflict(spin, &mut self.meta, lock_mode)
    }
}

impl<V: TxnValue + fmt::Debug> fmt::Debug for Tranlocal<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("cell", &self.cell.id())
            .field("meta", &self.meta)
            .field("value", &self.value)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Type-erased view of a record, used by the commit protocol
pub(crate) trait TranlocalEntry: Send {
    fn cell_id(&self) -> CellId;

    fn meta(&self) -> &TranlocalMeta;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Is this record going to publish a new version?
    fn is_write(&self) -> bool;

    /// Materialize commutes and lock the record if it is a dirty write
    fn prepare_for_commit(
        &mut self,
        spin: u32,
        commit_mode: LockMode,
        dirty_check: bool,
    ) -> Result<(), ConflictKind>;

    /// Has the cell moved past the version this record depends on?
    fn has_read_conflict(&self) -> bool;

    /// Publish the new value under the exclusive lock
    ///
    /// Returns the detached listeners and whether other transactions were
    /// still depending on the old version.
    fn publish(&mut self) -> (DetachedListeners, bool);

    fn release_after_commit(&mut self);

    fn release_after_failure(&mut self);

    fn register_listener(&self, latch: &Arc<dyn RetryLatch>, era: u64) -> ListenerRegistration;
}

impl<V: TxnValue> Tranlocal<V> {
    fn core(&self) -> &CellCore {
        self.cell.core()
    }
}

impl<V: TxnValue> TranlocalEntry for Tranlocal<V> {
    fn cell_id(&self) -> CellId {
        self.cell.id()
    }

    fn meta(&self) -> &TranlocalMeta {
        &self.meta
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn is_write(&self) -> bool {
        match self.meta.mode {
            AccessMode::Read => false,
            AccessMode::Commute | AccessMode::Constructing => true,
            AccessMode::Write => self.dirty,
        }
    }

    fn prepare_for_commit(
        &mut self,
        spin: u32,
        commit_mode: LockMode,
        dirty_check: bool,
    ) -> Result<(), ConflictKind> {
        match self.meta.mode {
            AccessMode::Read => Ok(()),
            AccessMode::Constructing => {
                self.dirty = true;
                Ok(())
            }
            AccessMode::Commute => {
                self.materialize(spin, commit_mode)?;
                self.dirty = true;
                Ok(())
            }
            AccessMode::Write => {
                self.dirty = !dirty_check || self.value != self.prior;
                if !self.dirty {
                    return Ok(());
                }
                self.ensure_lock(spin, commit_mode)
            }
        }
    }

    fn has_read_conflict(&self) -> bool {
        match self.meta.mode {
            AccessMode::Constructing | AccessMode::Commute => false,
            AccessMode::Read | AccessMode::Write => {
                self.meta.arrive_status.is_some() && self.core().has_read_conflict(&self.meta)
            }
        }
    }

    fn publish(&mut self) -> (DetachedListeners, bool) {
        let orec = self.cell.core().orec();
        orec.upgrade_write_to_exclusive(self.meta.lock_mode);
        self.meta.lock_mode = LockMode::Exclusive;

        let own = u64::from(self.meta.arrive_status == Some(ArriveStatus::Normal));
        let dependents = orec.state().surplus > own;

        let version = self.meta.version_seen + 1;
        let listeners = match self.value.take() {
            Some(value) => self.cell.publish(value, version),
            None => DetachedListeners::default(),
        };
        self.meta.version_seen = version;
        self.published = true;
        (listeners, dependents)
    }

    fn release_after_commit(&mut self) {
        if self.published {
            self.cell.core().orec().depart_after_update_and_unlock();
            self.meta.arrive_status = None;
            self.meta.lock_mode = LockMode::None;
        } else {
            release_after_reading(self.cell.core().orec(), &mut self.meta);
        }
    }

    fn release_after_failure(&mut self) {
        // an unpublished cell stays locked by its constructor for good
        if self.meta.mode == AccessMode::Constructing {
            return;
        }
        release_after_failure(self.cell.core().orec(), &mut self.meta);
    }

    fn register_listener(&self, latch: &Arc<dyn RetryLatch>, era: u64) -> ListenerRegistration {
        match self.meta.mode {
            AccessMode::Constructing | AccessMode::Commute => ListenerRegistration::None,
            AccessMode::Read | AccessMode::Write => {
                self.core()
                    .register_change_listener(latch, self.meta.version_seen, era)
            }
        }
    }
}
