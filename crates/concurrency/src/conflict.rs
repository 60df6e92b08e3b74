//! Global conflict counter
//!
//! Committing writers bump the global counter when a published cell still
//! had other transactions depending on the old version. Each transaction
//! keeps a local copy; when the global value moves, the transaction
//! revalidates its whole read set before trusting a newly opened cell.
//!
//! This is what keeps a running transaction from mixing an old read with a
//! newer one, without validating the read set on every single open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, monotonically increasing conflict counter
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    /// A counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer left readers behind on an old version
    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Current value
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// A transaction's last-seen copy of the global counter
#[derive(Debug, Clone)]
pub struct LocalConflictCounter {
    global: Arc<GlobalConflictCounter>,
    local: u64,
}

impl LocalConflictCounter {
    /// Start in sync with `global`
    pub fn new(global: Arc<GlobalConflictCounter>) -> Self {
        let local = global.count();
        LocalConflictCounter { global, local }
    }

    /// Re-sync with the global counter, dropping any pending signal
    pub fn reset(&mut self) {
        self.local = self.global.count();
    }

    /// Sync with the global counter; true if it moved since the last sync
    pub fn sync_and_check_conflict(&mut self) -> bool {
        let global = self.global.count();
        if global == self.local {
            return false;
        }
        self.local = global;
        true
    }

    /// The counter this copy follows
    pub fn global(&self) -> &Arc<GlobalConflictCounter> {
        &self.global
    }
}
