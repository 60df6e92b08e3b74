//! Per-cell change listener chains
//!
//! Every cell owns a lock-free stack of `(latch, era)` registrations.
//! Blocking retries push onto it; a committing writer detaches the whole
//! stack with one swap after publishing and opens every latch once all of
//! its locks are released.
//!
//! Nodes are never dereferenced while shared: a pusher only links its own
//! node in front of whatever head it saw, and the detacher takes ownership
//! of the entire chain through the swap. crossbeam-epoch provides the
//! atomic pointer and the ownership transfer.
//!
//! A cell that is read by blocking retries but rarely written would collect
//! one node per retry. Once the chain doubles past its last live size, a
//! pusher prunes it: takes the chain, drops registrations nobody can still
//! be waiting on, and links the rest back. Pruning and detaching exclude
//! each other, so a publish never misses a live registration that a prune
//! is holding.

use crate::latch::RetryLatch;
use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Chain length below which pushes never prune
const PRUNE_MIN: usize = 16;

type Entries = SmallVec<[(Arc<dyn RetryLatch>, u64); 4]>;

struct ListenerNode {
    latch: Arc<dyn RetryLatch>,
    era: u64,
    next: Atomic<ListenerNode>,
}

/// Outcome of registering a retry latch on a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRegistration {
    /// Latch is on the chain and will be opened by the next commit
    Done,
    /// The cell already moved past the version read; latch opened right away
    NotNeeded,
    /// Nothing to listen on (the cell is still being constructed)
    None,
}

/// Lock-free stack of retry registrations
pub struct ListenerChain {
    head: Atomic<ListenerNode>,
    // registrations linked, counted before they become visible
    len: AtomicUsize,
    prune_at: AtomicUsize,
    taking: Mutex<()>,
}

/// Can anyone still be woken through this registration?
fn is_live(latch: &Arc<dyn RetryLatch>, era: u64) -> bool {
    Arc::strong_count(latch) > 1 && latch.era() == era && !latch.is_open()
}

impl ListenerChain {
    /// An empty chain
    pub fn new() -> Self {
        ListenerChain {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
            prune_at: AtomicUsize::new(PRUNE_MIN),
            taking: Mutex::new(()),
        }
    }

    /// Push a registration for `latch` in `era`
    pub fn push(&self, latch: Arc<dyn RetryLatch>, era: u64) {
        self.link(latch, era);
        if self.len.load(Ordering::Relaxed) >= self.prune_at.load(Ordering::Relaxed) {
            self.prune();
        }
    }

    fn link(&self, latch: Arc<dyn RetryLatch>, era: u64) {
        self.len.fetch_add(1, Ordering::Relaxed);
        let guard = &epoch::pin();
        let mut node = Owned::new(ListenerNode {
            latch,
            era,
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    /// Drop dead registrations; skipped while another thread is taking
    fn prune(&self) {
        let Some(_taking) = self.taking.try_lock() else {
            return;
        };
        let taken = self.take();
        let total = taken.len();
        let live: Entries = taken
            .into_iter()
            .filter(|(latch, era)| is_live(latch, *era))
            .collect();
        self.len.fetch_sub(total, Ordering::Relaxed);
        self.prune_at
            .store((live.len() * 2).max(PRUNE_MIN), Ordering::Relaxed);
        for (latch, era) in live {
            self.link(latch, era);
        }
    }

    /// Take every registration off the chain
    pub fn detach(&self) -> DetachedListeners {
        let _taking = self.taking.lock();
        let entries = self.take();
        self.len.fetch_sub(entries.len(), Ordering::Relaxed);
        DetachedListeners { entries }
    }

    fn take(&self) -> Entries {
        let guard = &epoch::pin();
        let mut current = self.head.swap(Shared::null(), Ordering::AcqRel, guard);
        let mut entries = Entries::new();
        while !current.is_null() {
            // SAFETY: the swap unlinked the chain from the only shared slot;
            // no other thread holds a path to these nodes.
            let node = unsafe { current.into_owned() }.into_box();
            let ListenerNode { latch, era, next } = *node;
            current = next.load(Ordering::Relaxed, guard);
            entries.push((latch, era));
        }
        entries
    }

    /// Registrations currently linked (approximate under concurrent pushes)
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// No registrations pending?
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.head.load(Ordering::Acquire, guard).is_null()
    }
}

impl Default for ListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenerChain {
    fn drop(&mut self) {
        drop(self.detach());
    }
}

/// Registrations taken off a chain, waiting to be opened
#[derive(Default)]
pub struct DetachedListeners {
    entries: Entries,
}

impl DetachedListeners {
    /// Open every latch in the era it registered with
    pub fn open_all(self) {
        for (latch, era) in self.entries {
            latch.open(era);
        }
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No registrations?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
