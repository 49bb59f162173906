use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Handle to a registered backend (the Rust stand-in for a PostgreSQL "backend process"; here,
/// one Tokio task/thread that owns a private view of the shared engine).
pub type BackendId = u32;

/// Every backend registered against one engine, keyed by id. Shared by the completion path (to
/// route a finished handle to its owner) and by providers that need to look another backend up
/// (the worker pool's `route_to_owner`).
pub type BackendRegistry = Arc<RwLock<HashMap<BackendId, Arc<PerBackend>>>>;

/// Per-backend membership lists and counters. Mirrors `PgAioPerBackend` in the original source:
/// eight distinct lists a handle can be on, plus lifetime counters for observability.
pub struct PerBackend {
    pub id: BackendId,
    /// Locally cached free slots this backend doesn't need to return to the global slab yet.
    pub unused: Mutex<VecDeque<u32>>,
    /// Acquired by this backend, not yet staged via a `start_*` call.
    pub outstanding: Mutex<VecDeque<u32>>,
    /// Staged, not yet submitted.
    pub pending: Mutex<VecDeque<u32>>,
    /// In flight, still user-referenced.
    pub issued: Mutex<VecDeque<u32>>,
    /// In flight, user reference already dropped.
    pub issued_abandoned: Mutex<VecDeque<u32>>,
    /// Completed, not yet run through the shared callback.
    pub reaped: Mutex<VecDeque<u32>>,
    /// Completed and processed locally, awaiting the owner's local callback.
    pub local_completed: Mutex<VecDeque<u32>>,
    /// Completed by a *different* backend's drain; handed back under `foreign_completed_lock`.
    foreign_completed_lock: Mutex<VecDeque<u32>>,

    pub inflight_count: AtomicU32,
    /// Last ring context this backend successfully used (kernel-ring backend only).
    pub last_context: AtomicU32,

    pub executed_total: AtomicU64,
    pub issued_total: AtomicU64,
    pub submissions_total: AtomicU64,
    pub foreign_completed_total: AtomicU64,
    pub retry_total: AtomicU64,
}

impl PerBackend {
    pub fn new(id: BackendId) -> Self {
        Self {
            id,
            unused: Mutex::new(VecDeque::new()),
            outstanding: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            issued: Mutex::new(VecDeque::new()),
            issued_abandoned: Mutex::new(VecDeque::new()),
            reaped: Mutex::new(VecDeque::new()),
            local_completed: Mutex::new(VecDeque::new()),
            foreign_completed_lock: Mutex::new(VecDeque::new()),
            inflight_count: AtomicU32::new(0),
            last_context: AtomicU32::new(0),
            executed_total: AtomicU64::new(0),
            issued_total: AtomicU64::new(0),
            submissions_total: AtomicU64::new(0),
            foreign_completed_total: AtomicU64::new(0),
            retry_total: AtomicU64::new(0),
        }
    }

    pub fn push_foreign_completed(&self, slot: u32) {
        self.foreign_completed_lock.lock().push_back(slot);
        self.foreign_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain foreign completions into `local_completed`; called by the owner on its own thread,
    /// never from inside a signal handler.
    pub fn migrate_foreign_completed(&self) {
        let mut foreign = self.foreign_completed_lock.lock();
        if foreign.is_empty() {
            return;
        }
        let mut local = self.local_completed.lock();
        local.extend(foreign.drain(..));
    }

    pub fn inflight(&self) -> u32 {
        self.inflight_count.load(Ordering::Acquire)
    }

    /// Oldest in-flight slot, preferring a still-referenced (`issued`) entry over an abandoned one
    /// when both are available, since a caller blocked on `issued` is more likely waiting right
    /// now (see DESIGN.md Open Question 3).
    pub fn oldest_inflight(&self) -> Option<u32> {
        let issued = self.issued.lock();
        if let Some(&slot) = issued.front() {
            return Some(slot);
        }
        drop(issued);
        self.issued_abandoned.lock().front().copied()
    }

    /// Remove `slot` from whichever in-flight list it's on, if any. A handle is on at most one of
    /// `issued`/`issued_abandoned` while in flight; once it's reaped it must leave that list so
    /// `oldest_inflight`/throttling don't keep finding an already-finished slot forever.
    pub fn evict_inflight(&self, slot: u32) {
        let mut issued = self.issued.lock();
        if let Some(pos) = issued.iter().position(|&s| s == slot) {
            issued.remove(pos);
            return;
        }
        drop(issued);
        let mut abandoned = self.issued_abandoned.lock();
        if let Some(pos) = abandoned.iter().position(|&s| s == slot) {
            abandoned.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_completion_migrates_on_demand() {
        let b = PerBackend::new(0);
        b.push_foreign_completed(5);
        assert!(b.local_completed.lock().is_empty());
        b.migrate_foreign_completed();
        assert_eq!(b.local_completed.lock().front(), Some(&5));
    }

    #[test]
    fn oldest_inflight_prefers_issued() {
        let b = PerBackend::new(0);
        b.issued_abandoned.lock().push_back(1);
        b.issued.lock().push_back(2);
        assert_eq!(b.oldest_inflight(), Some(2));
    }

    #[test]
    fn evict_inflight_removes_from_either_list_and_advances_oldest() {
        let b = PerBackend::new(0);
        b.issued.lock().push_back(1);
        b.issued.lock().push_back(2);
        b.issued_abandoned.lock().push_back(3);

        b.evict_inflight(1);
        assert_eq!(b.oldest_inflight(), Some(2));

        b.evict_inflight(2);
        assert_eq!(b.oldest_inflight(), Some(3));

        b.evict_inflight(3);
        assert_eq!(b.oldest_inflight(), None);
    }
}
