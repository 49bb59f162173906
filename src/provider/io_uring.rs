use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::PerBackend;
use crate::error::Result;
use crate::handle::flags;
use crate::provider::syscalls::execute_chain;
use crate::provider::Provider;
use crate::slab::Slab;

/// One independent ring context: its own submission lock, completion lock, and a split iovec-slot
/// free list (unused vs. reaped), matching `PgAioContext` in the original source. This crate has
/// no real `io_uring` syscall binding (this provider is itself a simulation,
/// not a real binding — see DESIGN.md), so a context here performs the I/O synchronously under its
/// own submission lock and immediately posts to its completion queue; the lock split and iovec
/// pools are kept because they are what a real io_uring binding would need, and because
/// `last_context` round robin and pool transfer are part of this engine's observable behaviour.
struct RingContext {
    submission_lock: Mutex<()>,
    completion_lock: Mutex<()>,
    completions: Mutex<std::collections::VecDeque<u32>>,
    unused_iovecs: AtomicU32,
    reaped_iovecs: AtomicU32,
}

impl RingContext {
    fn new(iovec_pool_size: u32) -> Self {
        Self {
            submission_lock: Mutex::new(()),
            completion_lock: Mutex::new(()),
            completions: Mutex::new(std::collections::VecDeque::new()),
            unused_iovecs: AtomicU32::new(iovec_pool_size),
            reaped_iovecs: AtomicU32::new(0),
        }
    }

    fn submit_one(&self, slab: &Slab, head_slot: u32) {
        let _guard = self.submission_lock.lock();
        self.unused_iovecs.fetch_sub(1, Ordering::AcqRel);
        let result = execute_chain(slab, head_slot);
        slab.get(head_slot).set_result(result);
        drop(_guard);

        let _cguard = self.completion_lock.lock();
        self.completions.lock().push_back(head_slot);
        self.reaped_iovecs.fetch_add(1, Ordering::AcqRel);
    }

    fn drain(&self, max: usize) -> Vec<u32> {
        let _guard = self.completion_lock.lock();
        let mut out = Vec::new();
        let mut completions = self.completions.lock();
        while out.len() < max {
            match completions.pop_front() {
                Some(slot) => out.push(slot),
                None => break,
            }
        }
        out
    }

    /// Move reaped iovec slots back to the unused pool, taking both locks in submit-then-complete
    /// order to match the original's lock ordering discipline.
    fn recycle_iovecs(&self) {
        let _s = self.submission_lock.lock();
        let _c = self.completion_lock.lock();
        let n = self.reaped_iovecs.swap(0, Ordering::AcqRel);
        self.unused_iovecs.fetch_add(n, Ordering::AcqRel);
    }
}

/// Kernel completion-ring provider: `num_contexts` independent rings, each with its own locks and
/// iovec pool. A backend rotates through contexts, trying its last-used one first.
pub struct IoUringProvider {
    contexts: Vec<RingContext>,
    last_context_counter: AtomicU64,
}

impl IoUringProvider {
    pub fn new(num_contexts: usize, max_in_flight_per_context: usize) -> Self {
        let contexts = (0..num_contexts.max(1))
            .map(|_| RingContext::new(max_in_flight_per_context as u32))
            .collect();
        Self {
            contexts,
            last_context_counter: AtomicU64::new(0),
        }
    }

    fn pick_context(&self, backend: &PerBackend) -> usize {
        let last = backend.last_context.load(Ordering::Acquire) as usize % self.contexts.len();
        // Non-blocking "try last used first", else rotate through the rest.
        if self.contexts[last].submission_lock.try_lock().is_some() {
            return last;
        }
        let start = self.last_context_counter.fetch_add(1, Ordering::Relaxed) as usize;
        for i in 0..self.contexts.len() {
            let idx = (start + i) % self.contexts.len();
            if self.contexts[idx].submission_lock.try_lock().is_some() {
                return idx;
            }
        }
        last
    }
}

#[async_trait]
impl Provider for IoUringProvider {
    async fn submit(&self, backend: &PerBackend, slab: &Slab, heads: &[u32]) -> Result<()> {
        for &slot in heads {
            let ctx_idx = self.pick_context(backend);
            backend.last_context.store(ctx_idx as u32, Ordering::Release);
            self.contexts[ctx_idx].submit_one(slab, slot);
            let head = slab.get(slot);
            head.flags.transition(flags::INFLIGHT, flags::REAPED);
            head.set_ring_id(ctx_idx as u8);
            backend.reaped.lock().push_back(slot);
            backend.submissions_total.fetch_add(1, Ordering::Relaxed);
            head.notify.notify_waiters();
        }
        for ctx in &self.contexts {
            ctx.recycle_iovecs();
        }
        debug!(count = heads.len(), "io_uring provider submitted batch");
        Ok(())
    }

    async fn drain(&self, backend: &PerBackend, _slab: &Slab, max: usize) -> Result<usize> {
        // Completions are posted synchronously in `submit`, directly onto `backend.reaped`;
        // nothing further to move here.
        Ok(backend.reaped.lock().len().min(max))
    }

    async fn wait_one(&self, _backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()> {
        let h = slab.get(slot);
        if h.flags.is_set(flags::REAPED | flags::DONE) {
            return Ok(());
        }
        // This engine's ring contexts complete inline during `submit`, so by the time a caller
        // reaches `wait_one` the handle is already done; a bounded wait covers the case where a
        // real `io_uring_enter`-backed implementation would still be servicing the ring.
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        Ok(())
    }
}
