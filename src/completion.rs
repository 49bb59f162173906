use std::sync::atomic::Ordering;

use tracing::warn;

pub use crate::backend::BackendRegistry;
use crate::backend::{BackendId, PerBackend};
use crate::callbacks::{BufferCompletionHook, CallbackOutcome, RelationResolver, WalCompletionHook};
use crate::error::{AioError, Result};
use crate::handle::flags;
use crate::slab::Slab;

/// Split a (possibly merged) reaped chain into its individual handles, each carrying its own
/// `result` derived from the head's total via short-read/short-write redistribution.
/// Returns every slot in the chain, head first. A non-negative head result is divided in
/// `nbytes`-sized shares until exhausted, then zero for the remainder; a negative head result is
/// copied onto every link.
pub fn uncombine(slab: &Slab, head_slot: u32) -> Vec<u32> {
    let mut slots = Vec::new();
    let mut cur = Some(head_slot);
    while let Some(s) = cur {
        slots.push(s);
        cur = slab.get(s).merge_next();
    }

    if slots.len() > 1 {
        let head_result = slab.get(head_slot).result();
        if head_result < 0 {
            for &s in &slots {
                slab.get(s).set_result(head_result);
            }
        } else {
            let mut remaining = head_result as u64;
            for &s in &slots {
                let nbytes = slab.get(s).payload.lock().nbytes as u64;
                let give = remaining.min(nbytes);
                slab.get(s).set_result(give as i64);
                remaining -= give;
            }
        }
    }

    for &s in &slots {
        let h = slab.get(s);
        h.set_merge_next(None);
        h.flags.clear(flags::MERGE);
        h.flags.transition(flags::INFLIGHT, flags::REAPED);
    }
    slots
}

/// Drain `backend`'s reaped list, uncombine every chain, run the shared-phase callback on each
/// resulting handle, and route finished handles to local or foreign completion. Handles the
/// callback reports as needing another attempt are appended to `retry_out` for the caller to
/// re-stage through the submission core.
///
/// Returns the number of individual (post-uncombine) handles processed.
pub fn drain_and_complete(
    backend: &PerBackend,
    slab: &Slab,
    backends: &BackendRegistry,
    buffer_hook: &dyn BufferCompletionHook,
    wal_hook: &dyn WalCompletionHook,
    retry_out: &mut Vec<u32>,
) -> usize {
    let heads: Vec<u32> = {
        let mut reaped = backend.reaped.lock();
        reaped.drain(..).collect()
    };

    let mut processed = 0usize;
    for head_slot in heads {
        let links = uncombine(slab, head_slot);
        backend
            .inflight_count
            .fetch_sub(links.len() as u32, Ordering::AcqRel);

        for slot in links {
            processed += 1;
            let h = slab.get(slot);
            backend.executed_total.fetch_add(1, Ordering::Relaxed);

            // The handle just left INFLIGHT (via `uncombine`'s REAPED transition above), so it
            // must also leave whichever backend's `issued`/`issued_abandoned` list it's on -
            // whether it's about to finish or be re-staged for retry - or that list's front would
            // never advance past it.
            evict_from_owner(backend, backends, slot, h.owner());

            let outcome = crate::callbacks::run_shared_callback(h, buffer_hook, wal_hook);
            match outcome {
                CallbackOutcome::NeedsRetry => {
                    retry_out.push(slot);
                }
                CallbackOutcome::Finished => {
                    h.flags.set(flags::DONE);
                    route_finished(backend, slab, backends, slot);
                }
            }
        }
    }
    processed
}

/// Evict `slot` from its owner's in-flight membership list. `backend` is usually the owner (every
/// provider in this engine reaps onto its own backend), but may not be when a completion is routed
/// as foreign, so the owner is looked up in `backends` when it differs.
fn evict_from_owner(backend: &PerBackend, backends: &BackendRegistry, slot: u32, owner: BackendId) {
    if owner == backend.id {
        backend.evict_inflight(slot);
    } else {
        let registry = backends.read();
        if let Some(owner_backend) = registry.get(&owner) {
            owner_backend.evict_inflight(slot);
        }
    }
}

fn route_finished(backend: &PerBackend, slab: &Slab, backends: &BackendRegistry, slot: u32) {
    let h = slab.get(slot);
    if h.user_referenced() {
        if h.owner() == backend.id {
            backend.local_completed.lock().push_back(slot);
        } else {
            h.flags.set(flags::FOREIGN_DONE);
            let registry = backends.read();
            match registry.get(&h.owner()) {
                Some(owner_backend) => owner_backend.push_foreign_completed(slot),
                None => warn!(slot, owner = h.owner(), "owner backend not registered"),
            }
        }
    } else {
        // Nobody is waiting on this handle any more; fully recycle it now.
        h.set_system_referenced(false);
        slab.release(slot);
    }
}

/// Re-stage a handle that the shared callback marked `SOFT_FAILURE` for another attempt. Only
/// buffer reads/writes are retryable; anything else is a programming error in the
/// caller (the completion pipeline only ever calls this for `OpKind::is_retryable()` handles).
pub fn restage_for_retry(
    slab: &Slab,
    backend: &PerBackend,
    slot: u32,
    resolver: &dyn RelationResolver,
) -> Result<()> {
    let h = slab.get(slot);
    if !h.op().is_retryable() {
        return Err(AioError::NotRetryable("only buffer reads/writes retry"));
    }

    let tag = h.payload.lock().tag;
    if let Some(tag) = tag {
        let (fd, base_offset) = resolver.resolve_fd(tag)?;
        let mut p = h.payload.lock();
        p.fd = fd;
        p.offset = base_offset + p.already_done as u64;
    }

    h.flags.transition(
        flags::DONE | flags::SHARED_FAILED | flags::SHARED_CALLBACK_CALLED | flags::LOCAL_CALLBACK_CALLED,
        flags::IN_PROGRESS | flags::PENDING | flags::RETRY,
    );
    backend.retry_total.fetch_add(1, Ordering::Relaxed);
    backend.pending.lock().push_back(slot);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::RwLock;

    use crate::backend::PerBackend;
    use crate::callbacks::NullHooks;
    use crate::handle::OpKind;

    fn setup() -> (Slab, Arc<PerBackend>, BackendRegistry) {
        let slab = Slab::new(8);
        let backend = Arc::new(PerBackend::new(0));
        let backends: BackendRegistry = Arc::new(RwLock::new(HashMap::new()));
        backends.write().insert(0, backend.clone());
        (slab, backend, backends)
    }

    #[test]
    fn uncombine_splits_bytes_across_short_read_chain() {
        let slab = Slab::new(8);
        let a = slab.try_acquire(0).unwrap();
        a.set_op(OpKind::ReadBuffer);
        a.payload.lock().nbytes = 4096;
        let b = slab.try_acquire(0).unwrap();
        b.set_op(OpKind::ReadBuffer);
        b.payload.lock().nbytes = 4096;
        let c = slab.try_acquire(0).unwrap();
        c.set_op(OpKind::ReadBuffer);
        c.payload.lock().nbytes = 4096;

        a.set_merge_next(Some(b.slot));
        b.set_merge_next(Some(c.slot));
        a.set_result(4096 + 2048); // full first link, partial second, none third

        let links = uncombine(&slab, a.slot);
        assert_eq!(links, vec![a.slot, b.slot, c.slot]);
        assert_eq!(a.result(), 4096);
        assert_eq!(b.result(), 2048);
        assert_eq!(c.result(), 0);
    }

    #[test]
    fn negative_head_propagates_to_every_link() {
        let slab = Slab::new(8);
        let a = slab.try_acquire(0).unwrap();
        let b = slab.try_acquire(0).unwrap();
        a.set_merge_next(Some(b.slot));
        a.set_result(-5);
        let links = uncombine(&slab, a.slot);
        assert_eq!(links.len(), 2);
        assert_eq!(a.result(), -5);
        assert_eq!(b.result(), -5);
    }

    #[test]
    fn drain_and_complete_evicts_the_slot_from_issued() {
        let (slab, backend, backends) = setup();
        let h = slab.try_acquire(0).unwrap();
        h.set_op(OpKind::Nop);
        h.flags.set(flags::INFLIGHT);
        h.set_result(0);
        backend.issued.lock().push_back(h.slot);
        backend.reaped.lock().push_back(h.slot);
        backend.inflight_count.store(1, Ordering::Relaxed);

        let hooks = NullHooks;
        let mut retries = Vec::new();
        drain_and_complete(&backend, &slab, &backends, &hooks, &hooks, &mut retries);

        assert!(backend.issued.lock().is_empty());
        assert_eq!(backend.oldest_inflight(), None);
    }

    #[test]
    fn finished_handle_without_user_reference_is_recycled() {
        let (slab, backend, backends) = setup();
        let h = slab.try_acquire(0).unwrap();
        h.set_op(OpKind::Nop);
        h.set_user_referenced(false);
        h.flags.set(flags::INFLIGHT);
        h.set_result(0);
        backend.reaped.lock().push_back(h.slot);
        backend.inflight_count.store(1, Ordering::Relaxed);

        let hooks = NullHooks;
        let mut retries = Vec::new();
        let n = drain_and_complete(&backend, &slab, &backends, &hooks, &hooks, &mut retries);
        assert_eq!(n, 1);
        assert!(retries.is_empty());
        assert_eq!(slab.used(), 0);
    }

    #[test]
    fn short_read_is_queued_for_retry_not_recycled() {
        let (slab, backend, backends) = setup();
        let h = slab.try_acquire(0).unwrap();
        h.set_op(OpKind::ReadBuffer);
        h.payload.lock().nbytes = 4096;
        h.flags.set(flags::INFLIGHT);
        h.set_result(2048);
        backend.reaped.lock().push_back(h.slot);
        backend.inflight_count.store(1, Ordering::Relaxed);

        let hooks = NullHooks;
        let mut retries = Vec::new();
        drain_and_complete(&backend, &slab, &backends, &hooks, &hooks, &mut retries);
        assert_eq!(retries, vec![h.slot]);
        assert!(!h.flags.is_set(flags::DONE));
    }

    #[test]
    fn completion_reaped_by_a_different_backend_routes_to_the_owner() {
        let slab = Slab::new(8);
        let drainer = Arc::new(PerBackend::new(0));
        let owner = Arc::new(PerBackend::new(1));
        let backends: BackendRegistry = Arc::new(RwLock::new(HashMap::new()));
        backends.write().insert(0, drainer.clone());
        backends.write().insert(1, owner.clone());

        // A handle owned by backend 1, but reaped by backend 0's drain loop (the shape a single
        // shared completion ring produces: whichever backend calls drain first may pick up
        // another backend's completion).
        let h = slab.try_acquire(1).unwrap();
        h.set_op(OpKind::Nop);
        h.flags.set(flags::INFLIGHT);
        h.set_result(0);
        drainer.reaped.lock().push_back(h.slot);
        drainer.inflight_count.store(1, Ordering::Relaxed);

        let hooks = NullHooks;
        let mut retries = Vec::new();
        drain_and_complete(&drainer, &slab, &backends, &hooks, &hooks, &mut retries);

        assert!(retries.is_empty());
        assert!(h.flags.is_set(flags::FOREIGN_DONE));
        assert_eq!(owner.foreign_completed_total.load(Ordering::Relaxed), 1);
        assert!(owner.local_completed.lock().is_empty());

        owner.migrate_foreign_completed();
        assert_eq!(owner.local_completed.lock().front(), Some(&h.slot));
    }
}
