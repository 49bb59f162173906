use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendRegistry, PerBackend};
use crate::callbacks::{BufferCompletionHook, WalCompletionHook};
use crate::completion;
use crate::config::AioConfig;
use crate::error::Result;
use crate::handle::flags;
use crate::provider::Provider;
use crate::slab::Slab;
use crate::staging::fold_merge_chains;

/// Move everything in `backend.pending` through merge folding and into the active provider,
/// throttling to `config.io_max_concurrency` outstanding I/Os. Handles the throttle wait drains
/// uncovers that need another attempt are appended to `retry_out` for the caller to re-stage.
///
/// Returns the number of individual handles submitted (post-merge-fold, i.e. counting every link
/// in every chain, not just chain heads).
pub async fn submit_pending(
    backend: &PerBackend,
    slab: &Slab,
    backends: &BackendRegistry,
    provider: &Arc<dyn Provider>,
    config: &AioConfig,
    buffer_hook: &dyn BufferCompletionHook,
    wal_hook: &dyn WalCompletionHook,
    retry_out: &mut Vec<u32>,
) -> Result<usize> {
    let mut submitted = 0usize;

    loop {
        throttle(backend, slab, backends, provider, config, buffer_hook, wal_hook, retry_out).await?;

        let mut batch = std::collections::VecDeque::new();
        {
            let mut pending = backend.pending.lock();
            if pending.is_empty() {
                break;
            }
            let headroom = config
                .io_max_concurrency
                .saturating_sub(backend.inflight() as usize)
                .max(1);
            let take = pending.len().min(config.submit_batch_size).min(headroom);
            for _ in 0..take {
                if let Some(slot) = pending.pop_front() {
                    batch.push_back(slot);
                }
            }
        }
        if batch.is_empty() {
            break;
        }

        let heads = fold_merge_chains(slab, &mut batch, config.max_combine);
        let mut link_count = 0usize;
        for &head in &heads {
            let mut cur = Some(head);
            while let Some(s) = cur {
                let h = slab.get(s);
                link_count += 1;
                h.flags.transition(flags::IN_PROGRESS | flags::PENDING, flags::INFLIGHT);
                if h.user_referenced() {
                    backend.issued.lock().push_back(s);
                } else {
                    backend.issued_abandoned.lock().push_back(s);
                }
                cur = h.merge_next();
            }
        }
        backend
            .inflight_count
            .fetch_add(link_count as u32, std::sync::atomic::Ordering::AcqRel);
        backend
            .issued_total
            .fetch_add(link_count as u64, std::sync::atomic::Ordering::Relaxed);

        debug!(heads = heads.len(), links = link_count, "submitting batch");
        provider.submit(backend, slab, &heads).await?;
        submitted += link_count;
    }

    Ok(submitted)
}

/// Block until `backend`'s in-flight count drops below the configured cap, waiting on the oldest
/// outstanding I/O (preferring `issued` over `issued_abandoned`, per DESIGN.md Open Question 3).
///
/// Waiting alone isn't enough to make progress: `wait_one` only blocks until the slot reaches
/// `REAPED`/`DONE`, it doesn't drain it off `backend.reaped`, decrement `inflight_count`, or evict
/// it from `issued`/`issued_abandoned`. Without draining here too, `oldest_inflight` would keep
/// returning the same already-finished slot and this loop would spin forever the first time the
/// cap is hit. `drain_and_complete` does all three (uncombine, run the shared callback, and evict
/// the slot from its owner's in-flight list), which is what lets `inflight()` actually drop.
#[allow(clippy::too_many_arguments)]
async fn throttle(
    backend: &PerBackend,
    slab: &Slab,
    backends: &BackendRegistry,
    provider: &Arc<dyn Provider>,
    config: &AioConfig,
    buffer_hook: &dyn BufferCompletionHook,
    wal_hook: &dyn WalCompletionHook,
    retry_out: &mut Vec<u32>,
) -> Result<()> {
    while backend.inflight() as usize >= config.io_max_concurrency {
        match backend.oldest_inflight() {
            Some(slot) => {
                provider.wait_one(backend, slab, slot).await?;
                completion::drain_and_complete(backend, slab, backends, buffer_hook, wal_hook, retry_out);
            }
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NullHooks;
    use crate::handle::{flags as hflags, OpKind, OpPayload};
    use crate::provider::worker::WorkerProvider;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    fn stage(slab: &Slab, backend: &PerBackend, op: OpKind) -> u32 {
        let h = slab.try_acquire(backend.id).unwrap();
        h.set_op(op);
        h.flags.transition(hflags::IDLE, hflags::IN_PROGRESS | hflags::PENDING);
        *h.payload.lock() = OpPayload::default();
        backend.pending.lock().push_back(h.slot);
        h.slot
    }

    #[tokio::test]
    async fn submit_pending_drains_queue_and_marks_inflight() {
        let slab = Arc::new(Slab::new(8));
        let backend = Arc::new(PerBackend::new(0));
        let mut config = AioConfig::default();
        config.workers = 1;
        config.io_max_concurrency = 4;

        let backends: BackendRegistry = Arc::new(RwLock::new(HashMap::new()));
        backends.write().insert(0, backend.clone());
        let provider: Arc<dyn Provider> =
            Arc::new(WorkerProvider::new(&config, slab.clone(), backends.clone()));

        let hooks = NullHooks;
        let mut retry = Vec::new();
        let slot = stage(&slab, &backend, OpKind::Nop);
        let n = submit_pending(&backend, &slab, &backends, &provider, &config, &hooks, &hooks, &mut retry)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(retry.is_empty());
        assert!(backend.pending.lock().is_empty());

        provider.wait_one(&backend, &slab, slot).await.unwrap();
        assert!(slab.get(slot).flags.is_set(hflags::REAPED));
    }

    /// Reproduces the hang this throttling fix targets: stage more handles than the concurrency
    /// cap allows, submit them all in one call, and confirm `submit_pending` actually returns
    /// (rather than spinning on a stale `oldest_inflight` slot) with every handle dispatched.
    #[tokio::test]
    async fn throttle_drains_completions_so_the_cap_is_not_permanently_stuck() {
        let slab = Arc::new(Slab::new(16));
        let backend = Arc::new(PerBackend::new(0));
        let mut config = AioConfig::default();
        config.workers = 2;
        config.io_max_concurrency = 2;
        config.submit_batch_size = 2;

        let backends: BackendRegistry = Arc::new(RwLock::new(HashMap::new()));
        backends.write().insert(0, backend.clone());
        let provider: Arc<dyn Provider> =
            Arc::new(WorkerProvider::new(&config, slab.clone(), backends.clone()));

        let hooks = NullHooks;
        let mut retry = Vec::new();
        let slots: Vec<u32> = (0..6).map(|_| stage(&slab, &backend, OpKind::Nop)).collect();

        let n = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            submit_pending(&backend, &slab, &backends, &provider, &config, &hooks, &hooks, &mut retry),
        )
        .await
        .expect("submit_pending must not hang once the concurrency cap is hit")
        .unwrap();

        assert_eq!(n, 6);
        assert!(retry.is_empty());
        for slot in slots {
            provider.wait_one(&backend, &slab, slot).await.unwrap();
        }
    }
}
