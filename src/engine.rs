use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{BackendId, PerBackend};
use crate::bounce::{BounceBuffer, BouncePool};
use crate::callbacks::{
    BufferCompletionHook, NullHooks, RelationResolver, WalCompletionHook, WalSegmentResolver,
};
use crate::completion::{self, BackendRegistry};
use crate::config::{AioBackend, AioConfig};
use crate::error::{AioError, Result};
use crate::handle::{
    flags, Handle, LocalCallback, OpKind, OpPayload, ReadMode, Reference, RelationTag, RawFdLike,
};
use crate::metrics::BackendStats;
use crate::provider::io_uring::IoUringProvider;
#[cfg(windows)]
use crate::provider::iocp::IocpProvider;
use crate::provider::posix_aio::PosixAioProvider;
use crate::provider::worker::WorkerProvider;
use crate::provider::Provider;
use crate::slab::Slab;
use crate::submission::submit_pending;

/// Optional external collaborators the engine calls out to. Anything left unset falls back to a
/// no-op, matching how a standalone test or a NOP/FSYNC-only workload would configure it.
#[derive(Default)]
pub struct EngineHooks {
    pub buffer: Option<Arc<dyn BufferCompletionHook>>,
    pub wal: Option<Arc<dyn WalCompletionHook>>,
    pub relation_resolver: Option<Arc<dyn RelationResolver>>,
    pub wal_segment_resolver: Option<Arc<dyn WalSegmentResolver>>,
}

/// Top-level handle on the shared AIO subsystem: the slab, bounce pool, per-backend registry, and
/// the one active provider for this process. One `AioEngine` is shared by every backend (Tokio
/// task) in the process, mirroring the original's one-per-postmaster shared-memory layout.
pub struct AioEngine {
    slab: Arc<Slab>,
    bounce: BouncePool,
    backends: BackendRegistry,
    provider: Arc<dyn Provider>,
    config: AioConfig,
    hooks: EngineHooks,
    next_backend_id: AtomicU32,
}

static ENGINE: OnceCell<Arc<AioEngine>> = OnceCell::new();

/// Initialize the global engine. Mirrors `init_io_engine`'s singleton pattern; must be
/// called exactly once, typically at process startup.
pub fn init(config: AioConfig, hooks: EngineHooks) -> Result<()> {
    let engine = AioEngine::new(config, hooks)?;
    ENGINE
        .set(Arc::new(engine))
        .map_err(|_| AioError::Internal("AIO engine already initialized".into()))?;
    Ok(())
}

/// Fetch the global engine. Mirrors `get_io_engine`.
pub fn get() -> Result<Arc<AioEngine>> {
    ENGINE
        .get()
        .cloned()
        .ok_or_else(|| AioError::Internal("AIO engine not initialized".into()))
}

impl AioEngine {
    pub fn new(config: AioConfig, hooks: EngineHooks) -> Result<Self> {
        config.validate()?;

        let slab = Arc::new(Slab::new(config.max_in_progress));
        let bounce = BouncePool::new(config.max_bounce_buffers, config.bounce_buffer_size, 4096)?;
        let backends: BackendRegistry = Arc::new(RwLock::new(HashMap::new()));

        let provider: Arc<dyn Provider> = match config.backend {
            AioBackend::Worker => {
                Arc::new(WorkerProvider::new(&config, slab.clone(), backends.clone()))
            }
            AioBackend::KernelRing => Arc::new(IoUringProvider::new(
                config.num_ring_contexts,
                config.max_in_flight,
            )),
            AioBackend::Posix => Arc::new(PosixAioProvider::new(config.max_in_progress)),
            #[cfg(windows)]
            AioBackend::Iocp => Arc::new(IocpProvider::new()?),
            #[cfg(not(windows))]
            AioBackend::Iocp => {
                return Err(AioError::Configuration(
                    "IOCP backend is only available on windows".into(),
                ))
            }
        };
        provider.shmem_init(&config);

        info!(backend = ?config.backend, slots = config.max_in_progress, "AIO engine initialized");

        Ok(Self {
            slab,
            bounce,
            backends,
            provider,
            config,
            hooks,
            next_backend_id: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &AioConfig {
        &self.config
    }

    /// Register a new backend (one per caller, usually once per Tokio task). Returns the
    /// `BackendId` to use for every subsequent `acquire` on this task.
    pub fn register_backend(&self) -> BackendId {
        let id = self.next_backend_id.fetch_add(1, Ordering::Relaxed);
        let backend = Arc::new(PerBackend::new(id));
        self.provider.child_init(&backend);
        self.backends.write().insert(id, backend);
        id
    }

    fn backend(&self, id: BackendId) -> Arc<PerBackend> {
        self.backends
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("unregistered backend id {id}"))
    }

    /// Obtain a fresh handle owned by `backend`. Blocks (via a drain-and-retry loop) if the slab
    /// is momentarily exhausted: drain whatever the provider has reaped and retry before giving up.
    pub async fn acquire(&self, backend_id: BackendId) -> Result<&Handle> {
        let backend = self.backend(backend_id);
        loop {
            match self.slab.try_acquire(backend_id) {
                Some(h) => {
                    backend.outstanding.lock().push_back(h.slot);
                    return Ok(h);
                }
                None => {
                    let drained = self.provider.drain(&backend, &self.slab, 64).await?;
                    if drained == 0 {
                        return Err(AioError::SlotsExhausted);
                    }
                    let mut retry = Vec::new();
                    completion::drain_and_complete(
                        &backend,
                        &self.slab,
                        &self.backends,
                        self.buffer_hook(),
                        self.wal_hook(),
                        &mut retry,
                    );
                    self.restage_retries(&backend, retry);
                }
            }
        }
    }

    fn buffer_hook(&self) -> &dyn BufferCompletionHook {
        static NULL: NullHooks = NullHooks;
        self.hooks
            .buffer
            .as_deref()
            .unwrap_or(&NULL as &dyn BufferCompletionHook)
    }

    fn wal_hook(&self) -> &dyn WalCompletionHook {
        static NULL: NullHooks = NullHooks;
        self.hooks
            .wal
            .as_deref()
            .unwrap_or(&NULL as &dyn WalCompletionHook)
    }

    fn restage_retries(&self, backend: &PerBackend, retry: Vec<u32>) {
        for slot in retry {
            let resolver = self.hooks.relation_resolver.as_deref();
            match resolver {
                Some(r) => {
                    if let Err(e) = completion::restage_for_retry(&self.slab, backend, slot, r) {
                        warn!(slot, error = %e, "retry failed, marking handle done");
                        self.slab.get(slot).flags.set(flags::DONE);
                    }
                }
                None => {
                    warn!(slot, "no relation resolver configured, cannot retry");
                    self.slab.get(slot).flags.set(flags::DONE);
                }
            }
        }
    }

    /// Drop the user reference. If nothing else references the handle and it is already `DONE`,
    /// the slot is recycled immediately; otherwise it stays outstanding until completion does so.
    pub fn release(&self, h: &Handle) {
        h.set_user_referenced(false);
        if h.flags.is_set(flags::DONE) && !h.system_referenced() {
            self.recycle(h);
        }
    }

    /// Fully recycle a `DONE` handle: release any bounce buffer, bump the generation, return the
    /// slot to the free list.
    pub fn recycle(&self, h: &Handle) {
        if let Some(bounce_idx) = h.bounce_slot() {
            self.bounce.release_ref(bounce_idx);
            h.set_bounce_slot(None);
        }
        h.set_user_referenced(false);
        h.set_system_referenced(false);
        self.slab.release(h.slot);
    }

    fn stage(&self, backend_id: BackendId, h: &Handle, op: OpKind, payload: OpPayload) {
        h.set_op(op);
        *h.payload.lock() = payload;
        h.set_owner(backend_id);
        h.flags.transition(flags::IDLE, flags::IN_PROGRESS | flags::PENDING);
        self.backend(backend_id).pending.lock().push_back(h.slot);
    }

    pub fn start_read_buffer(
        &self,
        backend_id: BackendId,
        h: &Handle,
        tag: RelationTag,
        fd: RawFdLike,
        offset: u64,
        nbytes: u32,
        buf_addr: usize,
        buffer_no: u32,
        mode: ReadMode,
    ) {
        self.stage(
            backend_id,
            h,
            OpKind::ReadBuffer,
            OpPayload {
                fd,
                offset,
                nbytes,
                buf_addr,
                buf_len: nbytes as usize,
                tag: Some(tag),
                buffer_no,
                read_mode: mode,
                ..Default::default()
            },
        );
    }

    pub fn start_write_buffer(
        &self,
        backend_id: BackendId,
        h: &Handle,
        tag: RelationTag,
        fd: RawFdLike,
        offset: u64,
        nbytes: u32,
        buf_addr: usize,
        buffer_no: u32,
    ) {
        self.stage(
            backend_id,
            h,
            OpKind::WriteBuffer,
            OpPayload {
                fd,
                offset,
                nbytes,
                buf_addr,
                buf_len: nbytes as usize,
                tag: Some(tag),
                buffer_no,
                ..Default::default()
            },
        );
    }

    /// WAL writes always set `no_reorder = true` (DESIGN.md Open Question 4: write merging stays
    /// disabled for WAL), so `staging::can_merge` never folds one WAL write onto another.
    pub fn start_write_wal(
        &self,
        backend_id: BackendId,
        h: &Handle,
        fd: RawFdLike,
        segno: u32,
        offset: u64,
        nbytes: u32,
        buf_addr: usize,
        write_no: u64,
    ) {
        self.stage(
            backend_id,
            h,
            OpKind::WriteWal,
            OpPayload {
                fd,
                offset,
                nbytes,
                buf_addr,
                buf_len: nbytes as usize,
                segno: Some(segno),
                write_no: Some(write_no),
                no_reorder: true,
                ..Default::default()
            },
        );
    }

    pub fn start_write_generic(
        &self,
        backend_id: BackendId,
        h: &Handle,
        fd: RawFdLike,
        offset: u64,
        nbytes: u32,
        buf_addr: usize,
        no_reorder: bool,
    ) {
        self.stage(
            backend_id,
            h,
            OpKind::WriteGeneric,
            OpPayload {
                fd,
                offset,
                nbytes,
                buf_addr,
                buf_len: nbytes as usize,
                no_reorder,
                ..Default::default()
            },
        );
    }

    pub fn start_fsync(&self, backend_id: BackendId, h: &Handle, fd: RawFdLike, segno: Option<u32>, barrier: bool) {
        self.stage(
            backend_id,
            h,
            OpKind::Fsync,
            OpPayload {
                fd,
                segno,
                barrier,
                datasync: false,
                ..Default::default()
            },
        );
    }

    pub fn start_fdatasync(&self, backend_id: BackendId, h: &Handle, fd: RawFdLike, segno: Option<u32>, barrier: bool) {
        self.stage(
            backend_id,
            h,
            OpKind::Fsync,
            OpPayload {
                fd,
                segno,
                barrier,
                datasync: true,
                ..Default::default()
            },
        );
    }

    pub fn start_fsync_wal(
        &self,
        backend_id: BackendId,
        h: &Handle,
        fd: RawFdLike,
        segno: Option<u32>,
        barrier: bool,
        datasync: bool,
        flush_no: u64,
    ) {
        self.stage(
            backend_id,
            h,
            OpKind::FsyncWal,
            OpPayload {
                fd,
                segno,
                barrier,
                datasync,
                flush_no: Some(flush_no),
                ..Default::default()
            },
        );
    }

    pub fn start_flush_range(&self, backend_id: BackendId, h: &Handle, fd: RawFdLike, offset: u64, nbytes: u32) {
        self.stage(
            backend_id,
            h,
            OpKind::FlushRange,
            OpPayload {
                fd,
                offset,
                nbytes,
                ..Default::default()
            },
        );
    }

    pub fn start_nop(&self, backend_id: BackendId, h: &Handle) {
        self.stage(backend_id, h, OpKind::Nop, OpPayload::default());
    }

    /// Submit everything staged on `backend_id`'s pending list, throttled to
    /// `io_max_concurrency`. Returns the number of individual handles dispatched.
    pub async fn submit_pending(&self, backend_id: BackendId) -> Result<usize> {
        let backend = self.backend(backend_id);
        let mut retry = Vec::new();
        let n = submit_pending(
            &backend,
            &self.slab,
            &self.backends,
            &self.provider,
            &self.config,
            self.buffer_hook(),
            self.wal_hook(),
            &mut retry,
        )
        .await?;
        self.restage_retries(&backend, retry);
        Ok(n)
    }

    /// Block until `h` reaches `DONE`, retrying transparently on `SOFT_FAILURE`.
    /// `call_local` additionally runs the handle's registered per-I/O local callback once done.
    pub async fn wait(&self, backend_id: BackendId, h: &Handle, call_local: bool) -> Result<()> {
        let r = h.reference();
        self.wait_ref(backend_id, r, call_local).await
    }

    /// Reference-based wait: returns immediately (as done) if the reference has already gone
    /// stale, since that only happens after the slot was fully recycled.
    pub async fn wait_ref(&self, backend_id: BackendId, r: Reference, call_local: bool) -> Result<()> {
        let backend = self.backend(backend_id);
        loop {
            let h = self.slab.get(r.slot);
            if !h.is_live(r) {
                return Ok(());
            }
            if h.flags.is_set(flags::DONE) {
                if call_local {
                    self.run_local_callback(h);
                }
                return Ok(());
            }

            self.provider.wait_one(&backend, &self.slab, r.slot).await?;

            let mut retry = Vec::new();
            completion::drain_and_complete(
                &backend,
                &self.slab,
                &self.backends,
                self.buffer_hook(),
                self.wal_hook(),
                &mut retry,
            );
            self.restage_retries(&backend, retry);

            backend.migrate_foreign_completed();
            self.drain_local_completed(&backend);

            if self.slab.get(r.slot).is_live(r) {
                continue;
            }
            return Ok(());
        }
    }

    fn drain_local_completed(&self, backend: &PerBackend) {
        let slots: Vec<u32> = backend.local_completed.lock().drain(..).collect();
        for slot in slots {
            let h = self.slab.get(slot);
            if h.flags.is_set(flags::RETRY) {
                continue;
            }
            if !h.user_referenced() {
                self.recycle(h);
            }
        }
    }

    fn run_local_callback(&self, h: &Handle) {
        if let Some(cb) = h.take_local_callback() {
            cb(h);
            h.flags.set(flags::LOCAL_CALLBACK_CALLED);
        }
    }

    /// Register a per-I/O local callback, run once at `wait`/`wait_ref` time with `call_local`.
    pub fn on_completion_local(&self, h: &Handle, cb: LocalCallback) {
        h.set_local_callback(cb);
    }

    pub fn done(&self, h: &Handle) -> bool {
        h.flags.is_set(flags::DONE)
    }

    /// True if the handle finished without ever being marked `SHARED_FAILED`/`HARD_FAILURE`.
    pub fn success(&self, h: &Handle) -> bool {
        self.done(h) && !h.flags.is_set(flags::SHARED_FAILED | flags::HARD_FAILURE)
    }

    /// Re-submit a failed retryable handle and wait for it again.
    pub async fn retry(&self, backend_id: BackendId, h: &Handle) -> Result<()> {
        if !h.op().is_retryable() {
            return Err(AioError::NotRetryable("only buffer reads/writes retry"));
        }
        let backend = self.backend(backend_id);
        let resolver = self
            .hooks
            .relation_resolver
            .as_deref()
            .ok_or_else(|| AioError::Internal("no relation resolver configured for retry".into()))?;
        completion::restage_for_retry(&self.slab, &backend, h.slot, resolver)?;
        self.submit_pending(backend_id).await?;
        self.wait(backend_id, h, false).await
    }

    pub fn reference(&self, h: &Handle) -> Reference {
        h.reference()
    }

    pub fn bounce_get(&self) -> Result<BounceBuffer<'_>> {
        self.bounce.get()
    }

    pub fn bounce_release(&self, bb: BounceBuffer<'_>) {
        drop(bb);
    }

    /// Associate a checked-out bounce buffer with a handle so the provider reads/writes through it
    /// instead of the caller's own memory.
    pub fn assoc_bounce(&self, h: &Handle, bb: &BounceBuffer<'_>) {
        h.set_bounce_slot(Some(bb.index()));
        self.bounce.acquire_ref(bb.index());
        let mut p = h.payload.lock();
        p.buf_addr = bb.as_slice().as_ptr() as usize;
        p.buf_len = bb.as_slice().len();
    }

    pub fn stats(&self, backend_id: BackendId) -> BackendStats {
        BackendStats::snapshot(&self.backend(backend_id))
    }

    pub fn dump_handle(&self, slot: u32) -> crate::metrics::HandleDump {
        crate::metrics::HandleDump::of(self.slab.get(slot))
    }

    /// At-commit/at-abort hook: wait synchronously for every I/O this backend still has
    /// outstanding, including `issued_abandoned` ones nobody is actively waiting on.
    pub async fn drain_all_outstanding(&self, backend_id: BackendId) -> Result<()> {
        let backend = self.backend(backend_id);
        loop {
            let next = {
                let issued = backend.issued.lock();
                issued.front().copied()
            }
            .or_else(|| backend.issued_abandoned.lock().front().copied());

            let Some(slot) = next else { break };
            self.provider.wait_one(&backend, &self.slab, slot).await?;

            let mut retry = Vec::new();
            completion::drain_and_complete(
                &backend,
                &self.slab,
                &self.backends,
                self.buffer_hook(),
                self.wal_hook(),
                &mut retry,
            );
            // At shutdown there is no further opportunity to retry; treat any soft failure that
            // survives as done so the loop can make progress and the process can actually exit.
            for slot in retry {
                self.slab.get(slot).flags.set(flags::DONE);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::os::unix::io::AsRawFd;

    fn test_config() -> AioConfig {
        let mut config = AioConfig::default();
        config.backend = AioBackend::Worker;
        config.workers = 2;
        config.max_in_progress = 64;
        config.io_max_concurrency = 8;
        config
    }

    #[tokio::test]
    async fn single_buffered_read_round_trips() {
        let engine = AioEngine::new(test_config(), EngineHooks::default()).unwrap();
        let backend_id = engine.register_backend();

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![7u8; 8192]).unwrap();
        let fd = file.as_raw_fd();

        let mut buf = vec![0u8; 8192];
        let h = engine.acquire(backend_id).await.unwrap();
        engine.start_read_buffer(
            backend_id,
            h,
            RelationTag { relation_id: 1, fork: 0, block_size_log2: 13 },
            fd,
            0,
            8192,
            buf.as_mut_ptr() as usize,
            42,
            ReadMode::Normal,
        );

        engine.submit_pending(backend_id).await.unwrap();
        engine.wait(backend_id, h, false).await.unwrap();

        assert!(engine.success(h));
        assert_eq!(h.result(), 8192);
        assert_eq!(buf, vec![7u8; 8192]);
        engine.release(h);
    }

    #[tokio::test]
    async fn nop_completes_and_recycles() {
        let engine = AioEngine::new(test_config(), EngineHooks::default()).unwrap();
        let backend_id = engine.register_backend();

        let h = engine.acquire(backend_id).await.unwrap();
        engine.start_nop(backend_id, h);
        engine.submit_pending(backend_id).await.unwrap();
        engine.wait(backend_id, h, false).await.unwrap();
        assert!(engine.done(h));
        engine.release(h);
    }
}
