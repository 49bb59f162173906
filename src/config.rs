/// Which provider backend drives submission and completion for this process.
///
/// Mirrors the `aio_type` GUC: chosen once at startup, not switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioBackend {
    /// Shared submission queue drained by a fixed worker thread pool.
    Worker,
    /// Multiple kernel completion-ring contexts (io_uring-style).
    KernelRing,
    /// Signal-driven POSIX `aio_*` calls.
    Posix,
    /// Windows I/O completion ports.
    Iocp,
}

impl Default for AioBackend {
    fn default() -> Self {
        #[cfg(windows)]
        {
            AioBackend::Iocp
        }
        #[cfg(not(windows))]
        {
            AioBackend::Worker
        }
    }
}

/// Engine-wide configuration, the Rust analogue of the `aio_*` GUCs.
#[derive(Debug, Clone)]
pub struct AioConfig {
    pub backend: AioBackend,

    /// `aio_workers` — worker pool size (worker backend only).
    pub workers: usize,

    /// `aio_worker_queue_size` — shared submission queue depth (worker backend only).
    pub worker_queue_size: usize,

    /// `max_aio_in_progress` — total shared descriptor slots.
    pub max_in_progress: usize,

    /// `max_aio_in_flight` — per-provider-context in-flight cap.
    pub max_in_flight: usize,

    /// `max_aio_bounce_buffers` — bounce buffer pool size.
    pub max_bounce_buffers: usize,

    /// `io_max_concurrency` — per-backend in-flight cap enforced at submission time.
    pub io_max_concurrency: usize,

    /// Size of one submission batch (`PGAIO_SUBMIT_BATCH_SIZE` in the original source).
    pub submit_batch_size: usize,

    /// Maximum number of handles combined into a single merge chain.
    pub max_combine: usize,

    /// Number of independent kernel-ring contexts (kernel-ring backend only).
    pub num_ring_contexts: usize,

    /// Size of one bounce buffer, in bytes.
    pub bounce_buffer_size: usize,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            backend: AioBackend::default(),
            workers: num_cpus::get().max(1),
            worker_queue_size: 4096,
            max_in_progress: 32_768,
            max_in_flight: 4_096,
            max_bounce_buffers: 1_024,
            io_max_concurrency: 128,
            submit_batch_size: 256,
            max_combine: 16,
            num_ring_contexts: 8,
            bounce_buffer_size: 8192,
        }
    }
}

impl AioConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_in_progress == 0 {
            return Err(crate::error::AioError::Configuration(
                "max_in_progress must be non-zero".into(),
            ));
        }
        if self.io_max_concurrency == 0 || self.io_max_concurrency > self.max_in_progress {
            return Err(crate::error::AioError::Configuration(
                "io_max_concurrency must be non-zero and at most max_in_progress".into(),
            ));
        }
        if self.max_combine == 0 {
            return Err(crate::error::AioError::Configuration(
                "max_combine must be non-zero".into(),
            ));
        }
        if matches!(self.backend, AioBackend::Worker) && self.workers == 0 {
            return Err(crate::error::AioError::Configuration(
                "worker backend requires at least one worker thread".into(),
            ));
        }
        Ok(())
    }
}
