pub mod io_uring;
#[cfg(windows)]
pub mod iocp;
pub mod posix_aio;
pub mod syscalls;
pub mod worker;

use async_trait::async_trait;

use crate::backend::PerBackend;
use crate::error::Result;
use crate::handle::RawFdLike;
use crate::slab::Slab;

/// Which provider is active for this process. Chosen once at startup from `AioConfig::backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Worker,
    KernelRing,
    Posix,
    Iocp,
}

/// The provider vtable: shmem/child init, submit, drain, a closing-fd hook, wait-on-one, and
/// retry. Object-safe via `async-trait` so the engine can hold a single
/// `Arc<dyn Provider>` chosen at startup.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One-time setup of any provider-global shared state. A no-op for providers with nothing to
    /// size ahead of time.
    fn shmem_init(&self, _config: &crate::config::AioConfig) {}

    /// Per-backend setup (e.g. registering a file handle with a completion port). A no-op unless
    /// the provider needs it.
    fn child_init(&self, _backend: &PerBackend) {}

    /// Dispatch every handle in `heads` (already merged, already moved to `issued`/
    /// `issued_abandoned` by the submission core) to the kernel/worker pool.
    async fn submit(&self, backend: &PerBackend, slab: &Slab, heads: &[u32]) -> Result<()>;

    /// Drain up to `max` completions for `backend`, moving finished (uncombined or not — the
    /// caller uncombines) heads onto `backend.reaped`. Returns the number reaped.
    async fn drain(&self, backend: &PerBackend, slab: &Slab, max: usize) -> Result<usize>;

    /// Notify the provider that a file descriptor is about to be closed, so it can fail or wait
    /// out any outstanding I/O against it first. A no-op for providers with no per-fd state.
    fn closing_fd(&self, _fd: RawFdLike) {}

    /// Block until the specific handle at `slot` completes (or its reference goes stale).
    async fn wait_one(&self, backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()>;

    /// Re-dispatch a single previously-failed handle. Default implementation resubmits through
    /// the normal `submit` path, which is correct for every provider in this engine.
    async fn retry(&self, backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()> {
        self.submit(backend, slab, &[slot]).await
    }
}
