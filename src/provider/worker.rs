use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use tracing::{debug, error};

pub use crate::backend::BackendRegistry;
use crate::backend::PerBackend;
use crate::config::AioConfig;
use crate::error::{AioError, Result};
use crate::handle::flags;
use crate::provider::syscalls::execute_chain;
use crate::provider::Provider;
use crate::slab::Slab;

/// Worker-pool provider: a shared lock-free submission queue drained by a fixed pool of OS
/// threads, each performing the syscall synchronously and writing the result straight back onto
/// the owning backend's `reaped` list. Grounded on `AsyncIoEngine`'s worker-thread loop in the
/// teacher, generalized from a single completion port to this engine's per-backend list model.
pub struct WorkerProvider {
    queue: Arc<ArrayQueue<u32>>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerProvider {
    pub fn new(config: &AioConfig, slab: Arc<Slab>, backends: BackendRegistry) -> Self {
        let queue = Arc::new(ArrayQueue::new(config.worker_queue_size.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(config.workers);

        for i in 0..config.workers {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            let slab = slab.clone();
            let backends = backends.clone();
            let handle = std::thread::Builder::new()
                .name(format!("aio-worker-{i}"))
                .spawn(move || worker_loop(queue, shutdown, slab, backends))
                .expect("failed to spawn aio worker thread");
            threads.push(handle);
        }

        Self {
            queue,
            shutdown,
            threads,
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for WorkerProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    queue: Arc<ArrayQueue<u32>>,
    shutdown: Arc<AtomicBool>,
    slab: Arc<Slab>,
    backends: BackendRegistry,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(head_slot) = queue.pop() else {
            std::thread::sleep(Duration::from_micros(100));
            continue;
        };
        let result = execute_chain(&slab, head_slot);
        slab.get(head_slot).set_result(result);
        route_to_owner(&slab, &backends, head_slot);
    }
}

fn route_to_owner(slab: &Slab, backends: &BackendRegistry, head_slot: u32) {
    let head = slab.get(head_slot);
    head.flags.transition(flags::INFLIGHT, flags::REAPED);
    let owner = head.owner();

    let registry = backends.read();
    match registry.get(&owner) {
        Some(backend) => {
            backend.reaped.lock().push_back(head_slot);
        }
        None => {
            error!(slot = head_slot, owner, "no registered backend for completed I/O owner");
        }
    }
    head.notify.notify_waiters();
    debug!(slot = head_slot, "worker provider reaped handle");
}

#[async_trait]
impl Provider for WorkerProvider {
    async fn submit(&self, backend: &PerBackend, _slab: &Slab, heads: &[u32]) -> Result<()> {
        for &slot in heads {
            let mut attempts = 0;
            while self.queue.push(slot).is_err() {
                attempts += 1;
                if attempts > 1000 {
                    return Err(AioError::Provider(
                        "worker submission queue stayed full".into(),
                    ));
                }
                tokio::time::sleep(Duration::from_micros(50)).await;
            }
            backend.submissions_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn drain(&self, backend: &PerBackend, _slab: &Slab, max: usize) -> Result<usize> {
        // Workers push completions directly onto `backend.reaped`; draining here just reports how
        // much is already there for the caller to process, capped at `max`.
        Ok(backend.reaped.lock().len().min(max))
    }

    async fn wait_one(&self, _backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()> {
        let h = slab.get(slot);
        loop {
            if h.flags.is_set(flags::REAPED | flags::DONE) {
                return Ok(());
            }
            tokio::select! {
                _ = h.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}
