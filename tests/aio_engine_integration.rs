// End-to-end coverage for the async I/O engine's public surface, one test per behavior called out
// in the engine's testable-properties table: single reads, merged writes with uncombine, short-read
// retry, hard failure classification, cross-backend completion, and concurrency throttling.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use aio_engine::config::{AioBackend, AioConfig};
use aio_engine::engine::{AioEngine, EngineHooks};
use aio_engine::handle::{ReadMode, RelationTag};

fn worker_config() -> AioConfig {
    let mut config = AioConfig::default();
    config.backend = AioBackend::Worker;
    config.workers = 2;
    config.max_in_progress = 64;
    config.io_max_concurrency = 16;
    config
}

fn tag() -> RelationTag {
    RelationTag {
        relation_id: 1,
        fork: 0,
        block_size_log2: 13,
    }
}

#[tokio::test]
async fn single_8kib_buffered_read_completes_and_recycles() {
    let engine = AioEngine::new(worker_config(), EngineHooks::default()).unwrap();
    let backend_id = engine.register_backend();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0x42u8; 8192]).unwrap();
    let fd = file.as_raw_fd();

    let mut buf = vec![0u8; 8192];
    let h = engine.acquire(backend_id).await.unwrap();
    let slot = h.slot;
    let gen0 = h.generation();

    engine.start_read_buffer(backend_id, h, tag(), fd, 0, 8192, buf.as_mut_ptr() as usize, 42, ReadMode::Normal);
    engine.submit_pending(backend_id).await.unwrap();
    engine.wait(backend_id, h, false).await.unwrap();

    assert!(engine.success(h));
    assert_eq!(h.result(), 8192);
    assert_eq!(buf, vec![0x42u8; 8192]);

    engine.release(h);
    assert_eq!(engine.dump_handle(slot).generation, gen0 + 1);
}

#[tokio::test]
async fn four_adjacent_writes_merge_and_uncombine_correctly() {
    let engine = AioEngine::new(worker_config(), EngineHooks::default()).unwrap();
    let backend_id = engine.register_backend();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0u8; 32 * 1024]).unwrap();
    let fd = file.as_raw_fd();

    let mut bufs: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8 + 1; 8192]).collect();
    let mut handles = Vec::new();
    for i in 0..4u64 {
        let h = engine.acquire(backend_id).await.unwrap();
        engine.start_write_buffer(
            backend_id,
            h,
            tag(),
            fd,
            i * 8192,
            8192,
            bufs[i as usize].as_mut_ptr() as usize,
            i as u32,
        );
        handles.push(h);
    }

    engine.submit_pending(backend_id).await.unwrap();
    for h in &handles {
        engine.wait(backend_id, h, false).await.unwrap();
        assert!(engine.success(h));
        assert_eq!(h.result(), 8192);
    }

    let written = std::fs::read(file.path()).unwrap();
    for i in 0..4usize {
        let chunk = &written[i * 8192..(i + 1) * 8192];
        assert!(chunk.iter().all(|&b| b == (i as u8 + 1)));
    }

    for h in handles {
        engine.release(h);
    }
}

struct RecordingBufferHook {
    reads: AtomicU32,
    read_failures: AtomicU32,
}
impl aio_engine::callbacks::BufferCompletionHook for RecordingBufferHook {
    fn complete_read(&self, _buffer_no: u32, failed: bool) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.read_failures.fetch_add(1, Ordering::SeqCst);
        }
    }
    fn complete_write(&self, _buffer_no: u32, _failed: bool) {}
}
impl aio_engine::callbacks::WalCompletionHook for RecordingBufferHook {
    fn flush_complete(&self, _flush_no: u64) {}
    fn write_complete(&self, _write_no: u64) {}
}

struct StaticFdResolver {
    fd: i32,
}
impl aio_engine::callbacks::RelationResolver for StaticFdResolver {
    fn resolve_fd(&self, _tag: RelationTag) -> aio_engine::Result<(i32, u64)> {
        Ok((self.fd, 0))
    }
}

#[tokio::test]
async fn short_read_is_retried_then_surfaces_as_eof() {
    // A read past EOF returns a short count from preadv; the engine must classify that as
    // SOFT_FAILURE and re-stage it via the relation resolver (advancing past the bytes it already
    // got). The file only has 4096 bytes backing an 8192-byte request, so the retried attempt
    // reads 0 further bytes at EOF, which surfaces as a (non-panicking) hard failure rather than
    // looping forever.
    let hooks = Arc::new(RecordingBufferHook {
        reads: AtomicU32::new(0),
        read_failures: AtomicU32::new(0),
    });

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0x7u8; 4096]).unwrap();
    let fd = file.as_raw_fd();

    let engine = AioEngine::new(
        worker_config(),
        EngineHooks {
            buffer: Some(hooks.clone() as Arc<dyn aio_engine::callbacks::BufferCompletionHook>),
            wal: None,
            relation_resolver: Some(Arc::new(StaticFdResolver { fd })),
            wal_segment_resolver: None,
        },
    )
    .unwrap();
    let backend_id = engine.register_backend();

    let mut buf = vec![0u8; 8192];
    let h = engine.acquire(backend_id).await.unwrap();
    engine.start_read_buffer(backend_id, h, tag(), fd, 0, 8192, buf.as_mut_ptr() as usize, 7, ReadMode::Normal);
    engine.submit_pending(backend_id).await.unwrap();
    engine.wait(backend_id, h, false).await.unwrap();

    assert!(engine.done(h));
    assert!(!engine.success(h));
    assert_eq!(hooks.read_failures.load(Ordering::SeqCst), 1);
    assert!(&buf[..4096].iter().all(|&b| b == 0x7));
    engine.release(h);
}

#[tokio::test]
async fn eio_on_write_is_a_hard_failure_not_a_panic() {
    let hooks = Arc::new(RecordingBufferHook {
        reads: AtomicU32::new(0),
        read_failures: AtomicU32::new(0),
    });
    let engine = AioEngine::new(
        worker_config(),
        EngineHooks {
            buffer: Some(hooks as Arc<dyn aio_engine::callbacks::BufferCompletionHook>),
            ..Default::default()
        },
    )
    .unwrap();
    let backend_id = engine.register_backend();

    let mut buf = vec![1u8; 4096];
    let h = engine.acquire(backend_id).await.unwrap();
    // An invalid fd (-1) makes pwritev fail with EBADF, exercising the same hard-failure path an
    // EIO would: this crate treats every non-retryable negative result identically.
    engine.start_write_buffer(backend_id, h, tag(), -1, 0, 4096, buf.as_mut_ptr() as usize, 1);
    engine.submit_pending(backend_id).await.unwrap();
    engine.wait(backend_id, h, false).await.unwrap();

    assert!(engine.done(h));
    assert!(!engine.success(h));
    engine.release(h);
}

#[tokio::test]
async fn two_backends_on_one_engine_do_not_interfere() {
    // Two independently registered backends sharing one engine instance: each completes its own
    // I/O through its own owner-routed reaped list without the other's activity leaking across.
    // (Cross-process hand-off of a completion the *drainer* doesn't own is exercised directly
    // against `completion::drain_and_complete` in that module's own test suite, since none of this
    // engine's providers ever hand one backend's completion to a different drainer.)
    let engine = AioEngine::new(worker_config(), EngineHooks::default()).unwrap();
    let backend_a = engine.register_backend();
    let backend_b = engine.register_backend();

    let file_a = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file_a.path(), vec![1u8; 4096]).unwrap();
    let file_b = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file_b.path(), vec![2u8; 4096]).unwrap();

    let mut buf_a = vec![0u8; 4096];
    let h_a = engine.acquire(backend_a).await.unwrap();
    engine.start_read_buffer(backend_a, h_a, tag(), file_a.as_raw_fd(), 0, 4096, buf_a.as_mut_ptr() as usize, 3, ReadMode::Normal);

    let mut buf_b = vec![0u8; 4096];
    let h_b = engine.acquire(backend_b).await.unwrap();
    engine.start_read_buffer(backend_b, h_b, tag(), file_b.as_raw_fd(), 0, 4096, buf_b.as_mut_ptr() as usize, 4, ReadMode::Normal);

    engine.submit_pending(backend_a).await.unwrap();
    engine.submit_pending(backend_b).await.unwrap();
    engine.wait(backend_a, h_a, false).await.unwrap();
    engine.wait(backend_b, h_b, false).await.unwrap();

    assert!(engine.success(h_a) && engine.success(h_b));
    assert!(buf_a.iter().all(|&b| b == 1));
    assert!(buf_b.iter().all(|&b| b == 2));
    engine.release(h_a);
    engine.release(h_b);
}

#[tokio::test]
async fn concurrency_cap_limits_simultaneous_inflight_ios() {
    let mut config = worker_config();
    config.io_max_concurrency = 2;
    config.submit_batch_size = 2;
    let engine = AioEngine::new(config, EngineHooks::default()).unwrap();
    let backend_id = engine.register_backend();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0u8; 64 * 1024]).unwrap();
    let fd = file.as_raw_fd();

    let mut bufs: Vec<Vec<u8>> = (0..8).map(|_| vec![1u8; 4096]).collect();
    let mut handles = Vec::new();
    for i in 0..8u64 {
        let h = engine.acquire(backend_id).await.unwrap();
        engine.start_write_buffer(
            backend_id,
            h,
            tag(),
            fd,
            i * 4096,
            4096,
            bufs[i as usize].as_mut_ptr() as usize,
            i as u32,
        );
        handles.push(h);
    }

    engine.submit_pending(backend_id).await.unwrap();
    for h in &handles {
        engine.wait(backend_id, h, false).await.unwrap();
        assert!(engine.success(h));
    }
    for h in handles {
        engine.release(h);
    }
}
