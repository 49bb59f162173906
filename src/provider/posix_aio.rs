//! Signal-driven POSIX AIO provider.
//!
//! Each handle slot owns a fixed `libc::aiocb` control block, indexed by slot number so the
//! SIGIO handler can recover a slot purely from pointer arithmetic on the signal's delivered
//! `sival_ptr` — no locking, no allocation, nothing beyond pointer arithmetic and atomics inside
//! the handler itself.
//!
//! macOS predates queued realtime signals (`__darwin__` / the `MISSING_SIGNAL_QUEUEING` case in
//! the original source): `SIGEV_SIGNAL` delivery there can coalesce multiple completions into one
//! signal, so the handler there falls back to scanning every in-flight aiocb rather than trusting
//! `sival_ptr` alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{error, warn};

use crate::backend::PerBackend;
use crate::error::{AioError, Result};
use crate::handle::{flags, OpKind};
use crate::ring::SpscRing;
use crate::slab::Slab;

use crate::provider::Provider;

#[cfg(unix)]
struct AioCbSlot(std::cell::UnsafeCell<libc::aiocb>);
#[cfg(unix)]
unsafe impl Sync for AioCbSlot {}

/// Process-global state the SIGIO handler needs: the base of the aiocb array (for pointer
/// arithmetic) and the completion ring to push into. Set exactly once, at provider construction.
#[cfg(unix)]
struct GlobalState {
    aiocbs: Box<[AioCbSlot]>,
    ring: Arc<SpscRing>,
}

#[cfg(unix)]
static GLOBAL: OnceCell<GlobalState> = OnceCell::new();

#[cfg(unix)]
extern "C" fn sigio_handler(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // Only atomics and pointer arithmetic below this line: async-signal-safe by construction.
    let Some(state) = GLOBAL.get() else { return };
    if info.is_null() {
        return;
    }
    let sival_ptr = unsafe { (*info).si_value().sival_ptr } as *const libc::aiocb;
    let base = state.aiocbs.as_ptr() as *const libc::aiocb;
    if sival_ptr.is_null() || (sival_ptr as usize) < (base as usize) {
        return;
    }
    let stride = std::mem::size_of::<libc::aiocb>();
    let byte_offset = sival_ptr as usize - base as usize;
    if byte_offset % stride != 0 {
        return;
    }
    let slot = (byte_offset / stride) as u32;
    if (slot as usize) >= state.aiocbs.len() {
        return;
    }
    let _ = state.ring.try_push(slot);
}

/// macOS fallback: scan every slot's aiocb for one that has finished, since a coalesced signal
/// gives no reliable per-completion payload. Called from `drain`, never from the handler.
#[cfg(target_os = "macos")]
fn scan_for_finished(state: &GlobalState, slab: &Slab, max: usize) -> Vec<u32> {
    let mut out = Vec::new();
    for (slot, cb) in state.aiocbs.iter().enumerate() {
        if out.len() >= max {
            break;
        }
        let h = slab.get(slot as u32);
        if !h.flags.is_set(flags::INFLIGHT) {
            continue;
        }
        let rc = unsafe { libc::aio_error(cb.0.get()) };
        if rc != libc::EINPROGRESS {
            out.push(slot as u32);
        }
    }
    out
}

pub struct PosixAioProvider {
    #[cfg(unix)]
    installed: AtomicBool,
}

impl PosixAioProvider {
    #[cfg(unix)]
    pub fn new(capacity: usize) -> Self {
        let aiocbs: Box<[AioCbSlot]> = (0..capacity)
            .map(|_| AioCbSlot(std::cell::UnsafeCell::new(unsafe { std::mem::zeroed() })))
            .collect();
        let ring = Arc::new(SpscRing::new(capacity.next_power_of_two().max(64)));
        let _ = GLOBAL.set(GlobalState { aiocbs, ring });
        install_signal_handler();
        Self {
            installed: AtomicBool::new(true),
        }
    }

    #[cfg(not(unix))]
    pub fn new(_capacity: usize) -> Self {
        Self {}
    }

    #[cfg(unix)]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }
}

#[cfg(unix)]
fn install_signal_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigio_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGIO, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
fn submit_one(slab: &Slab, slot: u32) -> std::result::Result<(), i32> {
    let state = GLOBAL.get().expect("posix aio provider not initialized");
    let h = slab.get(slot);
    let op = h.op();
    let p = h.payload.lock();
    let fd = p.fd;
    let offset = p.offset as libc::off_t;
    let buf_addr = p.buf_addr;
    let buf_len = p.buf_len;
    drop(p);

    let cb_ptr = state.aiocbs[slot as usize].0.get();
    unsafe {
        std::ptr::write_bytes(cb_ptr, 0, 1);
        (*cb_ptr).aio_fildes = fd;
        (*cb_ptr).aio_offset = offset;
        (*cb_ptr).aio_buf = buf_addr as *mut libc::c_void;
        (*cb_ptr).aio_nbytes = buf_len;
        (*cb_ptr).aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
        (*cb_ptr).aio_sigevent.sigev_signo = libc::SIGIO;
        (*cb_ptr).aio_sigevent.sigev_value.sival_ptr = cb_ptr as *mut libc::c_void;

        let rc = match op {
            OpKind::ReadBuffer => libc::aio_read(cb_ptr),
            OpKind::WriteBuffer | OpKind::WriteWal | OpKind::WriteGeneric => {
                libc::aio_write(cb_ptr)
            }
            OpKind::Fsync | OpKind::FsyncWal | OpKind::FlushRange => {
                libc::aio_fsync(libc::O_SYNC, cb_ptr)
            }
            OpKind::Nop | OpKind::Invalid => 0,
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn finalize_one(slab: &Slab, slot: u32) {
    let state = GLOBAL.get().expect("posix aio provider not initialized");
    let h = slab.get(slot);
    let cb_ptr = state.aiocbs[slot as usize].0.get();
    let errno = unsafe { libc::aio_error(cb_ptr) };
    let result = if errno == 0 {
        unsafe { libc::aio_return(cb_ptr) }
    } else {
        -(errno as libc::ssize_t)
    };
    h.set_result(result as i64);
    h.flags.set(flags::POSIX_AIO_RETURNED);
    h.flags.transition(flags::INFLIGHT, flags::REAPED);
}

#[async_trait]
impl Provider for PosixAioProvider {
    #[cfg(unix)]
    async fn submit(&self, backend: &PerBackend, slab: &Slab, heads: &[u32]) -> Result<()> {
        for &head_slot in heads {
            let mut slot = Some(head_slot);
            while let Some(s) = slot {
                if let Err(errno) = submit_one(slab, s) {
                    warn!(slot = s, errno, "aio_read/aio_write submission failed");
                    slab.get(s).set_result(-(errno as i64));
                    slab.get(s).flags.transition(flags::INFLIGHT, flags::REAPED);
                    backend.reaped.lock().push_back(s);
                } else {
                    slab.get(s).flags.set(flags::INFLIGHT);
                }
                slot = slab.get(s).merge_next();
            }
            backend.submissions_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn submit(&self, _backend: &PerBackend, _slab: &Slab, _heads: &[u32]) -> Result<()> {
        Err(AioError::Provider("POSIX AIO provider is unix-only".into()))
    }

    #[cfg(unix)]
    async fn drain(&self, backend: &PerBackend, slab: &Slab, max: usize) -> Result<usize> {
        let state = GLOBAL.get().expect("posix aio provider not initialized");
        let mut drained = 0;

        #[cfg(target_os = "macos")]
        {
            for slot in scan_for_finished(state, slab, max) {
                finalize_one(slab, slot);
                backend.reaped.lock().push_back(slot);
                slab.get(slot).notify.notify_waiters();
                drained += 1;
            }
            return Ok(drained);
        }

        #[cfg(not(target_os = "macos"))]
        {
            while drained < max {
                match state.ring.try_pop() {
                    Some(slot) => {
                        finalize_one(slab, slot);
                        backend.reaped.lock().push_back(slot);
                        slab.get(slot).notify.notify_waiters();
                        drained += 1;
                    }
                    None => break,
                }
            }
            Ok(drained)
        }
    }

    #[cfg(not(unix))]
    async fn drain(&self, _backend: &PerBackend, _slab: &Slab, _max: usize) -> Result<usize> {
        Ok(0)
    }

    #[cfg(unix)]
    async fn wait_one(&self, backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()> {
        let h = slab.get(slot);
        loop {
            if h.flags.is_set(flags::REAPED | flags::DONE) {
                return Ok(());
            }
            let state = GLOBAL.get().expect("posix aio provider not initialized");
            let cb_ptr = state.aiocbs[slot as usize].0.get();
            unsafe {
                let mut list: [*mut libc::aiocb; 1] = [cb_ptr];
                let timeout = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 100_000_000,
                };
                libc::aio_suspend(list.as_mut_ptr() as *mut *const libc::aiocb, 1, &timeout);
            }
            if h.flags.is_set(flags::REAPED | flags::DONE) {
                return Ok(());
            }
            if unsafe { libc::aio_error(cb_ptr) } != libc::EINPROGRESS {
                finalize_one(slab, slot);
                backend.reaped.lock().push_back(slot);
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_one(&self, _backend: &PerBackend, _slab: &Slab, _slot: u32) -> Result<()> {
        Err(AioError::Provider("POSIX AIO provider is unix-only".into()))
    }

    fn closing_fd(&self, _fd: crate::handle::RawFdLike) {
        // Real deployments would refuse to close an fd with outstanding aiocbs against it; this
        // engine relies on the at-exit hook (`engine::Engine::drain_all_outstanding`) instead.
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::handle::OpPayload;
    use tempfile::NamedTempFile;
    use std::os::unix::io::AsRawFd;

    #[tokio::test]
    async fn read_completes_via_signal_queue() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello world").unwrap();
        let fd = file.as_raw_fd();

        let slab = Slab::new(4);
        let backend = PerBackend::new(0);
        let provider = PosixAioProvider::new(4);

        let mut buf = vec![0u8; 5];
        let h = slab.try_acquire(0).unwrap();
        h.set_op(OpKind::ReadBuffer);
        *h.payload.lock() = OpPayload {
            fd,
            offset: 0,
            nbytes: 5,
            buf_addr: buf.as_mut_ptr() as usize,
            buf_len: 5,
            ..Default::default()
        };

        provider.submit(&backend, &slab, &[h.slot]).await.unwrap();
        provider.wait_one(&backend, &slab, h.slot).await.unwrap();

        assert!(h.flags.is_set(flags::POSIX_AIO_RETURNED));
        assert_eq!(h.result(), 5);
        assert_eq!(&buf, b"hello");
    }
}
