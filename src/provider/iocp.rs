//! Windows I/O completion port provider.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use windows_sys::Win32::Foundation::{CloseHandle, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::backend::PerBackend;
use crate::error::{AioError, Result};
use crate::handle::{flags, OpKind};
use crate::slab::Slab;

use crate::provider::Provider;

/// One outstanding overlapped operation. `slot` lets completion recover the owning handle once
/// `GetQueuedCompletionStatus` hands the `OVERLAPPED*` back; boxing keeps the address stable for
/// the lifetime of the I/O.
#[repr(C)]
struct OverlappedIo {
    overlapped: OVERLAPPED,
    slot: u32,
}

pub struct IocpProvider {
    port: HANDLE,
    pending: Mutex<HashMap<u32, Box<OverlappedIo>>>,
}

unsafe impl Send for IocpProvider {}
unsafe impl Sync for IocpProvider {}

impl IocpProvider {
    pub fn new() -> Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(AioError::Provider(
                "CreateIoCompletionPort failed".into(),
            ));
        }
        Ok(Self {
            port,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn associate_file(&self, handle: HANDLE) -> Result<()> {
        let rc = unsafe { CreateIoCompletionPort(handle, self.port, handle as usize, 0) };
        if rc == 0 {
            return Err(AioError::Provider("failed to associate file handle with IOCP".into()));
        }
        Ok(())
    }

    fn submit_read_write(&self, slab: &Slab, slot: u32, is_read: bool) -> Result<()> {
        let h = slab.get(slot);
        let p = h.payload.lock();
        let file_handle = p.fd;
        let offset = p.offset;
        let buf_addr = p.buf_addr;
        let buf_len = p.buf_len;
        drop(p);

        let mut io = Box::new(OverlappedIo {
            overlapped: unsafe { std::mem::zeroed() },
            slot,
        });
        io.overlapped.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as u32;
        io.overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;

        let overlapped_ptr = &mut io.overlapped as *mut OVERLAPPED;
        let rc = unsafe {
            if is_read {
                ReadFile(
                    file_handle as HANDLE,
                    buf_addr as *mut _,
                    buf_len as u32,
                    std::ptr::null_mut(),
                    overlapped_ptr,
                )
            } else {
                WriteFile(
                    file_handle as HANDLE,
                    buf_addr as *const _,
                    buf_len as u32,
                    std::ptr::null_mut(),
                    overlapped_ptr,
                )
            }
        };

        if rc == 0 {
            let err = unsafe { windows_sys::Win32::Foundation::GetLastError() };
            if err != ERROR_IO_PENDING {
                h.set_result(-(err as i64));
                h.flags.transition(flags::INFLIGHT, flags::REAPED);
                return Ok(());
            }
        }

        self.pending.lock().insert(slot, io);
        Ok(())
    }

    fn submit_sync(&self, slab: &Slab, slot: u32) {
        let h = slab.get(slot);
        let fd = h.payload.lock().fd;
        let ok = unsafe { FlushFileBuffers(fd as HANDLE) };
        h.set_result(if ok != 0 { 0 } else { -1 });
        h.flags.transition(flags::INFLIGHT, flags::REAPED);
    }
}

#[async_trait]
impl Provider for IocpProvider {
    async fn submit(&self, backend: &PerBackend, slab: &Slab, heads: &[u32]) -> Result<()> {
        for &head_slot in heads {
            let mut slot = Some(head_slot);
            while let Some(s) = slot {
                match slab.get(s).op() {
                    OpKind::ReadBuffer => self.submit_read_write(slab, s, true)?,
                    OpKind::WriteBuffer | OpKind::WriteWal | OpKind::WriteGeneric => {
                        self.submit_read_write(slab, s, false)?
                    }
                    // FlushFileBuffers has no async form; run it synchronously on this thread,
                    // after the async ops above have already been kicked off.
                    OpKind::Fsync | OpKind::FsyncWal | OpKind::FlushRange => {
                        self.submit_sync(slab, s)
                    }
                    OpKind::Nop => slab.get(s).set_result(0),
                    OpKind::Invalid => {}
                }
                slot = slab.get(s).merge_next();
            }
            backend.submissions_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn drain(&self, backend: &PerBackend, slab: &Slab, max: usize) -> Result<usize> {
        let mut drained = 0;
        while drained < max {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped_ptr: *mut OVERLAPPED = std::ptr::null_mut();
            let ok = unsafe {
                GetQueuedCompletionStatus(self.port, &mut bytes, &mut key, &mut overlapped_ptr, 0)
            };
            if ok == 0 || overlapped_ptr.is_null() {
                break;
            }
            let io_ptr = overlapped_ptr as *mut OverlappedIo;
            let slot = unsafe { (*io_ptr).slot };
            self.pending.lock().remove(&slot);

            let h = slab.get(slot);
            h.set_result(bytes as i64);
            h.flags.transition(flags::INFLIGHT, flags::REAPED);
            backend.reaped.lock().push_back(slot);
            h.notify.notify_waiters();
            drained += 1;
        }
        Ok(drained)
    }

    async fn wait_one(&self, backend: &PerBackend, slab: &Slab, slot: u32) -> Result<()> {
        let h = slab.get(slot);
        loop {
            if h.flags.is_set(flags::REAPED | flags::DONE) {
                return Ok(());
            }
            self.drain(backend, slab, 16).await?;
            if h.flags.is_set(flags::REAPED | flags::DONE) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Drop for IocpProvider {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}
