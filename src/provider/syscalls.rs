use crate::handle::{Handle, OpKind};
use crate::slab::Slab;

/// Perform the syscall for one merge-chain head and return the raw result: non-negative byte
/// count on success, `-errno` on failure. Shared by every provider that actually touches a real
/// file descriptor (worker pool, kernel ring); the POSIX AIO and IOCP providers issue their own
/// async equivalents instead of calling this directly.
pub fn execute_chain(slab: &Slab, head_slot: u32) -> i64 {
    let head = slab.get(head_slot);
    match head.op() {
        OpKind::Nop => 0,
        OpKind::Fsync | OpKind::FsyncWal | OpKind::FlushRange => do_fsync(head),
        OpKind::ReadBuffer => do_vectored(slab, head_slot, true),
        OpKind::WriteBuffer | OpKind::WriteWal | OpKind::WriteGeneric => {
            do_vectored(slab, head_slot, false)
        }
        OpKind::Invalid => -(libc::EINVAL as i64),
    }
}

#[cfg(unix)]
pub fn do_fsync(h: &Handle) -> i64 {
    let (fd, datasync) = {
        let p = h.payload.lock();
        (p.fd, p.datasync)
    };
    let rc = unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    };
    if rc == 0 {
        0
    } else {
        -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
    }
}

#[cfg(windows)]
pub fn do_fsync(_h: &Handle) -> i64 {
    0
}

#[cfg(unix)]
pub fn do_vectored(slab: &Slab, head_slot: u32, is_read: bool) -> i64 {
    let mut iovecs: Vec<libc::iovec> = Vec::new();
    let mut slot = Some(head_slot);
    let (fd, offset) = {
        let p = slab.get(head_slot).payload.lock();
        (p.fd, p.offset)
    };

    while let Some(s) = slot {
        let h = slab.get(s);
        let p = h.payload.lock();
        iovecs.push(libc::iovec {
            iov_base: p.buf_addr as *mut libc::c_void,
            iov_len: p.buf_len,
        });
        slot = h.merge_next();
    }

    let rc = unsafe {
        if is_read {
            libc::preadv(fd, iovecs.as_ptr(), iovecs.len() as i32, offset as i64)
        } else {
            libc::pwritev(fd, iovecs.as_ptr(), iovecs.len() as i32, offset as i64)
        }
    };

    if rc >= 0 {
        rc as i64
    } else {
        -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
    }
}

#[cfg(windows)]
pub fn do_vectored(_slab: &Slab, _head_slot: u32, _is_read: bool) -> i64 {
    // The worker-pool and kernel-ring providers are unix-only in practice; on windows the engine
    // always selects the IOCP provider, which never calls this. Kept for the cfg(windows) build.
    -1
}
