use tracing::{error, warn};

use crate::handle::{flags, Handle, OpKind};

/// External collaborator: buffer-manager completion hooks. A real database would implement this
/// against its actual page cache; tests use a recording fake.
pub trait BufferCompletionHook: Send + Sync {
    fn complete_read(&self, buffer_no: u32, failed: bool);
    fn complete_write(&self, buffer_no: u32, failed: bool);
}

/// External collaborator: WAL completion hooks.
pub trait WalCompletionHook: Send + Sync {
    fn flush_complete(&self, flush_no: u64);
    fn write_complete(&self, write_no: u64);
}

/// External collaborator: resolves a buffer's relation tag to a live `(fd, base_offset)` pair.
/// Used on the retry path, since a relation's underlying segment file may have changed between
/// the original attempt and the retry.
pub trait RelationResolver: Send + Sync {
    fn resolve_fd(&self, tag: crate::handle::RelationTag) -> crate::error::Result<(crate::handle::RawFdLike, u64)>;
}

/// External collaborator: resolves a WAL segment number to its open file descriptor.
pub trait WalSegmentResolver: Send + Sync {
    fn open_segment(&self, segno: u32) -> crate::error::Result<crate::handle::RawFdLike>;
}

/// A hook implementation that does nothing, for configurations that don't need buffer/WAL
/// integration (e.g. a bare NOP/FSYNC-only workload, or a unit test focused on the engine core).
pub struct NullHooks;
impl BufferCompletionHook for NullHooks {
    fn complete_read(&self, _buffer_no: u32, _failed: bool) {}
    fn complete_write(&self, _buffer_no: u32, _failed: bool) {}
}
impl WalCompletionHook for NullHooks {
    fn flush_complete(&self, _flush_no: u64) {}
    fn write_complete(&self, _write_no: u64) {}
}

/// Outcome of running the shared-phase callback on one (already uncombined) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Op is fully done; move to DONE / recycle path.
    Finished,
    /// Op needs another attempt (soft failure); caller must re-stage via the retry path.
    NeedsRetry,
}

/// Run the op-kind-specific shared-phase callback on `h`, whose `result` field has already been
/// set by the provider (and, for a merged chain, uncombined into this handle's own share).
///
/// Mirrors `original_source/aio.c`'s per-action completion switch. Durability-critical
/// kinds (`FSYNC`, `FSYNC_WAL`, `WRITE_WAL`, `WRITE_GENERIC`) treat any failure as fatal: the
/// engine has no way to recover a lost fsync or WAL write, so it panics after logging, matching
/// the original's `elog(PANIC, ...)`.
pub fn run_shared_callback(
    h: &Handle,
    buffer_hook: &dyn BufferCompletionHook,
    wal_hook: &dyn WalCompletionHook,
) -> CallbackOutcome {
    let op = h.op();
    let result = h.result();
    h.flags.set(flags::SHARED_CALLBACK_CALLED);

    match op {
        OpKind::Nop => CallbackOutcome::Finished,

        OpKind::Fsync | OpKind::FlushRange => {
            if op == OpKind::Fsync && result < 0 {
                error!(slot = h.slot, result, "fsync failed, durability lost");
                panic!("fatal: fsync failed on handle {}: {}", h.slot, result);
            }
            CallbackOutcome::Finished
        }

        OpKind::FsyncWal => {
            if result < 0 {
                error!(slot = h.slot, result, "WAL fsync failed, durability lost");
                panic!("fatal: WAL fsync failed on handle {}: {}", h.slot, result);
            }
            if let Some(flush_no) = h.payload.lock().flush_no {
                wal_hook.flush_complete(flush_no);
            }
            CallbackOutcome::Finished
        }

        OpKind::ReadBuffer => complete_transfer(h, result, true, buffer_hook, wal_hook),
        OpKind::WriteBuffer => complete_transfer(h, result, false, buffer_hook, wal_hook),

        OpKind::WriteWal => {
            let expected = expected_bytes(h);
            if result < 0 || (result as u64) < expected {
                error!(
                    slot = h.slot,
                    result, expected, "WAL write failed or short, durability lost"
                );
                panic!("fatal: WAL write failed on handle {}: {}", h.slot, result);
            }
            if let Some(write_no) = h.payload.lock().write_no {
                wal_hook.write_complete(write_no);
            }
            CallbackOutcome::Finished
        }

        OpKind::WriteGeneric => {
            let expected = expected_bytes(h);
            if result < 0 || (result as u64) < expected {
                error!(
                    slot = h.slot,
                    result, expected, "generic write failed or short, durability lost"
                );
                panic!("fatal: generic write failed on handle {}: {}", h.slot, result);
            }
            CallbackOutcome::Finished
        }

        OpKind::Invalid => {
            warn!(slot = h.slot, "shared callback invoked on INVALID handle");
            CallbackOutcome::Finished
        }
    }
}

fn expected_bytes(h: &Handle) -> u64 {
    let p = h.payload.lock();
    p.nbytes as u64 - p.already_done as u64
}

fn complete_transfer(
    h: &Handle,
    result: i64,
    is_read: bool,
    buffer_hook: &dyn BufferCompletionHook,
    _wal_hook: &dyn WalCompletionHook,
) -> CallbackOutcome {
    let expected = expected_bytes(h);
    let buffer_no = h.payload.lock().buffer_no;

    if result >= 0 && result as u64 == expected {
        {
            let mut p = h.payload.lock();
            p.already_done += result as u32;
        }
        if is_read {
            buffer_hook.complete_read(buffer_no, false);
        } else {
            buffer_hook.complete_write(buffer_no, false);
        }
        CallbackOutcome::Finished
    } else if result > 0 && (result as u64) < expected {
        h.flags.set(flags::SOFT_FAILURE);
        h.payload.lock().already_done += result as u32;
        warn!(slot = h.slot, result, expected, "short I/O, will retry");
        CallbackOutcome::NeedsRetry
    } else if result < 0 && is_retryable_errno(result) {
        h.flags.set(flags::SOFT_FAILURE);
        warn!(slot = h.slot, result, "EAGAIN/EINTR, will retry");
        CallbackOutcome::NeedsRetry
    } else {
        h.flags.set(flags::HARD_FAILURE);
        h.flags.set(flags::SHARED_FAILED);
        error!(slot = h.slot, result, "buffer I/O failed");
        if is_read {
            buffer_hook.complete_read(buffer_no, true);
        } else {
            buffer_hook.complete_write(buffer_no, true);
        }
        CallbackOutcome::Finished
    }
}

/// `-EAGAIN` / `-EINTR` as negative errno values. See DESIGN.md Open Question 2: bounded retry
/// (handled by the caller's retry-attempt counter) rather than an immediate hard failure.
fn is_retryable_errno(result: i64) -> bool {
    result == -(libc::EAGAIN as i64) || result == -(libc::EINTR as i64)
}
