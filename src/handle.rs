use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Sentinel owner id for a handle not currently associated with any backend.
pub const NO_OWNER: u32 = u32::MAX;
/// Sentinel slot index, used for "no merge link" / "no bounce buffer".
pub const NO_SLOT: u32 = u32::MAX;

/// The kind of operation a handle carries. Mirrors `PgAioAction` in the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Invalid = 0,
    Nop,
    Fsync,
    FsyncWal,
    FlushRange,
    ReadBuffer,
    WriteBuffer,
    WriteWal,
    WriteGeneric,
}

impl OpKind {
    pub fn is_read(self) -> bool {
        matches!(self, OpKind::ReadBuffer)
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            OpKind::WriteBuffer | OpKind::WriteWal | OpKind::WriteGeneric
        )
    }

    pub fn is_sync(self) -> bool {
        matches!(self, OpKind::Fsync | OpKind::FsyncWal | OpKind::FlushRange)
    }

    /// Only buffer reads and buffer writes are retryable (see retry path).
    pub fn is_retryable(self) -> bool {
        matches!(self, OpKind::ReadBuffer | OpKind::WriteBuffer)
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => OpKind::Nop,
            2 => OpKind::Fsync,
            3 => OpKind::FsyncWal,
            4 => OpKind::FlushRange,
            5 => OpKind::ReadBuffer,
            6 => OpKind::WriteBuffer,
            7 => OpKind::WriteWal,
            8 => OpKind::WriteGeneric,
            _ => OpKind::Invalid,
        }
    }
}

/// Read-mode discriminator used by the buffer-read merge predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    Prefetch,
}

/// Lifecycle and event flags, one bit each. Mirrors `PgAioInProgressFlags` in the original
/// source: 16 bits, not all mutually exclusive (e.g. `PENDING` and `IN_PROGRESS` are both set
/// while a handle is staged).
pub mod flags {
    pub const UNUSED: u32 = 1 << 0;
    pub const IDLE: u32 = 1 << 1;
    pub const IN_PROGRESS: u32 = 1 << 2;
    pub const PENDING: u32 = 1 << 3;
    pub const INFLIGHT: u32 = 1 << 4;
    pub const REAPED: u32 = 1 << 5;
    pub const SHARED_CALLBACK_CALLED: u32 = 1 << 6;
    pub const DONE: u32 = 1 << 7;
    pub const FOREIGN_DONE: u32 = 1 << 8;
    pub const MERGE: u32 = 1 << 9;
    pub const RETRY: u32 = 1 << 10;
    pub const HARD_FAILURE: u32 = 1 << 11;
    pub const SOFT_FAILURE: u32 = 1 << 12;
    pub const SHARED_FAILED: u32 = 1 << 13;
    pub const LOCAL_CALLBACK_CALLED: u32 = 1 << 14;
    pub const POSIX_AIO_RETURNED: u32 = 1 << 15;
}

/// Atomic bit set wrapper over the flags above.
#[derive(Debug)]
pub struct HandleFlags(AtomicU32);

impl HandleFlags {
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.get() & mask != 0
    }

    pub fn set(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear(&self, mask: u32) {
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clear `clear_mask` and set `set_mask` as one logical transition. Not atomic as a single
    /// CPU instruction (there is no fetch-and-then-or primitive), but callers always hold the
    /// handle's owning lock (the per-backend list lock or the slab's free-list lock) while
    /// calling this, so no observer can see an intermediate state.
    pub fn transition(&self, clear_mask: u32, set_mask: u32) {
        let cur = self.0.load(Ordering::Acquire);
        let next = (cur & !clear_mask) | set_mask;
        self.0.store(next, Ordering::Release);
    }

    pub fn reset(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}

/// Relation-resolvable target for buffer reads/writes. Resolution of `tag` to a raw descriptor is
/// an external collaborator's job (`RelationResolver`); the AIO engine only carries the tag so
/// retry can re-resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationTag {
    pub relation_id: u32,
    pub fork: u8,
    pub block_size_log2: u8,
}

/// Per-handle operation payload. Filled in by the `start_*` family, consumed by the provider and
/// the shared-phase callback.
#[derive(Debug, Clone)]
pub struct OpPayload {
    pub fd: RawFdLike,
    pub offset: u64,
    pub nbytes: u32,
    pub already_done: u32,
    /// Address of the caller-owned buffer, stored as a plain integer so the payload stays
    /// `Send`/`Sync` without an `unsafe impl` at the field level; reconstructed into a slice only
    /// by the provider that actually performs the I/O.
    pub buf_addr: usize,
    pub buf_len: usize,
    pub tag: Option<RelationTag>,
    pub buffer_no: u32,
    pub segno: Option<u32>,
    pub timeline: Option<u32>,
    pub write_no: Option<u64>,
    pub flush_no: Option<u64>,
    pub barrier: bool,
    pub datasync: bool,
    pub no_reorder: bool,
    pub read_mode: ReadMode,
}

#[cfg(unix)]
pub type RawFdLike = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawFdLike = std::os::windows::io::RawHandle;

impl Default for OpPayload {
    fn default() -> Self {
        Self {
            fd: default_fd(),
            offset: 0,
            nbytes: 0,
            already_done: 0,
            buf_addr: 0,
            buf_len: 0,
            tag: None,
            buffer_no: 0,
            segno: None,
            timeline: None,
            write_no: None,
            flush_no: None,
            barrier: false,
            datasync: false,
            no_reorder: false,
            read_mode: ReadMode::Normal,
        }
    }
}

#[cfg(unix)]
fn default_fd() -> RawFdLike {
    -1
}
#[cfg(windows)]
fn default_fd() -> RawFdLike {
    std::ptr::null_mut()
}

pub type LocalCallback = Box<dyn FnOnce(&Handle) + Send + 'static>;

/// One I/O descriptor slot. Cache-line aligned so adjacent slots don't false-share under
/// concurrent polling.
#[repr(C, align(64))]
pub struct Handle {
    pub slot: u32,
    op: AtomicU8,
    pub flags: HandleFlags,
    owner_id: AtomicU32,
    ring_id: AtomicU8,
    generation: AtomicU64,
    result: AtomicI64,
    /// Slot index of the next handle in this merge chain, or `NO_SLOT`.
    merge_next: AtomicU32,
    /// Slot index into the bounce buffer pool, or `NO_SLOT`.
    bounce: AtomicU32,
    user_referenced: AtomicU8,
    system_referenced: AtomicU8,
    pub payload: Mutex<OpPayload>,
    local_callback: Mutex<Option<LocalCallback>>,
    pub notify: Notify,
}

// `Handle` holds no raw pointers directly (buffer addresses are plain `usize`), so it is safe to
// share and send across threads; `Notify` and the atomics already are.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn new(slot: u32) -> Self {
        Self {
            slot,
            op: AtomicU8::new(OpKind::Invalid as u8),
            flags: HandleFlags::new(flags::UNUSED),
            owner_id: AtomicU32::new(NO_OWNER),
            ring_id: AtomicU8::new(0),
            generation: AtomicU64::new(0),
            result: AtomicI64::new(0),
            merge_next: AtomicU32::new(NO_SLOT),
            bounce: AtomicU32::new(NO_SLOT),
            user_referenced: AtomicU8::new(0),
            system_referenced: AtomicU8::new(0),
            payload: Mutex::new(OpPayload::default()),
            local_callback: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn op(&self) -> OpKind {
        OpKind::from_u8(self.op.load(Ordering::Acquire))
    }

    pub fn set_op(&self, op: OpKind) {
        self.op.store(op as u8, Ordering::Release);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reference(&self) -> Reference {
        Reference {
            slot: self.slot,
            generation: self.generation(),
        }
    }

    pub fn is_live(&self, r: Reference) -> bool {
        r.slot == self.slot && r.generation == self.generation()
    }

    pub fn owner(&self) -> u32 {
        self.owner_id.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, owner: u32) {
        self.owner_id.store(owner, Ordering::Release);
    }

    pub fn ring_id(&self) -> u8 {
        self.ring_id.load(Ordering::Acquire)
    }

    pub fn set_ring_id(&self, id: u8) {
        self.ring_id.store(id, Ordering::Release);
    }

    pub fn result(&self) -> i64 {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_result(&self, v: i64) {
        self.result.store(v, Ordering::Release);
    }

    pub fn merge_next(&self) -> Option<u32> {
        match self.merge_next.load(Ordering::Acquire) {
            NO_SLOT => None,
            s => Some(s),
        }
    }

    pub fn set_merge_next(&self, slot: Option<u32>) {
        self.merge_next
            .store(slot.unwrap_or(NO_SLOT), Ordering::Release);
    }

    pub fn bounce_slot(&self) -> Option<u32> {
        match self.bounce.load(Ordering::Acquire) {
            NO_SLOT => None,
            s => Some(s),
        }
    }

    pub fn set_bounce_slot(&self, slot: Option<u32>) {
        self.bounce.store(slot.unwrap_or(NO_SLOT), Ordering::Release);
    }

    pub fn user_referenced(&self) -> bool {
        self.user_referenced.load(Ordering::Acquire) != 0
    }

    pub fn set_user_referenced(&self, v: bool) {
        self.user_referenced.store(v as u8, Ordering::Release);
    }

    pub fn system_referenced(&self) -> bool {
        self.system_referenced.load(Ordering::Acquire) != 0
    }

    pub fn set_system_referenced(&self, v: bool) {
        self.system_referenced.store(v as u8, Ordering::Release);
    }

    pub fn set_local_callback(&self, cb: LocalCallback) {
        *self.local_callback.lock() = Some(cb);
    }

    pub fn take_local_callback(&self) -> Option<LocalCallback> {
        self.local_callback.lock().take()
    }

    /// Reset all mutable state for reuse; called with the slot's ownership uncontested (either
    /// fresh off the slab or about to be pushed back onto the global free list).
    pub fn reset_for_reuse(&self) {
        self.op.store(OpKind::Invalid as u8, Ordering::Release);
        self.flags.reset(flags::UNUSED);
        self.owner_id.store(NO_OWNER, Ordering::Release);
        self.ring_id.store(0, Ordering::Release);
        self.result.store(0, Ordering::Release);
        self.merge_next.store(NO_SLOT, Ordering::Release);
        self.bounce.store(NO_SLOT, Ordering::Release);
        self.user_referenced.store(0, Ordering::Release);
        self.system_referenced.store(0, Ordering::Release);
        *self.payload.lock() = OpPayload::default();
        *self.local_callback.lock() = None;
    }
}

/// An ABA-safe, cross-process-shaped reference to a handle: (slot index, generation at the time
/// the reference was taken). A reference is live iff the slot's current generation still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    pub slot: u32,
    pub generation: u64,
}
