use std::fmt;
use std::sync::atomic::Ordering;

use crate::backend::PerBackend;
use crate::handle::{flags, Handle};

/// Snapshot of one backend's lifetime and point-in-time counters.
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub id: u32,
    pub executed_total: u64,
    pub issued_total: u64,
    pub submissions_total: u64,
    pub foreign_completed_total: u64,
    pub retry_total: u64,
    pub inflight: u32,
    pub pending: usize,
    pub outstanding: usize,
    pub reaped: usize,
}

impl BackendStats {
    pub fn snapshot(backend: &PerBackend) -> Self {
        Self {
            id: backend.id,
            executed_total: backend.executed_total.load(Ordering::Relaxed),
            issued_total: backend.issued_total.load(Ordering::Relaxed),
            submissions_total: backend.submissions_total.load(Ordering::Relaxed),
            foreign_completed_total: backend.foreign_completed_total.load(Ordering::Relaxed),
            retry_total: backend.retry_total.load(Ordering::Relaxed),
            inflight: backend.inflight(),
            pending: backend.pending.lock().len(),
            outstanding: backend.outstanding.lock().len(),
            reaped: backend.reaped.lock().len(),
        }
    }

    /// Fraction of executed I/Os that needed at least one retry.
    pub fn retry_rate(&self) -> f64 {
        if self.executed_total == 0 {
            0.0
        } else {
            self.retry_total as f64 / self.executed_total as f64
        }
    }
}

impl fmt::Display for BackendStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backend={:<4} executed={:<8} issued={:<8} submissions={:<8} foreign_completed={:<6} retries={:<6} inflight={:<4} pending={:<4}",
            self.id,
            self.executed_total,
            self.issued_total,
            self.submissions_total,
            self.foreign_completed_total,
            self.retry_total,
            self.inflight,
            self.pending,
        )
    }
}

/// One row of the per-handle debug dump.
#[derive(Debug, Clone)]
pub struct HandleDump {
    pub slot: u32,
    pub op: &'static str,
    pub flags: u32,
    pub ring: u8,
    pub owner: u32,
    pub generation: u64,
    pub result: i64,
}

impl HandleDump {
    pub fn of(h: &Handle) -> Self {
        Self {
            slot: h.slot,
            op: op_name(h.op()),
            flags: h.flags.get(),
            ring: h.ring_id(),
            owner: h.owner(),
            generation: h.generation(),
            result: h.result(),
        }
    }
}

fn op_name(op: crate::handle::OpKind) -> &'static str {
    use crate::handle::OpKind::*;
    match op {
        Invalid => "INVALID",
        Nop => "NOP",
        Fsync => "FSYNC",
        FsyncWal => "FSYNC_WAL",
        FlushRange => "FLUSH_RANGE",
        ReadBuffer => "READ_BUFFER",
        WriteBuffer => "WRITE_BUFFER",
        WriteWal => "WRITE_WAL",
        WriteGeneric => "WRITE_GENERIC",
    }
}

fn flag_string(bits: u32) -> String {
    const NAMES: &[(u32, &str)] = &[
        (flags::UNUSED, "UNUSED"),
        (flags::IDLE, "IDLE"),
        (flags::IN_PROGRESS, "IN_PROGRESS"),
        (flags::PENDING, "PENDING"),
        (flags::INFLIGHT, "INFLIGHT"),
        (flags::REAPED, "REAPED"),
        (flags::SHARED_CALLBACK_CALLED, "SHARED_CALLBACK_CALLED"),
        (flags::DONE, "DONE"),
        (flags::FOREIGN_DONE, "FOREIGN_DONE"),
        (flags::MERGE, "MERGE"),
        (flags::RETRY, "RETRY"),
        (flags::HARD_FAILURE, "HARD_FAILURE"),
        (flags::SOFT_FAILURE, "SOFT_FAILURE"),
        (flags::SHARED_FAILED, "SHARED_FAILED"),
        (flags::LOCAL_CALLBACK_CALLED, "LOCAL_CALLBACK_CALLED"),
        (flags::POSIX_AIO_RETURNED, "POSIX_AIO_RETURNED"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join("|")
}

impl fmt::Display for HandleDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot={:<6} op={:<13} owner={:<6} gen={:<6} ring={:<3} result={:<8} flags={}",
            self.slot,
            self.op,
            self.owner,
            self.generation,
            self.ring,
            self.result,
            flag_string(self.flags),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PerBackend;

    #[test]
    fn snapshot_reflects_counters() {
        let b = PerBackend::new(2);
        b.executed_total.store(10, Ordering::Relaxed);
        b.retry_total.store(2, Ordering::Relaxed);
        let s = BackendStats::snapshot(&b);
        assert_eq!(s.id, 2);
        assert_eq!(s.retry_rate(), 0.2);
    }

    #[test]
    fn handle_dump_renders_flag_names() {
        let h = Handle::new(1);
        h.flags.reset(flags::PENDING | flags::MERGE);
        let dump = HandleDump::of(&h);
        let rendered = dump.to_string();
        assert!(rendered.contains("PENDING"));
        assert!(rendered.contains("MERGE"));
    }
}
