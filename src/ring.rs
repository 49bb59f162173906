use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A fixed-capacity single-producer/single-consumer ring of slot indices, safe to push from inside
/// a signal handler: no allocation, no user-space locks, only atomic loads/stores. This backs the
/// POSIX AIO provider's SIGIO completion queue; the producer
/// is the signal handler, the consumer is whichever backend next calls `drain`.
///
/// Capacity is fixed at construction and must be a power of two; the buffer is heap-allocated once
/// up front (never resized), since resizing from a signal handler would be unsound.
pub struct SpscRing {
    buf: Box<[AtomicU32]>,
    mask: u64,
    head: AtomicU64, // next free slot to write (producer-owned)
    tail: AtomicU64, // next slot to read (consumer-owned)
}

/// Sentinel marking "no value" so a torn read (reader observing `head` advanced but the write not
/// yet visible) can be detected without taking a lock; occupied slots always hold a real index.
const EMPTY: u32 = u32::MAX;

impl SpscRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buf: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(EMPTY)).collect();
        Self {
            buf,
            mask: (capacity - 1) as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Producer side. Async-signal-safe: only atomic ops, no allocation, no blocking.
    pub fn try_push(&self, slot: u32) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.buf.len() as u64 {
            return false; // full
        }
        let idx = (head & self.mask) as usize;
        self.buf[idx].store(slot, Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Not called from the signal handler.
    pub fn try_pop(&self) -> Option<u32> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None; // empty
        }
        let idx = (tail & self.mask) as usize;
        let v = self.buf[idx].load(Ordering::Acquire);
        self.buf[idx].store(EMPTY, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(v)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
