use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{AioError, Result};

/// One fixed-size, page-aligned buffer, refcounted so several handles (a merged chain) can share
/// ownership of the same bounce buffer. A DMA-safe staging area for providers that can't target
/// arbitrary caller memory.
struct BounceSlot {
    ptr: *mut u8,
    layout: Layout,
    refcount: AtomicU32,
}

unsafe impl Send for BounceSlot {}
unsafe impl Sync for BounceSlot {}

impl BounceSlot {
    fn new(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| AioError::Internal(e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AioError::Internal("bounce buffer allocation failed".into()));
        }
        Ok(Self {
            ptr,
            layout,
            refcount: AtomicU32::new(0),
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for BounceSlot {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A checked-out bounce buffer. Dropping it releases the engine's reference; the underlying slot
/// returns to the free list once the refcount reaches zero.
pub struct BounceBuffer<'a> {
    pool: &'a BouncePool,
    index: u32,
}

impl<'a> BounceBuffer<'a> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn as_slice(&self) -> &[u8] {
        self.pool.slots[self.index as usize].as_slice()
    }

    pub fn as_mut_slice(&self) -> &mut [u8] {
        self.pool.slots[self.index as usize].as_mut_slice()
    }
}

impl<'a> Drop for BounceBuffer<'a> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Pool of fixed-size bounce buffers, sized at startup from `max_aio_bounce_buffers`.
pub struct BouncePool {
    slots: Box<[BounceSlot]>,
    free: Mutex<Vec<u32>>,
    available: AtomicUsize,
}

impl BouncePool {
    pub fn new(count: usize, buffer_size: usize, align: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(BounceSlot::new(buffer_size, align)?);
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new((0..count as u32).collect()),
            available: AtomicUsize::new(count),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Check out a buffer, bumping its refcount to 1.
    pub fn get(&self) -> Result<BounceBuffer<'_>> {
        let index = {
            let mut free = self.free.lock();
            free.pop().ok_or(AioError::BounceBuffersExhausted)?
        };
        self.available.fetch_sub(1, Ordering::AcqRel);
        self.slots[index as usize].refcount.store(1, Ordering::Release);
        Ok(BounceBuffer { pool: self, index })
    }

    /// Attach an additional owner to an already-checked-out buffer (used when a merge chain's
    /// links all point at the same bounce slot).
    pub fn acquire_ref(&self, index: u32) {
        self.slots[index as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference to a checked-out slot without going through a `BounceBuffer` guard.
    /// Used by the engine when unwinding a handle's bounce association on recycle, since the
    /// handle only ever stored the slot index, not the guard itself.
    pub fn release_ref(&self, index: u32) {
        self.release(index);
    }

    fn release(&self, index: u32) {
        let prev = self.slots[index as usize]
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.free.lock().push(index);
            self.available.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn slice(&self, index: u32) -> &[u8] {
        self.slots[index as usize].as_slice()
    }

    pub fn slice_mut(&self, index: u32) -> &mut [u8] {
        self.slots[index as usize].as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_return() {
        let pool = BouncePool::new(2, 4096, 4096).unwrap();
        assert_eq!(pool.available(), 2);
        let buf = pool.get().unwrap();
        assert_eq!(pool.available(), 1);
        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhaustion_errors() {
        let pool = BouncePool::new(1, 4096, 4096).unwrap();
        let _b1 = pool.get().unwrap();
        assert!(pool.get().is_err());
    }

    #[test]
    fn shared_refcount_delays_release() {
        let pool = BouncePool::new(1, 4096, 4096).unwrap();
        let buf = pool.get().unwrap();
        let idx = buf.index();
        pool.acquire_ref(idx);
        assert_eq!(pool.available(), 0);
        pool.release(idx);
        assert_eq!(pool.available(), 0);
        drop(buf);
        assert_eq!(pool.available(), 1);
    }
}
