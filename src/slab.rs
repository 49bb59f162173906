use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{AioError, Result};
use crate::handle::{flags, Handle};

/// The fixed-size shared slab of I/O descriptors plus its free list, the Rust analogue of
/// `PgAioCtl`'s handle array and free-list fields in the original source. Everything that isn't a
/// per-handle atomic (the free list, the used counter) is guarded by one lock, matching the
/// original's single `AioCtlLock`.
pub struct Slab {
    handles: Box<[Handle]>,
    free: Mutex<VecDeque<u32>>,
    used: AtomicUsize,
}

impl Slab {
    pub fn new(capacity: usize) -> Self {
        let handles: Box<[Handle]> = (0..capacity as u32).map(Handle::new).collect();
        let free: VecDeque<u32> = (0..capacity as u32).collect();
        Self {
            handles,
            free: Mutex::new(free),
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.handles.len()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn get(&self, slot: u32) -> &Handle {
        &self.handles[slot as usize]
    }

    /// Pop a free slot and mark it `IDLE`, owned by `owner`. Returns `None` when exhausted; the
    /// caller (the engine's `acquire`) is responsible for draining providers and retrying.
    pub fn try_acquire(&self, owner: u32) -> Option<&Handle> {
        let slot = {
            let mut free = self.free.lock();
            free.pop_front()?
        };
        self.used.fetch_add(1, Ordering::AcqRel);
        let h = self.get(slot);
        debug_assert!(h.flags.is_set(flags::UNUSED));
        h.flags.transition(flags::UNUSED, flags::IDLE);
        h.set_owner(owner);
        h.set_user_referenced(true);
        Some(h)
    }

    /// Return a slot to the free list, bumping its generation so any stale reference becomes
    /// dead. The slot must already be fully reset (`DONE`, unreferenced) by the caller.
    pub fn release(&self, slot: u32) {
        let h = self.get(slot);
        debug_assert!(!h.user_referenced() && !h.system_referenced());
        h.reset_for_reuse();
        h.bump_generation();
        self.free.lock().push_back(slot);
        self.used.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter()
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_round_trips() {
        let slab = Slab::new(4);
        let h = slab.try_acquire(7).expect("slot available");
        let slot = h.slot;
        let gen0 = h.generation();
        assert_eq!(slab.used(), 1);

        h.set_user_referenced(false);
        slab.release(slot);
        assert_eq!(slab.used(), 0);
        assert_eq!(slab.get(slot).generation(), gen0 + 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let slab = Slab::new(1);
        let _h = slab.try_acquire(0).unwrap();
        assert!(slab.try_acquire(0).is_none());
    }
}

/// Convenience used by callers that want a `Result` instead of `Option`.
pub fn acquire_or_exhausted(slab: &Slab, owner: u32) -> Result<&Handle> {
    slab.try_acquire(owner).ok_or(AioError::SlotsExhausted)
}
