use std::collections::VecDeque;

use crate::handle::{flags, OpKind};
use crate::slab::Slab;

/// Can `cur` be appended onto `prev`'s merge chain? Grounded on the combine-predicate comments in
/// the original source: same op kind, no partial progress yet, contiguous offsets,
/// contiguous buffers (this engine has no scatter/gather fast path for non-contiguous merges), and
/// — for buffer reads — the same read mode. WAL and generic writes additionally require
/// `no_reorder == false`, which this engine never sets (see DESIGN.md Open Question 4), so in
/// practice WAL/generic writes never merge.
pub fn can_merge(slab: &Slab, prev_slot: u32, cur_slot: u32) -> bool {
    let prev = slab.get(prev_slot);
    let cur = slab.get(cur_slot);

    if prev.flags.is_set(flags::RETRY) || cur.flags.is_set(flags::RETRY) {
        return false;
    }
    let prev_op = prev.op();
    if prev_op != cur.op() {
        return false;
    }

    let p = prev.payload.lock();
    let c = cur.payload.lock();

    if p.already_done != 0 || c.already_done != 0 {
        return false;
    }
    if p.fd != c.fd {
        return false;
    }
    if p.offset + p.nbytes as u64 != c.offset {
        return false;
    }
    if p.buf_addr + p.buf_len != c.buf_addr {
        return false;
    }

    match prev_op {
        OpKind::ReadBuffer => p.read_mode == c.read_mode,
        OpKind::WriteWal | OpKind::WriteGeneric => !p.no_reorder && !c.no_reorder,
        OpKind::WriteBuffer => true,
        _ => false,
    }
}

/// Walk `pending` in submission order and fold it into merge chains capped at `max_combine`,
/// returning the slot index of each resulting chain head in submission order. `pending` is left
/// empty; every slot it held is now reachable from a returned head via `merge_next`.
pub fn fold_merge_chains(slab: &Slab, pending: &mut VecDeque<u32>, max_combine: usize) -> Vec<u32> {
    let mut heads = Vec::new();
    let mut iter = pending.drain(..).peekable();

    while let Some(head_slot) = iter.next() {
        let mut tail_slot = head_slot;
        let mut chain_len = 1usize;
        let mut merged_any = false;

        while chain_len < max_combine {
            let Some(&next_slot) = iter.peek() else {
                break;
            };
            if !can_merge(slab, tail_slot, next_slot) {
                break;
            }
            let next_slot = iter.next().unwrap();
            slab.get(tail_slot).set_merge_next(Some(next_slot));
            tail_slot = next_slot;
            chain_len += 1;
            merged_any = true;
        }

        if merged_any {
            slab.get(head_slot).flags.set(flags::MERGE);
        }
        heads.push(head_slot);
    }

    heads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::OpPayload;

    fn make_pending(slab: &Slab, op: OpKind, offset: u64, nbytes: u32, buf_addr: usize) -> u32 {
        let h = slab.try_acquire(0).unwrap();
        h.set_op(op);
        h.flags.transition(crate::handle::flags::IDLE, flags::IN_PROGRESS | flags::PENDING);
        *h.payload.lock() = OpPayload {
            offset,
            nbytes,
            buf_addr,
            buf_len: nbytes as usize,
            ..Default::default()
        };
        h.slot
    }

    #[test]
    fn contiguous_reads_merge_into_one_head() {
        let slab = Slab::new(8);
        let mut pending = VecDeque::new();
        pending.push_back(make_pending(&slab, OpKind::ReadBuffer, 0, 4096, 0x1000));
        pending.push_back(make_pending(&slab, OpKind::ReadBuffer, 4096, 4096, 0x2000));
        pending.push_back(make_pending(&slab, OpKind::ReadBuffer, 8192, 4096, 0x3000));

        let heads = fold_merge_chains(&slab, &mut pending, 16);
        assert_eq!(heads.len(), 1);
        assert!(pending.is_empty());
        let head = slab.get(heads[0]);
        assert!(head.flags.is_set(flags::MERGE));
        let mid = slab.get(head.merge_next().unwrap());
        let tail = slab.get(mid.merge_next().unwrap());
        assert!(tail.merge_next().is_none());
    }

    #[test]
    fn non_contiguous_offsets_do_not_merge() {
        let slab = Slab::new(8);
        let mut pending = VecDeque::new();
        pending.push_back(make_pending(&slab, OpKind::ReadBuffer, 0, 4096, 0x1000));
        pending.push_back(make_pending(&slab, OpKind::ReadBuffer, 8192, 4096, 0x2000));

        let heads = fold_merge_chains(&slab, &mut pending, 16);
        assert_eq!(heads.len(), 2);
    }

    #[test]
    fn chain_stops_at_max_combine() {
        let slab = Slab::new(20);
        let mut pending = VecDeque::new();
        for i in 0..17u64 {
            pending.push_back(make_pending(
                &slab,
                OpKind::ReadBuffer,
                i * 4096,
                4096,
                0x1000 + (i as usize) * 4096,
            ));
        }
        let heads = fold_merge_chains(&slab, &mut pending, 16);
        // 17 contiguous requests, cap 16: one chain of 16 plus a singleton head.
        assert_eq!(heads.len(), 2);
    }

    #[test]
    fn wal_writes_never_merge_because_no_reorder_is_always_set_by_this_engine() {
        let slab = Slab::new(8);
        let a = make_pending(&slab, OpKind::WriteWal, 0, 4096, 0x1000);
        let b = make_pending(&slab, OpKind::WriteWal, 4096, 4096, 0x2000);
        slab.get(a).payload.lock().no_reorder = true;
        slab.get(b).payload.lock().no_reorder = true;
        assert!(!can_merge(&slab, a, b));
    }
}
