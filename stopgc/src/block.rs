use bitflags::bitflags;

use crate::{
    error::{Fatal, fatal},
    size_class::GRANULE,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Block is carved into slots of one size class.
        const IN_USE = 1 << 0;
        /// Slots hold pointer-free objects and are never scanned.
        const ATOMIC = 1 << 1;
        /// Pages were handed back to the OS while the block was free.
        const UNMAPPED = 1 << 2;
    }
}

/// End of a slot free list.
pub const NO_SLOT: u16 = u16::MAX;

// ── Bitmap ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Box<[u64]>,
}

impl Bitmap {
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Sets `bit`, returns `true` if it was clear before.
    #[inline(always)]
    pub fn set(&mut self, bit: usize) -> bool {
        let word = &mut self.words[bit / 64];
        let mask = 1 << (bit % 64);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    #[inline(always)]
    pub fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(idx * 64 + bit)
            })
        })
    }
}

// ── HeapBlock ─────────────────────────────────────────────────────────

/// Metadata of one block of the heap reservation.
///
/// Slot memory lives in the reservation at `start`; everything else, the
/// free list included, is kept on the side so object contents never alias
/// allocator state.
#[derive(Debug)]
pub struct HeapBlock {
    pub index: u32,
    pub start: usize,
    pub flags: BlockFlags,
    pub class: usize,
    pub slot_size: usize,
    pub slot_count: u16,
    marks: Bitmap,
    allocated: Bitmap,
    next_free: Box<[u16]>,
    free_head: u16,
    pub free_count: u16,
    /// Collections this block has spent fully free.
    pub idle_collections: u32,
}

impl HeapBlock {
    pub fn new(index: u32, start: usize, block_size: usize) -> Self {
        let max_slots = block_size / GRANULE;
        Self {
            index,
            start,
            flags: BlockFlags::empty(),
            class: 0,
            slot_size: 0,
            slot_count: 0,
            marks: Bitmap::new(max_slots),
            allocated: Bitmap::new(max_slots),
            next_free: vec![NO_SLOT; max_slots].into_boxed_slice(),
            free_head: NO_SLOT,
            free_count: 0,
            idle_collections: 0,
        }
    }

    /// Carves the block into slots of `slot_size` bytes. Leftover bytes at
    /// the end of the block are never handed out.
    pub fn init(
        &mut self,
        class: usize,
        slot_size: usize,
        atomic: bool,
        block_size: usize,
    ) {
        debug_assert!(!self.in_use());
        debug_assert!(slot_size.is_multiple_of(GRANULE));

        let slot_count = block_size / slot_size;
        self.flags.remove(BlockFlags::UNMAPPED);
        self.flags.insert(BlockFlags::IN_USE);
        self.flags.set(BlockFlags::ATOMIC, atomic);
        self.class = class;
        self.slot_size = slot_size;
        self.slot_count = slot_count as u16;
        self.marks.clear_all();
        self.allocated.clear_all();
        self.idle_collections = 0;

        for slot in 0..slot_count {
            self.next_free[slot] = if slot + 1 < slot_count {
                (slot + 1) as u16
            } else {
                NO_SLOT
            };
        }
        self.free_head = 0;
        self.free_count = slot_count as u16;
    }

    /// Returns the block to the free pool.
    pub fn release(&mut self) {
        self.flags.remove(BlockFlags::IN_USE | BlockFlags::ATOMIC);
        self.free_head = NO_SLOT;
        self.free_count = 0;
        self.slot_count = 0;
        self.marks.clear_all();
        self.allocated.clear_all();
    }

    #[inline(always)]
    pub fn in_use(&self) -> bool {
        self.flags.contains(BlockFlags::IN_USE)
    }

    #[inline(always)]
    pub fn is_atomic(&self) -> bool {
        self.flags.contains(BlockFlags::ATOMIC)
    }

    #[inline(always)]
    pub fn slot_addr(&self, slot: u16) -> usize {
        self.start + slot as usize * self.slot_size
    }

    pub fn pop_free(&mut self) -> Option<u16> {
        let slot = self.free_head;
        if slot == NO_SLOT {
            return None;
        }
        self.free_head = self.next_free[slot as usize];
        self.next_free[slot as usize] = NO_SLOT;
        let fresh = self.allocated.set(slot as usize);
        if cfg!(debug_assertions) && !fresh {
            fatal(Fatal::CorruptionDetected {
                detail: "free list hands out an allocated slot",
                addr: self.slot_addr(slot),
            });
        }
        self.free_count -= 1;
        Some(slot)
    }

    /// Puts an allocated slot back on the free list. Returns `false` if the
    /// slot was not allocated.
    pub fn push_free(&mut self, slot: u16) -> bool {
        if !self.allocated.get(slot as usize) {
            return false;
        }
        self.allocated.clear(slot as usize);
        self.marks.clear(slot as usize);
        self.next_free[slot as usize] = self.free_head;
        self.free_head = slot;
        self.free_count += 1;
        true
    }

    /// Slot holding `addr`. With `interior == false` only slot base
    /// addresses resolve. Free slots and the tail past the last slot never
    /// resolve.
    #[inline]
    pub fn slot_of(&self, addr: usize, interior: bool) -> Option<u16> {
        if !self.in_use() || addr < self.start {
            return None;
        }
        let offset = addr - self.start;
        let slot = offset / self.slot_size;
        if slot >= self.slot_count as usize {
            return None;
        }
        if !interior && offset % self.slot_size != 0 {
            return None;
        }
        self.allocated.get(slot).then_some(slot as u16)
    }

    #[inline(always)]
    pub fn is_allocated(&self, slot: u16) -> bool {
        self.allocated.get(slot as usize)
    }

    /// Marks `slot`, returns `true` if it was not marked yet.
    #[inline(always)]
    pub fn mark(&mut self, slot: u16) -> bool {
        self.marks.set(slot as usize)
    }

    #[inline(always)]
    pub fn is_marked(&self, slot: u16) -> bool {
        self.marks.get(slot as usize)
    }

    pub fn live_count(&self) -> usize {
        self.allocated.count_ones()
    }

    /// Frees every allocated slot that is not marked, rebuilds the free list
    /// in address order and clears all marks. Returns `(live, freed)`.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut live = 0;
        let mut freed = 0;
        let mut head = NO_SLOT;

        for slot in (0..self.slot_count as usize).rev() {
            if self.allocated.get(slot) {
                if self.marks.get(slot) {
                    live += 1;
                    continue;
                }
                self.allocated.clear(slot);
                freed += 1;
            }
            self.next_free[slot] = head;
            head = slot as u16;
        }

        self.free_head = head;
        self.free_count = self.slot_count - live as u16;
        self.marks.clear_all();
        (live, freed)
    }

    /// Walks the free list and checks it against the allocation bitmap.
    pub fn verify(&self) {
        let mut seen = 0usize;
        let mut slot = self.free_head;
        while slot != NO_SLOT {
            if slot >= self.slot_count
                || self.allocated.get(slot as usize)
                || seen > self.slot_count as usize
            {
                fatal(Fatal::CorruptionDetected {
                    detail: "free list link is inconsistent",
                    addr: self.start + slot as usize * self.slot_size,
                });
            }
            seen += 1;
            slot = self.next_free[slot as usize];
        }
        if let Some(slot) =
            self.marks.iter_ones().find(|&slot| !self.allocated.get(slot))
        {
            fatal(Fatal::CorruptionDetected {
                detail: "mark bit set on a free slot",
                addr: self.start + slot * self.slot_size,
            });
        }
        if seen != self.free_count as usize
            || seen + self.live_count() != self.slot_count as usize
        {
            fatal(Fatal::CorruptionDetected {
                detail: "free count does not match the allocation bitmap",
                addr: self.start,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BLOCK: usize = 4096;

    fn block_with(slot_size: usize) -> HeapBlock {
        let mut block = HeapBlock::new(0, 0x10_0000, BLOCK);
        block.init(0, slot_size, false, BLOCK);
        block
    }

    #[test]
    fn free_list_hands_out_ascending_slots() {
        let mut block = block_with(48);
        assert_eq!(block.slot_count, (BLOCK / 48) as u16);
        assert_eq!(block.pop_free(), Some(0));
        assert_eq!(block.pop_free(), Some(1));
        assert_eq!(block.free_count, block.slot_count - 2);
        block.verify();
    }

    #[test]
    fn slot_lookup_respects_interior_setting() {
        let mut block = block_with(48);
        let slot = block.pop_free().expect("slot");
        let base = block.slot_addr(slot);

        assert_eq!(block.slot_of(base, false), Some(slot));
        assert_eq!(block.slot_of(base + 8, false), None);
        assert_eq!(block.slot_of(base + 47, true), Some(slot));
        // next slot is still free
        assert_eq!(block.slot_of(base + 48, true), None);
        // tail waste past the last slot
        let tail = block.start + block.slot_count as usize * 48;
        assert_eq!(block.slot_of(tail, true), None);
    }

    #[test]
    fn sweep_frees_unmarked_slots_and_clears_marks() {
        let mut block = block_with(64);
        let a = block.pop_free().expect("a");
        let b = block.pop_free().expect("b");
        let c = block.pop_free().expect("c");

        assert!(block.mark(b));
        assert!(!block.mark(b), "second mark is not new");

        let (live, freed) = block.sweep();
        assert_eq!((live, freed), (1, 2));
        assert!(block.is_allocated(b));
        assert!(!block.is_allocated(a));
        assert!(!block.is_allocated(c));
        assert!(!block.is_marked(b));
        block.verify();

        // freed slots are reused lowest first
        assert_eq!(block.pop_free(), Some(a));
        assert_eq!(block.pop_free(), Some(c));
    }

    #[test]
    fn push_free_rejects_free_slots() {
        let mut block = block_with(32);
        let slot = block.pop_free().expect("slot");
        assert!(block.push_free(slot));
        assert!(!block.push_free(slot), "double free must be detected");
        block.verify();
    }

    #[test]
    fn release_then_reinit_with_other_class() {
        let mut block = block_with(32);
        block.pop_free();
        block.release();
        assert!(!block.in_use());
        assert_eq!(block.slot_of(block.start, true), None);

        block.init(3, 256, true, BLOCK);
        assert!(block.is_atomic());
        assert_eq!(block.slot_count, 16);
        assert_eq!(block.live_count(), 0);
        block.verify();
    }

    proptest! {
        #[test]
        fn bitmap_iter_ones_matches_get(bits in proptest::collection::btree_set(0usize..512, 0..64)) {
            let mut map = Bitmap::new(512);
            for &bit in &bits {
                prop_assert!(map.set(bit));
            }
            let ones: Vec<_> = map.iter_ones().collect();
            let expected: Vec<_> = bits.iter().copied().collect();
            prop_assert_eq!(ones, expected);
            prop_assert_eq!(map.count_ones(), bits.len());
        }

        #[test]
        fn sweep_keeps_exactly_the_marked_slots(
            marked in proptest::collection::vec(any::<bool>(), 64)
        ) {
            let mut block = block_with(64);
            for _ in 0..64 {
                block.pop_free();
            }
            for (slot, &keep) in marked.iter().enumerate() {
                if keep {
                    block.mark(slot as u16);
                }
            }
            let (live, freed) = block.sweep();
            let expected = marked.iter().filter(|&&k| k).count();
            prop_assert_eq!(live, expected);
            prop_assert_eq!(freed, 64 - expected);
            block.verify();
        }
    }
}
