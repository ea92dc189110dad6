//! Block arena and object space.
//!
//! The whole block heap is one address space reservation of
//! `max_heap_size` bytes. Blocks are committed lazily up to `block_limit`,
//! which only grows through [`HeapArena::expand`]. Block metadata lives in
//! `blocks`, addressed by block index; objects are addressed as
//! `(block, slot)` pairs or large-object ids, never by raw pointer chasing.

use std::ptr::NonNull;

use crate::{
    block::{BlockFlags, HeapBlock},
    error::InitError,
    large::{LargeSpace, LargeSweep},
    settings::CollectorSettings,
    size_class::SizeClasses,
    system,
};

/// Whether an object may contain pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Scanned conservatively for references and zero-filled on
    /// allocation.
    Normal,
    /// Known to be pointer-free. Marked when reached but never scanned,
    /// contents are not cleared.
    Atomic,
}

impl ObjectKind {
    #[inline(always)]
    fn index(self) -> usize {
        match self {
            ObjectKind::Normal => 0,
            ObjectKind::Atomic => 1,
        }
    }
}

/// Index-based handle of an allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Small { block: u32, slot: u16 },
    Large { id: u32 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapCounters {
    pub bytes_since_gc: usize,
    pub total_bytes: usize,
    pub live_bytes: usize,
    pub live_objects: usize,
    pub unmapped_bytes: usize,
}

#[derive(Debug)]
pub struct HeapArena {
    block_size: usize,
    max_heap_size: usize,
    region: NonNull<u8>,
    region_size: usize,
    pub(crate) blocks: Vec<HeapBlock>,
    /// Blocks the heap may currently use.
    block_limit: usize,
    /// Committed blocks that carry no slots.
    pub(crate) free_blocks: Vec<u32>,
    /// Blocks with at least one free slot, per kind and size class.
    /// Allocation serves from the last entry.
    partial: [Vec<Vec<u32>>; 2],
    classes: SizeClasses,
    pub(crate) large: LargeSpace,
    pub counters: HeapCounters,
}

// SAFETY: the region pointer is owned by the arena and only touched through
// `&mut self` or while holding the heap lock.
unsafe impl Send for HeapArena {}

impl HeapArena {
    pub fn new(settings: &CollectorSettings) -> Result<Self, InitError> {
        settings.validate().map_err(InitError::Settings)?;

        let block_size = settings.block_size;
        let region_size = settings.max_heap_size / block_size * block_size;
        let region = system::map_memory(region_size)
            .ok_or(InitError::Reserve(region_size))?;
        debug_assert!(
            (region.as_ptr() as usize).is_multiple_of(system::OS_PAGE_SIZE)
        );

        let classes = SizeClasses::new(block_size);
        let per_kind = || vec![Vec::new(); classes.len()];
        let block_limit = (settings.initial_heap_size / block_size).max(1);

        Ok(Self {
            block_size,
            max_heap_size: settings.max_heap_size,
            region,
            region_size,
            blocks: Vec::with_capacity(block_limit),
            block_limit,
            free_blocks: Vec::new(),
            partial: [per_kind(), per_kind()],
            classes,
            large: LargeSpace::default(),
            counters: HeapCounters::default(),
        })
    }

    #[inline(always)]
    fn region_start(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Bytes the heap currently spans: the block budget plus large objects,
    /// minus pages handed back to the OS.
    pub fn heap_size(&self) -> usize {
        self.block_limit * self.block_size + self.large.bytes()
            - self.counters.unmapped_bytes
    }

    /// Bytes occupied by allocated objects, rounded up to their slots.
    pub fn used_bytes(&self) -> usize {
        let small: usize = self
            .blocks
            .iter()
            .filter(|b| b.in_use())
            .map(|b| (b.slot_count - b.free_count) as usize * b.slot_size)
            .sum();
        small + self.large.bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.heap_size().saturating_sub(self.used_bytes())
    }

    pub fn blocks_in_use(&self) -> usize {
        self.blocks.iter().filter(|b| b.in_use()).count()
    }

    pub fn large_objects(&self) -> usize {
        self.large.len()
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates without collecting or growing. Returns the object and its
    /// usable size.
    pub fn try_allocate(
        &mut self,
        size: usize,
        kind: ObjectKind,
    ) -> Option<(ObjectRef, NonNull<u8>, usize)> {
        let allocated = match self.classes.class_for(size) {
            Some(class) => self.allocate_small(class, kind),
            None => self.allocate_large(size, kind),
        };
        let (obj, ptr, usable) = allocated?;
        self.counters.bytes_since_gc += usable;
        self.counters.total_bytes += usable;
        Some((obj, ptr, usable))
    }

    fn allocate_small(
        &mut self,
        class: usize,
        kind: ObjectKind,
    ) -> Option<(ObjectRef, NonNull<u8>, usize)> {
        let block_idx = match self.partial[kind.index()][class].last() {
            Some(&idx) => idx,
            None => {
                let idx = self.acquire_block()?;
                let slot_size = self.classes.slot_size(class);
                self.blocks[idx as usize].init(
                    class,
                    slot_size,
                    kind == ObjectKind::Atomic,
                    self.block_size,
                );
                self.partial[kind.index()][class].push(idx);
                idx
            }
        };

        let block = &mut self.blocks[block_idx as usize];
        let slot = block.pop_free()?;
        let addr = block.slot_addr(slot);
        let slot_size = block.slot_size;
        if block.free_count == 0 {
            self.partial[kind.index()][class].pop();
        }

        if kind == ObjectKind::Normal {
            // SAFETY: the slot lies inside a committed block of the
            // reservation and is exclusively owned by the new object
            unsafe { (addr as *mut u8).write_bytes(0, slot_size) };
        }
        let ptr = NonNull::new(addr as *mut u8)?;
        Some((
            ObjectRef::Small {
                block: block_idx,
                slot,
            },
            ptr,
            slot_size,
        ))
    }

    fn allocate_large(
        &mut self,
        size: usize,
        kind: ObjectKind,
    ) -> Option<(ObjectRef, NonNull<u8>, usize)> {
        let footprint = LargeSpace::footprint(size)?;
        if self.heap_size().checked_add(footprint)? > self.max_heap_size {
            return None;
        }
        let (id, start) = self.large.allocate(size, kind == ObjectKind::Atomic)?;
        let ptr = NonNull::new(start as *mut u8)?;
        Some((ObjectRef::Large { id }, ptr, footprint))
    }

    /// Takes a block with no slots, reusing released ones before committing
    /// fresh ones below the limit.
    fn acquire_block(&mut self) -> Option<u32> {
        if let Some(idx) = self.free_blocks.pop() {
            let block = &mut self.blocks[idx as usize];
            if block.flags.contains(BlockFlags::UNMAPPED) {
                block.flags.remove(BlockFlags::UNMAPPED);
                self.counters.unmapped_bytes -= self.block_size;
            }
            block.idle_collections = 0;
            return Some(idx);
        }

        let idx = self.blocks.len();
        if idx >= self.block_limit {
            return None;
        }
        let start = self.region_start() + idx * self.block_size;
        self.blocks
            .push(HeapBlock::new(idx as u32, start, self.block_size));
        Some(idx as u32)
    }

    /// Raises the block budget so that at least `bytes` more can be served.
    /// Grows by at least a quarter of the current heap. Returns the old and
    /// new heap size, `None` if the heap is already at its maximum.
    pub fn expand(&mut self, bytes: usize) -> Option<(usize, usize)> {
        let old_size = self.heap_size();
        let wanted = bytes.max(old_size / 4).max(self.block_size);
        let max_by_region = self.region_size / self.block_size;
        let max_by_budget = self
            .max_heap_size
            .saturating_sub(self.large.bytes())
            / self.block_size;
        let cap = max_by_region.min(max_by_budget);

        let new_limit = self
            .block_limit
            .saturating_add(wanted.div_ceil(self.block_size))
            .min(cap);
        if new_limit <= self.block_limit {
            return None;
        }
        self.block_limit = new_limit;
        Some((old_size, self.heap_size()))
    }

    // ── Object lookup ─────────────────────────────────────────────────

    /// Cheap range check: can `word` point into the heap at all.
    #[inline(always)]
    pub fn in_heap_range(&self, word: usize) -> bool {
        if self.in_block_region(word) {
            return true;
        }
        match self.large.bounds() {
            Some((low, high)) => word >= low && word < high,
            None => false,
        }
    }

    /// Whether `addr` lies in a committed block.
    pub fn in_block_region(&self, addr: usize) -> bool {
        let start = self.region_start();
        addr >= start && addr < start + self.blocks.len() * self.block_size
    }

    /// Whether `addr` lies in memory owned by the heap, allocated or not.
    pub fn contains(&self, addr: usize) -> bool {
        self.in_block_region(addr) || self.large.find(addr, true).is_some()
    }

    /// Resolves `word` to the allocated object it points to.
    pub fn lookup(&self, word: usize, interior: bool) -> Option<ObjectRef> {
        let start = self.region_start();
        if word >= start {
            let idx = (word - start) / self.block_size;
            if idx < self.blocks.len() {
                let block = &self.blocks[idx];
                return block
                    .slot_of(word, interior)
                    .map(|slot| ObjectRef::Small {
                        block: idx as u32,
                        slot,
                    });
            }
        }
        self.large
            .find(word, interior)
            .map(|id| ObjectRef::Large { id })
    }

    /// Start address and usable size of `obj`.
    pub fn object_range(&self, obj: ObjectRef) -> (usize, usize) {
        match obj {
            ObjectRef::Small { block, slot } => {
                let block = &self.blocks[block as usize];
                (block.slot_addr(slot), block.slot_size)
            }
            ObjectRef::Large { id } => self
                .large
                .get(id)
                .map_or((0, 0), |obj| (obj.start, obj.size)),
        }
    }

    pub fn is_atomic(&self, obj: ObjectRef) -> bool {
        match obj {
            ObjectRef::Small { block, .. } => {
                self.blocks[block as usize].is_atomic()
            }
            ObjectRef::Large { id } => {
                self.large.get(id).is_some_and(|obj| obj.atomic)
            }
        }
    }

    /// Sets the mark of `obj`, returns `true` if it was not marked yet.
    #[inline]
    pub fn mark(&mut self, obj: ObjectRef) -> bool {
        match obj {
            ObjectRef::Small { block, slot } => {
                self.blocks[block as usize].mark(slot)
            }
            ObjectRef::Large { id } => self.large.mark(id),
        }
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        match obj {
            ObjectRef::Small { block, slot } => {
                self.blocks[block as usize].is_marked(slot)
            }
            ObjectRef::Large { id } => {
                self.large.get(id).is_some_and(|obj| obj.marked)
            }
        }
    }

    /// Explicitly frees the object whose base address is `addr`. Returns
    /// the freed size, `None` if `addr` is not an allocated object base.
    pub fn free(&mut self, addr: usize) -> Option<usize> {
        let freed = match self.lookup(addr, false)? {
            ObjectRef::Small { block, slot } => {
                let blk = &mut self.blocks[block as usize];
                let was_full = blk.free_count == 0;
                if !blk.push_free(slot) {
                    return None;
                }
                if was_full {
                    let kind = if blk.is_atomic() {
                        ObjectKind::Atomic
                    } else {
                        ObjectKind::Normal
                    };
                    let class = blk.class;
                    self.partial[kind.index()][class].push(block);
                }
                self.blocks[block as usize].slot_size
            }
            ObjectRef::Large { .. } => self.large.free(addr)?,
        };
        self.counters.bytes_since_gc =
            self.counters.bytes_since_gc.saturating_sub(freed);
        Some(freed)
    }

    // ── Sweep support ─────────────────────────────────────────────────

    pub(crate) fn sweep_large(&mut self) -> LargeSweep {
        self.large.sweep()
    }

    /// Recomputes the partial lists from block state. Blocks are listed in
    /// descending index order so allocation fills low blocks first.
    pub(crate) fn rebuild_partial_lists(&mut self) {
        for lists in &mut self.partial {
            for list in lists.iter_mut() {
                list.clear();
            }
        }
        for block in self.blocks.iter().rev() {
            if block.in_use() && block.free_count > 0 {
                let kind = if block.is_atomic() {
                    ObjectKind::Atomic
                } else {
                    ObjectKind::Normal
                };
                self.partial[kind.index()][block.class].push(block.index);
            }
        }
        self.free_blocks.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Gives the pages of free block `idx` back to the OS.
    pub(crate) fn decommit_block(&mut self, idx: u32) -> bool {
        let block = &mut self.blocks[idx as usize];
        debug_assert!(!block.in_use());
        if block.flags.contains(BlockFlags::UNMAPPED) {
            return false;
        }
        let Some(ptr) = NonNull::new(block.start as *mut u8) else {
            return false;
        };
        if !system::decommit_memory(ptr, self.block_size) {
            return false;
        }
        block.flags.insert(BlockFlags::UNMAPPED);
        self.counters.unmapped_bytes += self.block_size;
        true
    }
}

impl Drop for HeapArena {
    fn drop(&mut self) {
        system::unmap_memory(self.region, self.region_size);
    }
}
