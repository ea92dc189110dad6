//! Conservative marking.
//!
//! Every word of every root range and stopped stack is a candidate. The
//! [`PointerFinder`] decides which candidates name heap objects; the rest
//! of the marker is independent of how that decision is made.

use std::fmt::Debug;

use crate::{
    heap::{HeapArena, ObjectRef},
    size_class::GRANULE,
};

const WORD: usize = size_of::<usize>();

/// Decides which words are references.
pub trait PointerFinder: Send + Sync + Debug {
    /// Cheap pre-filter. A `false` answer must be final.
    fn might_be_pointer(&self, heap: &HeapArena, word: usize) -> bool;

    /// The allocated object `word` refers to, if any.
    fn resolve(&self, heap: &HeapArena, word: usize) -> Option<ObjectRef>;
}

/// Treats any word that lands inside an allocated object as a reference.
#[derive(Debug, Clone, Copy)]
pub struct Conservative {
    /// Accept pointers into the middle of an object, not only its base.
    pub interior_pointers: bool,
}

impl PointerFinder for Conservative {
    #[inline(always)]
    fn might_be_pointer(&self, heap: &HeapArena, word: usize) -> bool {
        if !self.interior_pointers && word % GRANULE != 0 {
            return false;
        }
        heap.in_heap_range(word)
    }

    #[inline]
    fn resolve(&self, heap: &HeapArena, word: usize) -> Option<ObjectRef> {
        heap.lookup(word, self.interior_pointers)
    }
}

// ── Mark stack ────────────────────────────────────────────────────────

/// Work list of marked objects whose contents are not scanned yet.
///
/// The storage is allocated once. A push onto a full stack drops the entry
/// and records the overflow; [`Marker::finish`] recovers by rescanning.
#[derive(Debug)]
pub struct MarkStack {
    entries: Vec<ObjectRef>,
    limit: usize,
    overflowed: bool,
}

impl MarkStack {
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            entries: Vec::with_capacity(limit),
            limit,
            overflowed: false,
        }
    }

    #[inline(always)]
    fn push(&mut self, obj: ObjectRef) {
        if self.entries.len() < self.limit {
            self.entries.push(obj);
        } else {
            self.overflowed = true;
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> Option<ObjectRef> {
        self.entries.pop()
    }

    fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    pub marked_objects: usize,
    pub marked_bytes: usize,
    pub scanned_words: usize,
    pub overflows: u32,
}

// ── Marker ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Marker<'a> {
    heap: &'a mut HeapArena,
    finder: &'a dyn PointerFinder,
    stack: &'a mut MarkStack,
    stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub fn new(
        heap: &'a mut HeapArena,
        finder: &'a dyn PointerFinder,
        stack: &'a mut MarkStack,
    ) -> Self {
        debug_assert!(stack.is_empty());
        stack.overflowed = false;
        Self {
            heap,
            finder,
            stack,
            stats: MarkStats::default(),
        }
    }

    /// Scans every aligned word in `[start, end)`.
    ///
    /// # Safety
    /// The range must be readable for the duration of the call.
    pub unsafe fn scan_range(&mut self, start: usize, end: usize) {
        let mut addr = start.next_multiple_of(WORD);
        let end = end & !(WORD - 1);
        while addr < end {
            // SAFETY: addr is aligned and inside the readable range
            let word = unsafe { (addr as *const usize).read_volatile() };
            self.consider(word);
            addr += WORD;
        }
    }

    pub fn scan_words(&mut self, words: &[usize]) {
        for &word in words {
            self.consider(word);
        }
    }

    #[inline]
    fn consider(&mut self, word: usize) {
        self.stats.scanned_words += 1;
        if !self.finder.might_be_pointer(self.heap, word) {
            return;
        }
        let Some(obj) = self.finder.resolve(self.heap, word) else {
            return;
        };
        if !self.heap.mark(obj) {
            return;
        }
        self.stats.marked_objects += 1;
        self.stats.marked_bytes += self.heap.object_range(obj).1;
        if !self.heap.is_atomic(obj) {
            self.stack.push(obj);
        }
    }

    fn scan_object(&mut self, obj: ObjectRef) {
        let (start, len) = self.heap.object_range(obj);
        // SAFETY: allocated objects are mapped for their full size
        unsafe { self.scan_range(start, start + len) };
    }

    /// Scans queued objects until the stack is empty.
    pub fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            self.scan_object(obj);
        }
    }

    /// Completes the transitive closure and returns the statistics.
    pub fn finish(mut self) -> MarkStats {
        self.drain();
        while self.stack.take_overflow() {
            self.stats.overflows += 1;
            self.rescan_marked();
        }
        self.stats
    }

    /// Rescans every marked pointer-carrying object. Objects whose push was
    /// dropped are marked, so their children are found this way.
    fn rescan_marked(&mut self) {
        for idx in 0..self.heap.blocks.len() {
            let block = &self.heap.blocks[idx];
            if !block.in_use() || block.is_atomic() {
                continue;
            }
            for slot in 0..block.slot_count {
                if self.heap.blocks[idx].is_marked(slot) {
                    self.scan_object(ObjectRef::Small {
                        block: idx as u32,
                        slot,
                    });
                    self.drain();
                }
            }
        }
        for id in 0..self.heap.large.id_bound() {
            let scannable = self
                .heap
                .large
                .get(id)
                .is_some_and(|obj| obj.marked && !obj.atomic);
            if scannable {
                self.scan_object(ObjectRef::Large { id });
                self.drain();
            }
        }
    }
}
