use std::{ptr::NonNull, time::Duration};

use crate::{heap::ObjectKind, mark::MarkStats, sweep::SweepReport, world::StopReport};

/// Consistent snapshot of collector state, taken under the heap lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub heap_size: usize,
    pub free_bytes: usize,
    pub unmapped_bytes: usize,
    pub bytes_since_gc: usize,
    /// Bytes allocated over the collector's lifetime.
    pub total_bytes: usize,
    /// Live bytes and objects found by the last collection.
    pub live_bytes: usize,
    pub live_objects: usize,
    pub collections: u64,
    pub threads: usize,
    pub roots: usize,
    pub blocks_in_use: usize,
    pub large_objects: usize,
    pub last_pause: Duration,
    pub total_pause: Duration,
}

/// Passed to the allocation hook for every successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocEvent {
    pub tag: u32,
    pub addr: NonNull<u8>,
    pub size: usize,
    pub kind: ObjectKind,
}

/// Profiling hook, called after each allocation outside the heap lock.
pub type AllocHook = Box<dyn Fn(&AllocEvent) + Send + Sync>;
/// Called with the old and new heap size after the heap grew.
pub type HeapResizeHook = Box<dyn Fn(usize, usize) + Send + Sync>;
/// Called with the request size before an allocation reports
/// out-of-memory.
pub type OomHook = Box<dyn Fn(usize) + Send + Sync>;

/// One collection cycle, as logged after the world restarted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    pub stop: StopReport,
    pub mark: MarkStats,
    pub sweep: SweepReport,
    /// Time the world was stopped.
    pub pause: Duration,
    pub heap_size: usize,
}
