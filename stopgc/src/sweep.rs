use crate::{
    block::BlockFlags,
    heap::HeapArena,
    large::LargeSweep,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    /// Blocks that became completely free this cycle.
    pub released_blocks: usize,
    /// Free blocks whose pages went back to the OS this cycle.
    pub unmapped_blocks: usize,
    pub large: LargeSweep,
}

/// Returns unmarked slots to their blocks' free lists, releases empty
/// blocks and decommits blocks that stayed free for `unmap_threshold`
/// collections.
#[derive(Debug, Clone, Copy)]
pub struct Sweeper {
    pub unmap_threshold: u32,
}

impl Sweeper {
    pub fn sweep(&self, heap: &mut HeapArena) -> SweepReport {
        let mut report = SweepReport::default();

        for idx in 0..heap.blocks.len() {
            let block = &mut heap.blocks[idx];
            if !block.in_use() {
                if block.flags.contains(BlockFlags::UNMAPPED) {
                    continue;
                }
                block.idle_collections += 1;
                if self.unmap_threshold > 0
                    && block.idle_collections >= self.unmap_threshold
                    && heap.decommit_block(idx as u32)
                {
                    log::trace!("unmapped idle block {idx}");
                    report.unmapped_blocks += 1;
                }
                continue;
            }

            let slot_size = block.slot_size;
            let (live, freed) = block.sweep();
            report.live_objects += live;
            report.live_bytes += live * slot_size;
            report.freed_objects += freed;
            report.freed_bytes += freed * slot_size;

            if live == 0 {
                block.release();
                block.idle_collections = 0;
                heap.free_blocks.push(idx as u32);
                report.released_blocks += 1;
                log::trace!("released empty block {idx}");
            }
            if cfg!(debug_assertions) {
                heap.blocks[idx].verify();
            }
        }

        heap.rebuild_partial_lists();

        let large = heap.sweep_large();
        report.live_objects += large.live_objects;
        report.live_bytes += large.live_bytes;
        report.freed_objects += large.freed_objects;
        report.freed_bytes += large.freed_bytes;
        report.large = large;

        heap.counters.live_objects = report.live_objects;
        heap.counters.live_bytes = report.live_bytes;
        heap.counters.bytes_since_gc = 0;
        report
    }
}
