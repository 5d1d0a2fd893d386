//! Per-physical-zone block allocator.
//!
//! Selects slabs through a priority table keyed by free space, with a
//! bonus for slabs that have already served allocations so untouched
//! slabs keep headroom for future shares. Slabs drop out of the table
//! when full or not yet rebuilt and re-enter when scrubbing finishes or
//! a block frees up.

use crate::core::{CdsError, CdsResult, Pbn, SlabIndex, ZoneCount};
use crate::slab::Slab;
use crate::util::PriorityTable;

// ============================================================================
// Block Allocator
// ============================================================================

/// Allocator counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockAllocatorStats {
    pub allocations: u64,
    pub provisional_releases: u64,
    pub no_space_errors: u64,
    pub slabs_reprioritized: u64,
}

/// One zone's allocator.
pub struct BlockAllocator {
    zone: ZoneCount,
    table: PriorityTable<SlabIndex>,
    pub stats: BlockAllocatorStats,
}

impl BlockAllocator {
    /// Create an empty allocator for `zone`.
    pub fn new(zone: ZoneCount) -> Self {
        Self {
            zone,
            table: PriorityTable::new(63),
            stats: BlockAllocatorStats::default(),
        }
    }

    /// The zone this allocator serves.
    #[inline]
    pub fn zone(&self) -> ZoneCount {
        self.zone
    }

    /// Offer a slab for allocation; ignored unless it is rebuilt and has
    /// free space, or is already queued.
    pub fn register_slab(&mut self, slab: &mut Slab) {
        if slab.in_priority_table
            || !slab.state.is_open()
            || slab.ref_counts.free_count() == 0
        {
            return;
        }
        slab.in_priority_table = true;
        self.table.enqueue(slab.priority(), slab.index);
    }

    /// Allocate one block, provisionally referenced.
    pub fn allocate(&mut self, slabs: &mut [Slab]) -> CdsResult<Pbn> {
        while let Some(index) = self.table.dequeue() {
            let slab = &mut slabs[index as usize];
            slab.in_priority_table = false;
            if !slab.state.is_open() {
                continue;
            }
            let Some(sbn) = slab.ref_counts.allocate() else {
                continue;
            };
            slab.opened = true;
            let pbn = slab.pbn_of(sbn);
            if slab.ref_counts.free_count() > 0 {
                slab.in_priority_table = true;
                self.table.enqueue(slab.priority(), slab.index);
            }
            self.stats.allocations += 1;
            return Ok(pbn);
        }
        self.stats.no_space_errors += 1;
        Err(CdsError::NoSpace)
    }

    /// A block in `slab` was freed; make sure the slab is selectable
    /// again at its new priority.
    pub fn notify_space_available(&mut self, slab: &mut Slab) {
        if slab.in_priority_table {
            // Already queued; the priority drifts at the next cycle.
            return;
        }
        self.register_slab(slab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlabJournalThresholds;
    use crate::core::JournalPoint;
    use crate::slab::{RefCounts, RefOp, SlabGeometry, SlabJournal, SlabState};

    fn make_slab(index: SlabIndex, origin: Pbn, total: u64) -> Slab {
        let geometry = SlabGeometry::compute(total);
        Slab {
            index,
            origin,
            geometry,
            state: SlabState::Rebuilt,
            ref_counts: RefCounts::new(geometry.data_blocks),
            journal: SlabJournal::new(
                1,
                origin,
                geometry.journal_blocks,
                SlabJournalThresholds::for_journal_size(geometry.journal_blocks),
            ),
            opened: false,
            in_priority_table: false,
        }
    }

    #[test]
    fn test_allocates_from_registered_slab() {
        let mut slabs = [make_slab(0, 100, 64)];
        let mut allocator = BlockAllocator::new(0);
        allocator.register_slab(&mut slabs[0]);
        let pbn = allocator.allocate(&mut slabs).unwrap();
        assert!(pbn >= slabs[0].data_origin());
        assert!(slabs[0].opened);
    }

    #[test]
    fn test_no_space_when_empty() {
        let mut slabs: [Slab; 0] = [];
        let mut allocator = BlockAllocator::new(0);
        assert_eq!(allocator.allocate(&mut slabs), Err(CdsError::NoSpace));
        assert_eq!(allocator.stats.no_space_errors, 1);
    }

    #[test]
    fn test_open_slab_preferred_over_untouched() {
        let mut slabs = [make_slab(0, 100, 64), make_slab(1, 164, 64)];
        // Slab 0 has served an allocation already.
        slabs[0].ref_counts.allocate().unwrap();
        slabs[0].opened = true;

        let mut allocator = BlockAllocator::new(0);
        allocator.register_slab(&mut slabs[0]);
        allocator.register_slab(&mut slabs[1]);
        // Even though slab 1 has more free blocks, the opened slab wins.
        let pbn = allocator.allocate(&mut slabs).unwrap();
        assert!(pbn < 164);
    }

    #[test]
    fn test_unrecovered_slab_skipped() {
        let mut slabs = [make_slab(0, 100, 64), make_slab(1, 164, 64)];
        let mut allocator = BlockAllocator::new(0);
        allocator.register_slab(&mut slabs[0]);
        allocator.register_slab(&mut slabs[1]);
        slabs[0].state = SlabState::Unrecovered;
        // Both were queued; the unrecovered one is skipped at dequeue.
        for _ in 0..3 {
            let pbn = allocator.allocate(&mut slabs).unwrap();
            assert!(pbn >= 164, "allocated from an unrecovered slab");
        }
    }

    #[test]
    fn test_full_slab_reenters_after_free() {
        let mut slabs = [make_slab(0, 100, 16)];
        let data_blocks = slabs[0].geometry.data_blocks;
        let mut allocator = BlockAllocator::new(0);
        allocator.register_slab(&mut slabs[0]);
        for _ in 0..data_blocks {
            allocator.allocate(&mut slabs).unwrap();
        }
        assert_eq!(allocator.allocate(&mut slabs), Err(CdsError::NoSpace));

        // Confirm one reference and then drop it; the slab re-enters.
        slabs[0]
            .ref_counts
            .apply(0, RefOp::DataIncrement, JournalPoint::new(1, 0))
            .unwrap();
        slabs[0]
            .ref_counts
            .apply(0, RefOp::DataDecrement, JournalPoint::new(1, 1))
            .unwrap();
        allocator.notify_space_available(&mut slabs[0]);
        assert!(allocator.allocate(&mut slabs).is_ok());
    }
}
