//! Slab scrubbing: reconstructing reference counts after a crash.
//!
//! The scrubber works through unrecovered slabs in priority order,
//! deepest journal first, with a high-priority queue for slabs whose
//! journal depth crossed the scrubbing threshold. For each slab it reads
//! the on-disk counters, reclaims stranded provisional references,
//! replays the slab journal into the counters (idempotently, fenced by
//! the per-block journal points), writes the rebuilt counters back, and
//! opens the slab.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;

use crate::core::{BlockCount, CdsError, CdsResult, JournalPoint, SlabIndex};
use crate::device::BlockDevice;
use crate::slab::{SlabDepot, SlabState, SummaryEntry};

// ============================================================================
// Scrub Queue
// ============================================================================

/// Queue entry ordered by journal depth (deepest first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScrubCandidate {
    depth: BlockCount,
    index: SlabIndex,
}

impl Ord for ScrubCandidate {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.depth
            .cmp(&other.depth)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for ScrubCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Scrubber counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScrubberStats {
    pub slabs_scrubbed: u64,
    pub entries_replayed: u64,
    pub provisionals_reclaimed: u64,
}

// ============================================================================
// Scrubber
// ============================================================================

/// Works through unrecovered slabs.
pub struct Scrubber {
    high_priority: BinaryHeap<ScrubCandidate>,
    regular: BinaryHeap<ScrubCandidate>,
    pub stats: ScrubberStats,
}

impl Scrubber {
    /// Empty scrubber.
    pub fn new() -> Self {
        Self {
            high_priority: BinaryHeap::new(),
            regular: BinaryHeap::new(),
            stats: ScrubberStats::default(),
        }
    }

    /// Queue an unrecovered slab. Slabs past the scrubbing threshold go
    /// to the high-priority queue.
    pub fn register(&mut self, depot: &SlabDepot, index: SlabIndex) {
        let slab = &depot.slabs[index as usize];
        debug_assert_eq!(slab.state, SlabState::Unrecovered);
        let candidate = ScrubCandidate {
            depth: slab.journal.depth(),
            index,
        };
        if slab.journal.demands_scrubbing() {
            self.high_priority.push(candidate);
        } else {
            self.regular.push(candidate);
        }
    }

    /// Anything left to scrub?
    pub fn has_work(&self) -> bool {
        !self.high_priority.is_empty() || !self.regular.is_empty()
    }

    /// Scrub every queued slab; the high-priority queue preempts the
    /// regular queue.
    pub fn scrub_all(
        &mut self,
        depot: &mut SlabDepot,
        device: &dyn BlockDevice,
    ) -> CdsResult<()> {
        while let Some(candidate) = self
            .high_priority
            .pop()
            .or_else(|| self.regular.pop())
        {
            self.scrub_slab(depot, candidate.index, device)?;
        }
        Ok(())
    }

    /// Rebuild one slab's counters from its journal.
    fn scrub_slab(
        &mut self,
        depot: &mut SlabDepot,
        index: SlabIndex,
        device: &dyn BlockDevice,
    ) -> CdsResult<()> {
        let slab = &mut depot.slabs[index as usize];
        slab.state = SlabState::Replaying;
        let blocks = slab.journal.scan(device)?;

        slab.state = SlabState::RequiresScrubbing;
        slab.ref_counts.load(device, slab.ref_origin())?;
        self.stats.provisionals_reclaimed += slab.ref_counts.reclaim_provisionals();

        slab.state = SlabState::Rebuilding;
        let data_blocks = slab.geometry.data_blocks;
        for block in &blocks {
            for (entry_index, entry) in block.entries.iter().enumerate() {
                if entry.sbn as u64 >= data_blocks {
                    log::error!(
                        "scrubber: slab {index} journal block {} names out-of-range sbn {}",
                        block.sequence,
                        entry.sbn
                    );
                    return Err(CdsError::CorruptJournal);
                }
                let point = JournalPoint::new(block.sequence, entry_index as u16);
                if slab.ref_counts.apply(entry.sbn, entry.op, point)? {
                    self.stats.entries_replayed += 1;
                }
            }
        }

        let ref_origin = slab.ref_origin();
        slab.ref_counts.save_all(device, ref_origin)?;
        device.flush()?;
        slab.journal.reap();
        slab.state = SlabState::Rebuilt;
        let hint = SummaryEntry::hint_for(slab.ref_counts.free_count(), data_blocks);
        depot.summary.update(
            index,
            SummaryEntry {
                is_clean: true,
                fullness_hint: hint,
            },
        );
        depot.summary.save(device)?;

        let zone = depot.zone_of(index) as usize;
        let (allocators, slabs) = (&mut depot.allocators, &mut depot.slabs);
        allocators[zone].register_slab(&mut slabs[index as usize]);
        self.stats.slabs_scrubbed += 1;
        log::info!("scrubber: slab {index} rebuilt, {} entries replayed", self.stats.entries_replayed);
        Ok(())
    }
}

impl Default for Scrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CondenseConfig, SlabJournalThresholds};
    use crate::core::VioId;
    use crate::device::RamDevice;
    use crate::journal::RecoveryJournal;
    use crate::layout::Layout;
    use crate::pipeline::{Action, Op};
    use crate::slab::RefOp;

    fn setup() -> (RamDevice, SlabDepot, RecoveryJournal) {
        let config = CondenseConfig {
            logical_blocks: 256,
            slab_bits: 6,
            journal_blocks: 8,
            tail_buffers: 2,
            cache_pages: 8,
            block_map_roots: 2,
            ..CondenseConfig::default()
        };
        let device = RamDevice::new(1024);
        let layout = Layout::compute(&config, 1024).unwrap();
        let thresholds = SlabJournalThresholds {
            flushing: 1,
            blocking: 2,
            scrubbing: 1,
        };
        let depot = SlabDepot::new(&layout, 7, thresholds, 1);
        let journal = RecoveryJournal::new(7, layout.journal_origin, 8, 4, 1, 1, 1);
        (device, depot, journal)
    }

    fn waiter() -> Action {
        Action::new(VioId(1), Op::JournalIncrement)
    }

    #[test]
    fn test_scrub_rebuilds_refcounts_after_crash() {
        let (device, mut depot, mut journal) = setup();
        // Two allocations, one shared twice, one later dropped.
        let a = depot.allocate(0).unwrap();
        let b = depot.allocate(0).unwrap();
        for (pbn, op, point) in [
            (a, RefOp::DataIncrement, JournalPoint::new(1, 0)),
            (a, RefOp::DataIncrement, JournalPoint::new(1, 1)),
            (b, RefOp::DataIncrement, JournalPoint::new(1, 2)),
            (b, RefOp::DataDecrement, JournalPoint::new(2, 0)),
        ] {
            depot.modify(pbn, op, point, waiter(), &mut journal).unwrap();
        }
        // The journal reaches disk; the counters do not.
        let index = depot.slab_for_pbn(a).unwrap() as usize;
        depot.slabs[index].journal.commit(&device).unwrap();
        device.flush().unwrap();

        // Crash: rebuild the depot from disk.
        let (_, mut fresh_depot, _) = setup();
        let unrecovered = fresh_depot.load(&device).unwrap();
        assert!(unrecovered.contains(&(index as SlabIndex)));
        assert_eq!(fresh_depot.slabs[index].state, SlabState::Unrecovered);

        let mut scrubber = Scrubber::new();
        for slab in unrecovered {
            scrubber.register(&fresh_depot, slab);
        }
        scrubber.scrub_all(&mut fresh_depot, &device).unwrap();

        assert_eq!(fresh_depot.slabs[index].state, SlabState::Rebuilt);
        assert_eq!(fresh_depot.reference_count(a).unwrap(), 2);
        assert_eq!(fresh_depot.reference_count(b).unwrap(), 0);
        assert_eq!(scrubber.stats.entries_replayed, 4);
    }

    #[test]
    fn test_scrub_rejects_out_of_range_sbn() {
        let (device, mut depot, mut journal) = setup();
        let a = depot.allocate(0).unwrap();
        depot
            .modify(a, RefOp::DataIncrement, JournalPoint::new(1, 0), waiter(), &mut journal)
            .unwrap();
        // Corrupt the entry's sbn directly in the tail block.
        let index = depot.slab_for_pbn(a).unwrap() as usize;
        depot.slabs[index].journal.commit(&device).unwrap();
        // Sequence 1 of a two-block journal lives in slot 1.
        let journal_pbn = depot.slabs[index].origin + 1;
        let mut block = device.durable_block(journal_pbn);
        // Overwrite the first entry's sbn field, just past the header.
        block[32..36].copy_from_slice(&u32::MAX.to_le_bytes());
        device.write_block(journal_pbn, &block, true).unwrap();

        let (_, mut fresh_depot, _) = setup();
        let unrecovered = fresh_depot.load(&device).unwrap();
        let mut scrubber = Scrubber::new();
        for slab in unrecovered {
            scrubber.register(&fresh_depot, slab);
        }
        assert_eq!(
            scrubber.scrub_all(&mut fresh_depot, &device),
            Err(CdsError::CorruptJournal)
        );
    }

    #[test]
    fn test_scrub_is_idempotent_against_applied_prefix() {
        let (device, mut depot, mut journal) = setup();
        let a = depot.allocate(0).unwrap();
        depot
            .modify(a, RefOp::DataIncrement, JournalPoint::new(1, 0), waiter(), &mut journal)
            .unwrap();
        let index = depot.slab_for_pbn(a).unwrap() as usize;
        depot.slabs[index].journal.commit(&device).unwrap();
        // Counters were also written (the journal was applied once).
        let ref_origin = depot.slabs[index].ref_origin();
        depot.slabs[index]
            .ref_counts
            .save_dirty(&device, ref_origin)
            .unwrap();
        device.flush().unwrap();

        // Crash and scrub: the already-applied entry must not double.
        let (_, mut fresh_depot, _) = setup();
        let unrecovered = fresh_depot.load(&device).unwrap();
        let mut scrubber = Scrubber::new();
        for slab in unrecovered {
            scrubber.register(&fresh_depot, slab);
        }
        scrubber.scrub_all(&mut fresh_depot, &device).unwrap();
        assert_eq!(fresh_depot.reference_count(a).unwrap(), 1);
        assert_eq!(scrubber.stats.entries_replayed, 0);
    }
}
