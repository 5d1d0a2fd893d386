//! The slab depot: every slab, sharded across physical zones.
//!
//! The depot routes PBNs to slabs, owns the per-zone allocators and the
//! slab summary, and drives the reference-count change path: fence the
//! change against the recovery point, journal it in the slab journal,
//! apply it to the counters, and take the physical-zone lock on the
//! recovery-journal block until the slab journal commits.

use alloc::vec::Vec;

use crate::config::SlabJournalThresholds;
use crate::core::{
    BlockCount, CdsError, CdsResult, JournalPoint, Nonce, Pbn, SlabIndex, ZoneCount,
};
use crate::device::BlockDevice;
use crate::journal::{RecoveryJournal, ZoneType};
use crate::layout::Layout;
use crate::pipeline::Action;
use crate::slab::journal::SlabAppendOutcome;
use crate::slab::{
    BlockAllocator, RefCounts, RefOp, Slab, SlabGeometry, SlabJournal, SlabJournalEntry,
    SlabState, SlabSummary, SummaryEntry,
};

// ============================================================================
// Results
// ============================================================================

/// Outcome of a reference-count change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyOutcome {
    /// Journaled and applied (or fenced off as already applied)
    Applied,
    /// Slab journal at its blocking threshold; waiter parked
    Parked,
}

// ============================================================================
// Slab Depot
// ============================================================================

/// All slabs and their allocators.
pub struct SlabDepot {
    pub slabs: Vec<Slab>,
    pub allocators: Vec<BlockAllocator>,
    pub summary: SlabSummary,
    geometry: SlabGeometry,
    slab_origin: Pbn,
    slab_blocks: BlockCount,
    physical_zones: ZoneCount,
    thresholds: SlabJournalThresholds,
    nonce: Nonce,
}

impl SlabDepot {
    /// Build the depot for `layout` with every slab fresh and open.
    pub fn new(
        layout: &Layout,
        nonce: Nonce,
        thresholds: SlabJournalThresholds,
        physical_zones: ZoneCount,
    ) -> Self {
        let geometry = SlabGeometry::compute(layout.slab_blocks);
        let mut depot = Self {
            slabs: Vec::with_capacity(layout.slab_count as usize),
            allocators: (0..physical_zones).map(BlockAllocator::new).collect(),
            summary: SlabSummary::new(layout.summary_origin, layout.slab_count),
            geometry,
            slab_origin: layout.slab_origin,
            slab_blocks: layout.slab_blocks,
            physical_zones,
            thresholds,
            nonce,
        };
        for index in 0..layout.slab_count {
            depot.push_slab(index);
            depot.register(index);
        }
        depot
    }

    fn push_slab(&mut self, index: SlabIndex) {
        let origin = self.slab_origin + index as u64 * self.slab_blocks;
        self.slabs.push(Slab {
            index,
            origin,
            geometry: self.geometry,
            state: SlabState::Rebuilt,
            ref_counts: RefCounts::new(self.geometry.data_blocks),
            journal: SlabJournal::new(
                self.nonce,
                origin,
                self.geometry.journal_blocks,
                self.thresholds,
            ),
            opened: false,
            in_priority_table: false,
        });
    }

    fn register(&mut self, index: SlabIndex) {
        let zone = self.zone_of(index) as usize;
        let (allocators, slabs) = (&mut self.allocators, &mut self.slabs);
        allocators[zone].register_slab(&mut slabs[index as usize]);
    }

    /// Which physical zone owns slab `index`.
    #[inline]
    pub fn zone_of(&self, index: SlabIndex) -> ZoneCount {
        (index % self.physical_zones as u32) as ZoneCount
    }

    /// Number of slabs.
    #[inline]
    pub fn slab_count(&self) -> SlabIndex {
        self.slabs.len() as SlabIndex
    }

    /// Total free data blocks.
    pub fn free_blocks(&self) -> BlockCount {
        self.slabs.iter().map(|s| s.ref_counts.free_count()).sum()
    }

    /// The slab holding `pbn`.
    pub fn slab_for_pbn(&self, pbn: Pbn) -> CdsResult<SlabIndex> {
        if pbn < self.slab_origin {
            return Err(CdsError::OutOfRange);
        }
        let index = ((pbn - self.slab_origin) / self.slab_blocks) as SlabIndex;
        if index >= self.slab_count() {
            return Err(CdsError::OutOfRange);
        }
        Ok(index)
    }

    /// Allocate a provisionally referenced block in `zone`.
    pub fn allocate(&mut self, zone: ZoneCount) -> CdsResult<Pbn> {
        let (allocators, slabs) = (&mut self.allocators, &mut self.slabs);
        allocators[zone as usize].allocate(slabs)
    }

    /// Return an unconfirmed provisional reference.
    pub fn release_provisional(&mut self, pbn: Pbn) -> CdsResult<()> {
        let index = self.slab_for_pbn(pbn)?;
        let zone = self.zone_of(index) as usize;
        let (allocators, slabs) = (&mut self.allocators, &mut self.slabs);
        let slab = &mut slabs[index as usize];
        let sbn = slab.sbn_of(pbn)?;
        slab.ref_counts.release_provisional(sbn);
        allocators[zone].stats.provisional_releases += 1;
        allocators[zone].notify_space_available(slab);
        Ok(())
    }

    /// Is `pbn` able to take another shared reference?
    pub fn is_shareable(&self, pbn: Pbn) -> bool {
        let Ok(index) = self.slab_for_pbn(pbn) else {
            return false;
        };
        let slab = &self.slabs[index as usize];
        let Ok(sbn) = slab.sbn_of(pbn) else {
            return false;
        };
        slab.state.is_open() && slab.ref_counts.is_shareable(sbn)
    }

    /// Reference count of `pbn` (tests and verification).
    pub fn reference_count(&self, pbn: Pbn) -> CdsResult<u8> {
        let index = self.slab_for_pbn(pbn)?;
        let slab = &self.slabs[index as usize];
        Ok(slab.ref_counts.count(slab.sbn_of(pbn)?))
    }

    /// Apply one reference change authorized by `recovery_point`,
    /// journaling it first. Idempotent against replayed recovery points.
    pub fn modify(
        &mut self,
        pbn: Pbn,
        op: RefOp,
        recovery_point: JournalPoint,
        waiter: Action,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<ModifyOutcome> {
        let index = self.slab_for_pbn(pbn)?;
        let zone = self.zone_of(index);
        let (allocators, slabs) = (&mut self.allocators, &mut self.slabs);
        let slab = &mut slabs[index as usize];
        let sbn = slab.sbn_of(pbn)?;

        // Replay safety: skip changes the slab journal already holds.
        if recovery_point.is_valid() && !recovery_point.is_after(&slab.journal.recovery_fence()) {
            return Ok(ModifyOutcome::Applied);
        }

        let entry = SlabJournalEntry {
            sbn,
            op,
            recovery_point,
        };
        let point = match slab.journal.append(entry, waiter) {
            SlabAppendOutcome::Appended(point) => point,
            SlabAppendOutcome::Parked => return Ok(ModifyOutcome::Parked),
        };
        if recovery_point.is_valid() {
            recovery_journal.acquire_lock(ZoneType::Physical, zone, recovery_point.sequence);
        }
        slab.ref_counts.apply(sbn, op, point)?;

        if !op.is_increment() && slab.ref_counts.count(sbn) == 0 {
            allocators[zone as usize].notify_space_available(slab);
        }
        Ok(ModifyOutcome::Applied)
    }

    /// Push out slab journals that have reached their thresholds, write
    /// the counter blocks they cover, and reap. Returns waiters to
    /// re-enqueue.
    pub fn flush_journals(
        &mut self,
        device: &dyn BlockDevice,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<Vec<Action>> {
        let mut woken = Vec::new();
        for index in 0..self.slabs.len() {
            let journal = &self.slabs[index].journal;
            if !journal.wants_flush() && journal.depth() < self.thresholds.flushing {
                continue;
            }
            woken.extend(self.commit_slab(index, device, recovery_journal)?);
        }
        Ok(woken)
    }

    fn commit_slab(
        &mut self,
        index: usize,
        device: &dyn BlockDevice,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<Vec<Action>> {
        let zone = self.zone_of(index as SlabIndex);
        let mut woken = Vec::new();

        // First write of a journal block dirties the summary before any
        // entry can become durable.
        if self.slabs[index].journal.has_pending_entries()
            && self.summary.entry(index as SlabIndex).is_clean
        {
            let slab = &self.slabs[index];
            let hint = SummaryEntry::hint_for(
                slab.ref_counts.free_count(),
                slab.geometry.data_blocks,
            );
            self.summary.update(
                index as SlabIndex,
                SummaryEntry {
                    is_clean: false,
                    fullness_hint: hint,
                },
            );
            self.summary.save(device)?;
            device.flush()?;
        }

        let slab = &mut self.slabs[index];
        let released = slab.journal.commit(device)?;
        for sequence in released {
            woken.extend(recovery_journal.release_lock(ZoneType::Physical, zone, sequence));
        }
        // Once the journal is deep enough, persist the counters it covers
        // and reclaim its space.
        if slab.journal.depth() >= self.thresholds.flushing {
            let ref_origin = slab.ref_origin();
            slab.ref_counts.save_dirty(device, ref_origin)?;
            device.flush()?;
            woken.extend(slab.journal.reap());
        }
        Ok(woken)
    }

    /// Force every slab journal out and reap, regardless of thresholds.
    /// Used when recovery-journal space waiters are otherwise stuck
    /// behind physical-zone locks.
    pub fn flush_all_journals(
        &mut self,
        device: &dyn BlockDevice,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<Vec<Action>> {
        let mut woken = Vec::new();
        for index in 0..self.slabs.len() {
            let journal = &self.slabs[index].journal;
            if !journal.has_pending_entries() && journal.depth() == 0 {
                continue;
            }
            woken.extend(self.force_flush_slab(
                index as SlabIndex,
                device,
                recovery_journal,
            )?);
        }
        Ok(woken)
    }

    /// Commit one slab's journal, persist its counters, and reap,
    /// regardless of thresholds. Used by replay to clear blocking
    /// back-pressure.
    pub fn force_flush_slab(
        &mut self,
        index: SlabIndex,
        device: &dyn BlockDevice,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<Vec<Action>> {
        let mut woken = self.commit_slab(index as usize, device, recovery_journal)?;
        let slab = &mut self.slabs[index as usize];
        let ref_origin = slab.ref_origin();
        slab.ref_counts.save_dirty(device, ref_origin)?;
        device.flush()?;
        woken.extend(slab.journal.reap());
        Ok(woken)
    }

    /// Quiesce every slab: commit journals, persist counters, reap, and
    /// mark the summary clean.
    pub fn drain(
        &mut self,
        device: &dyn BlockDevice,
        recovery_journal: &mut RecoveryJournal,
    ) -> CdsResult<Vec<Action>> {
        let mut woken = Vec::new();
        for index in 0..self.slabs.len() {
            let zone = self.zone_of(index as SlabIndex);
            let slab = &mut self.slabs[index];
            let released = slab.journal.commit(device)?;
            for sequence in released {
                woken.extend(recovery_journal.release_lock(ZoneType::Physical, zone, sequence));
            }
            let ref_origin = slab.ref_origin();
            slab.ref_counts.save_dirty(device, ref_origin)?;
            woken.extend(slab.journal.reap());
            let hint =
                SummaryEntry::hint_for(slab.ref_counts.free_count(), slab.geometry.data_blocks);
            self.summary.update(
                index as SlabIndex,
                SummaryEntry {
                    is_clean: true,
                    fullness_hint: hint,
                },
            );
        }
        self.summary.save(device)?;
        device.flush()?;
        Ok(woken)
    }

    /// Bring the depot online from disk. Cleanly closed slabs load their
    /// counters directly; the rest are left `Unrecovered` for the
    /// scrubber.
    pub fn load(&mut self, device: &dyn BlockDevice) -> CdsResult<Vec<SlabIndex>> {
        self.summary.load(device)?;
        let mut unrecovered = Vec::new();
        for index in 0..self.slabs.len() {
            let slab = &mut self.slabs[index];
            // Restore the journal window and recovery fence; the tail
            // keeps increasing across restarts.
            slab.journal.scan(device)?;
            if self.summary.entry(index as SlabIndex).is_clean {
                slab.ref_counts.load(device, slab.ref_origin())?;
                slab.journal.reap();
                slab.state = SlabState::Rebuilt;
                self.register(index as SlabIndex);
            } else {
                slab.state = SlabState::Unrecovered;
                unrecovered.push(index as SlabIndex);
            }
        }
        Ok(unrecovered)
    }

    /// Add `additional` slabs (physical grow).
    pub fn grow(&mut self, additional: SlabIndex) -> CdsResult<()> {
        let first = self.slab_count();
        if first + additional > crate::layout::MAX_SLABS {
            return Err(CdsError::BadConfiguration);
        }
        self.summary.extend_to(first + additional);
        for index in first..first + additional {
            self.push_slab(index);
            self.register(index);
        }
        log::info!("depot: grew from {first} to {} slabs", self.slab_count());
        Ok(())
    }
}
