//! Per-journal-block multi-zone lock counter.
//!
//! Every on-disk journal block has a zero-or-positive count per logical
//! zone, per physical zone, and one journal-zone count. A block may only
//! be reaped once every count is zero. Transitions of a per-zone counter
//! between zero and one adjust a per-block count of holding zones; the
//! one-shot notification fires exactly when that count returns to zero.
//! This replaces a cross-zone lock graph that would otherwise deadlock.

use alloc::vec;
use alloc::vec::Vec;

use crate::core::{SequenceNumber, ZoneCount};

// ============================================================================
// Zone Selector
// ============================================================================

/// Which counter family a lock belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneType {
    /// A logical zone (block-map pages protecting entries)
    Logical,
    /// A physical zone (slab journals carrying entries)
    Physical,
    /// The journal zone itself (open blocks and unapplied entries)
    Journal,
}

// ============================================================================
// Lock Counter
// ============================================================================

/// Counters for a journal of `blocks` on-disk blocks.
pub struct LockCounter {
    blocks: usize,
    logical_zones: usize,
    physical_zones: usize,
    /// blocks x logical_zones
    logical: Vec<u32>,
    /// blocks x physical_zones
    physical: Vec<u32>,
    /// blocks
    journal: Vec<u32>,
    /// Zones currently holding each block
    zones_holding: Vec<u32>,
}

impl LockCounter {
    /// Create counters, all zero.
    pub fn new(blocks: usize, logical_zones: ZoneCount, physical_zones: ZoneCount) -> Self {
        Self {
            blocks,
            logical_zones: logical_zones as usize,
            physical_zones: physical_zones as usize,
            logical: vec![0; blocks * logical_zones as usize],
            physical: vec![0; blocks * physical_zones as usize],
            journal: vec![0; blocks],
            zones_holding: vec![0; blocks],
        }
    }

    #[inline]
    fn block_of(&self, sequence: SequenceNumber) -> usize {
        (sequence % self.blocks as u64) as usize
    }

    fn slot(&mut self, zone_type: ZoneType, zone: ZoneCount, block: usize) -> &mut u32 {
        match zone_type {
            ZoneType::Logical => {
                debug_assert!((zone as usize) < self.logical_zones);
                &mut self.logical[block * self.logical_zones + zone as usize]
            }
            ZoneType::Physical => {
                debug_assert!((zone as usize) < self.physical_zones);
                &mut self.physical[block * self.physical_zones + zone as usize]
            }
            ZoneType::Journal => &mut self.journal[block],
        }
    }

    /// Take a reference on the block holding `sequence`.
    pub fn acquire(&mut self, zone_type: ZoneType, zone: ZoneCount, sequence: SequenceNumber) {
        let block = self.block_of(sequence);
        let count = self.slot(zone_type, zone, block);
        *count += 1;
        if *count == 1 {
            self.zones_holding[block] += 1;
        }
    }

    /// Drop a reference. Returns true exactly when the block became fully
    /// unlocked (the one-shot notification).
    pub fn release(
        &mut self,
        zone_type: ZoneType,
        zone: ZoneCount,
        sequence: SequenceNumber,
    ) -> bool {
        let block = self.block_of(sequence);
        let count = self.slot(zone_type, zone, block);
        debug_assert!(*count > 0, "lock counter underflow");
        *count -= 1;
        if *count == 0 {
            self.zones_holding[block] -= 1;
            return self.zones_holding[block] == 0;
        }
        false
    }

    /// May the block holding `sequence` be reaped?
    #[inline]
    pub fn is_unlocked(&self, sequence: SequenceNumber) -> bool {
        self.zones_holding[(sequence % self.blocks as u64) as usize] == 0
    }

    /// Configured logical zone fan-out.
    #[inline]
    pub fn logical_zones(&self) -> usize {
        self.logical_zones
    }

    /// Configured physical zone fan-out.
    #[inline]
    pub fn physical_zones(&self) -> usize {
        self.physical_zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_zone_lock_cycle() {
        let mut lc = LockCounter::new(8, 1, 1);
        assert!(lc.is_unlocked(5));
        lc.acquire(ZoneType::Journal, 0, 5);
        assert!(!lc.is_unlocked(5));
        assert!(lc.release(ZoneType::Journal, 0, 5));
        assert!(lc.is_unlocked(5));
    }

    #[test]
    fn test_notification_fires_once_all_zones_release() {
        let mut lc = LockCounter::new(8, 2, 1);
        lc.acquire(ZoneType::Logical, 0, 3);
        lc.acquire(ZoneType::Logical, 1, 3);
        lc.acquire(ZoneType::Physical, 0, 3);
        // Nested acquires in one zone count as one holding zone.
        lc.acquire(ZoneType::Logical, 0, 3);

        assert!(!lc.release(ZoneType::Logical, 0, 3));
        assert!(!lc.release(ZoneType::Logical, 0, 3));
        assert!(!lc.release(ZoneType::Physical, 0, 3));
        assert!(lc.release(ZoneType::Logical, 1, 3));
        assert!(lc.is_unlocked(3));
    }

    #[test]
    fn test_sequences_map_to_blocks_mod_size() {
        let mut lc = LockCounter::new(8, 1, 1);
        lc.acquire(ZoneType::Journal, 0, 2);
        // Sequence 10 shares block 2's counters in an 8-block journal.
        assert!(!lc.is_unlocked(10));
        lc.release(ZoneType::Journal, 0, 10);
        assert!(lc.is_unlocked(2));
    }
}
