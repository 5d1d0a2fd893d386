//! Per-slab reference counters.
//!
//! One byte per data block: 0 free, 1..=254 shared, 255 provisional. A
//! provisional reference reserves a block for an in-flight write; it
//! confirms to 1 on the first journaled increment or returns to free if
//! the write never completes. Counters persist in reference-count blocks
//! whose header records the slab-journal point of the last change applied,
//! making journal replay idempotent per block.

use alloc::vec;
use alloc::vec::Vec;

use crate::core::{BlockCount, CdsError, CdsResult, JournalPoint, Pbn, SlabBlockNumber};
use crate::device::BlockDevice;
use crate::slab::RefOp;
use crate::BLOCK_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Counter value marking a provisional reference.
pub const PROVISIONAL: u8 = 255;

/// Largest confirmed reference count.
pub const MAX_REFS: u8 = 254;

/// Reference-count block header: slab-journal point of the last applied
/// change (sequence u64 + entry u16 + padding).
pub const REF_BLOCK_HEADER_SIZE: usize = 16;

/// Counters per reference-count block.
pub const COUNTS_PER_REF_BLOCK: usize = BLOCK_SIZE - REF_BLOCK_HEADER_SIZE;

// ============================================================================
// Ref Counts
// ============================================================================

/// Counter statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefCountStats {
    pub increments: u64,
    pub decrements: u64,
    pub provisional_grants: u64,
    pub provisional_releases: u64,
}

/// In-memory reference counters for one slab.
pub struct RefCounts {
    counts: Vec<u8>,
    /// Per ref block: slab-journal point of the last applied change
    block_points: Vec<JournalPoint>,
    /// Per ref block: modified since last write-out
    dirty: Vec<bool>,
    free_count: BlockCount,
    search_hint: usize,
    pub stats: RefCountStats,
}

impl RefCounts {
    /// All-free counters for `data_blocks` blocks.
    pub fn new(data_blocks: BlockCount) -> Self {
        let blocks = (data_blocks as usize).div_ceil(COUNTS_PER_REF_BLOCK);
        Self {
            counts: vec![0; data_blocks as usize],
            block_points: vec![JournalPoint::zero(); blocks],
            dirty: vec![false; blocks],
            free_count: data_blocks,
            search_hint: 0,
            stats: RefCountStats::default(),
        }
    }

    /// Free data blocks.
    #[inline]
    pub fn free_count(&self) -> BlockCount {
        self.free_count
    }

    /// Current counter for `sbn`.
    #[inline]
    pub fn count(&self, sbn: SlabBlockNumber) -> u8 {
        self.counts[sbn as usize]
    }

    /// May another reference be added to `sbn`?
    #[inline]
    pub fn is_shareable(&self, sbn: SlabBlockNumber) -> bool {
        let count = self.counts[sbn as usize];
        count >= 1 && count < MAX_REFS
    }

    /// Reserve a free block provisionally, searching from the hint.
    pub fn allocate(&mut self) -> Option<SlabBlockNumber> {
        if self.free_count == 0 {
            return None;
        }
        let len = self.counts.len();
        for probe in 0..len {
            let index = (self.search_hint + probe) % len;
            if self.counts[index] == 0 {
                self.counts[index] = PROVISIONAL;
                self.dirty[index / COUNTS_PER_REF_BLOCK] = true;
                self.free_count -= 1;
                self.search_hint = (index + 1) % len;
                self.stats.provisional_grants += 1;
                return Some(index as SlabBlockNumber);
            }
        }
        None
    }

    /// Return an unconfirmed provisional reference to free.
    pub fn release_provisional(&mut self, sbn: SlabBlockNumber) {
        debug_assert_eq!(self.counts[sbn as usize], PROVISIONAL);
        self.counts[sbn as usize] = 0;
        self.dirty[sbn as usize / COUNTS_PER_REF_BLOCK] = true;
        self.free_count += 1;
        self.stats.provisional_releases += 1;
    }

    /// Apply one journaled change at slab-journal point `point`. Returns
    /// false when the owning block has already applied this point, which
    /// is what makes replay idempotent.
    pub fn apply(
        &mut self,
        sbn: SlabBlockNumber,
        op: RefOp,
        point: JournalPoint,
    ) -> CdsResult<bool> {
        let index = sbn as usize;
        if index >= self.counts.len() {
            return Err(CdsError::CorruptJournal);
        }
        let block = index / COUNTS_PER_REF_BLOCK;
        if !point.is_after(&self.block_points[block]) {
            return Ok(false);
        }

        let count = self.counts[index];
        let new = if op.is_increment() {
            match count {
                PROVISIONAL => 1,
                MAX_REFS => return Err(CdsError::OutOfRange),
                0 => {
                    // Replay of an increment whose provisional reference
                    // did not survive the crash.
                    self.free_count -= 1;
                    1
                }
                n => n + 1,
            }
        } else {
            match count {
                0 => return Err(CdsError::CorruptJournal),
                PROVISIONAL | 1 => {
                    self.free_count += 1;
                    0
                }
                n => n - 1,
            }
        };
        self.counts[index] = new;
        self.block_points[block] = point;
        self.dirty[block] = true;
        if op.is_increment() {
            self.stats.increments += 1;
        } else {
            self.stats.decrements += 1;
        }
        Ok(true)
    }

    /// Reclaim every provisional reference; done when a slab comes back
    /// after a crash.
    pub fn reclaim_provisionals(&mut self) -> u64 {
        let mut reclaimed = 0;
        for index in 0..self.counts.len() {
            if self.counts[index] == PROVISIONAL {
                self.counts[index] = 0;
                self.dirty[index / COUNTS_PER_REF_BLOCK] = true;
                self.free_count += 1;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Blocks whose counters changed since the last write-out.
    pub fn has_dirty_blocks(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    fn encode_block(&self, block: usize, buf: &mut [u8]) {
        buf.fill(0);
        let point = self.block_points[block];
        buf[0..8].copy_from_slice(&point.sequence.to_le_bytes());
        buf[8..10].copy_from_slice(&point.entry.to_le_bytes());
        let start = block * COUNTS_PER_REF_BLOCK;
        let end = (start + COUNTS_PER_REF_BLOCK).min(self.counts.len());
        buf[REF_BLOCK_HEADER_SIZE..REF_BLOCK_HEADER_SIZE + end - start]
            .copy_from_slice(&self.counts[start..end]);
    }

    fn decode_block(&mut self, block: usize, buf: &[u8]) {
        self.block_points[block] = JournalPoint::new(
            u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            u16::from_le_bytes(buf[8..10].try_into().unwrap()),
        );
        let start = block * COUNTS_PER_REF_BLOCK;
        let end = (start + COUNTS_PER_REF_BLOCK).min(self.counts.len());
        self.counts[start..end]
            .copy_from_slice(&buf[REF_BLOCK_HEADER_SIZE..REF_BLOCK_HEADER_SIZE + end - start]);
    }

    /// Write dirty counter blocks starting at `ref_origin`.
    pub fn save_dirty(&mut self, device: &dyn BlockDevice, ref_origin: Pbn) -> CdsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..self.dirty.len() {
            if !self.dirty[block] {
                continue;
            }
            self.encode_block(block, &mut buf);
            device.write_block(ref_origin + block as u64, &buf, false)?;
            self.dirty[block] = false;
        }
        Ok(())
    }

    /// Write every counter block.
    pub fn save_all(&mut self, device: &dyn BlockDevice, ref_origin: Pbn) -> CdsResult<()> {
        for dirty in &mut self.dirty {
            *dirty = true;
        }
        self.save_dirty(device, ref_origin)
    }

    /// Read every counter block and recompute the free count.
    pub fn load(&mut self, device: &dyn BlockDevice, ref_origin: Pbn) -> CdsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..self.block_points.len() {
            device.read_block(ref_origin + block as u64, &mut buf)?;
            self.decode_block(block, &buf);
            self.dirty[block] = false;
        }
        self.free_count = self.counts.iter().filter(|&&c| c == 0).count() as BlockCount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDevice;

    fn point(sequence: u64, entry: u16) -> JournalPoint {
        JournalPoint::new(sequence, entry)
    }

    #[test]
    fn test_allocate_confirm_release() {
        let mut rc = RefCounts::new(16);
        assert_eq!(rc.free_count(), 16);
        let sbn = rc.allocate().unwrap();
        assert_eq!(rc.count(sbn), PROVISIONAL);
        assert_eq!(rc.free_count(), 15);

        assert!(rc.apply(sbn, RefOp::DataIncrement, point(1, 0)).unwrap());
        assert_eq!(rc.count(sbn), 1);
        assert!(rc.is_shareable(sbn));

        assert!(rc.apply(sbn, RefOp::DataIncrement, point(1, 1)).unwrap());
        assert_eq!(rc.count(sbn), 2);

        assert!(rc.apply(sbn, RefOp::DataDecrement, point(1, 2)).unwrap());
        assert!(rc.apply(sbn, RefOp::DataDecrement, point(1, 3)).unwrap());
        assert_eq!(rc.count(sbn), 0);
        assert_eq!(rc.free_count(), 16);
    }

    #[test]
    fn test_provisional_release() {
        let mut rc = RefCounts::new(8);
        let sbn = rc.allocate().unwrap();
        rc.release_provisional(sbn);
        assert_eq!(rc.count(sbn), 0);
        assert_eq!(rc.free_count(), 8);
    }

    #[test]
    fn test_apply_is_idempotent_per_point() {
        let mut rc = RefCounts::new(8);
        let sbn = rc.allocate().unwrap();
        assert!(rc.apply(sbn, RefOp::DataIncrement, point(2, 0)).unwrap());
        // Same point again: no-op.
        assert!(!rc.apply(sbn, RefOp::DataIncrement, point(2, 0)).unwrap());
        // Earlier point: no-op.
        assert!(!rc.apply(sbn, RefOp::DataIncrement, point(1, 5)).unwrap());
        assert_eq!(rc.count(sbn), 1);
    }

    #[test]
    fn test_underflow_is_corruption() {
        let mut rc = RefCounts::new(8);
        assert_eq!(
            rc.apply(0, RefOp::DataDecrement, point(1, 0)),
            Err(CdsError::CorruptJournal)
        );
        assert_eq!(
            rc.apply(999, RefOp::DataIncrement, point(1, 0)),
            Err(CdsError::CorruptJournal)
        );
    }

    #[test]
    fn test_overflow_rejected() {
        let mut rc = RefCounts::new(8);
        let sbn = rc.allocate().unwrap();
        rc.apply(sbn, RefOp::DataIncrement, point(1, 0)).unwrap();
        for i in 0..253u16 {
            rc.apply(sbn, RefOp::DataIncrement, point(2, i)).unwrap();
        }
        assert_eq!(rc.count(sbn), MAX_REFS);
        assert!(!rc.is_shareable(sbn));
        assert_eq!(
            rc.apply(sbn, RefOp::DataIncrement, point(3, 0)),
            Err(CdsError::OutOfRange)
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let device = RamDevice::new(8);
        let mut rc = RefCounts::new(16);
        let a = rc.allocate().unwrap();
        rc.apply(a, RefOp::DataIncrement, point(1, 0)).unwrap();
        let b = rc.allocate().unwrap();
        rc.apply(b, RefOp::DataIncrement, point(1, 1)).unwrap();
        rc.apply(b, RefOp::DataIncrement, point(1, 2)).unwrap();
        rc.save_all(&device, 2).unwrap();

        let mut reloaded = RefCounts::new(16);
        reloaded.load(&device, 2).unwrap();
        assert_eq!(reloaded.count(a), 1);
        assert_eq!(reloaded.count(b), 2);
        assert_eq!(reloaded.free_count(), 14);
        // The persisted point still fences replay.
        assert!(!reloaded.apply(b, RefOp::DataIncrement, point(1, 2)).unwrap());
        assert!(reloaded.apply(b, RefOp::DataIncrement, point(1, 3)).unwrap());
    }

    #[test]
    fn test_reclaim_provisionals() {
        let mut rc = RefCounts::new(8);
        rc.allocate().unwrap();
        rc.allocate().unwrap();
        assert_eq!(rc.free_count(), 6);
        assert_eq!(rc.reclaim_provisionals(), 2);
        assert_eq!(rc.free_count(), 8);
    }
}
