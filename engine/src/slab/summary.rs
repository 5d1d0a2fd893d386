//! Slab summary: one compact record per slab.
//!
//! Two bytes per slab: a clean flag and a scaled fullness hint. Written
//! when a slab closes cleanly and consulted when slabs come back online,
//! so cleanly closed slabs skip scrubbing and the allocator has a free
//! space estimate before any counters are read.

use alloc::vec;
use alloc::vec::Vec;

use crate::core::{BlockCount, CdsResult, Pbn, SlabIndex};
use crate::device::BlockDevice;
use crate::layout::{SUMMARY_BLOCKS, SUMMARY_ENTRIES_PER_BLOCK};
use crate::BLOCK_SIZE;

const FLAG_CLEAN: u8 = 1 << 0;

// ============================================================================
// Summary Entry
// ============================================================================

/// Hint for one slab.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SummaryEntry {
    /// Did the slab close cleanly?
    pub is_clean: bool,
    /// Free space scaled to 0..=255
    pub fullness_hint: u8,
}

impl SummaryEntry {
    /// Scale a free-block count into a hint.
    pub fn hint_for(free: BlockCount, data_blocks: BlockCount) -> u8 {
        if data_blocks == 0 {
            return 0;
        }
        ((free * 255) / data_blocks) as u8
    }
}

// ============================================================================
// Slab Summary
// ============================================================================

/// Summary counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlabSummaryStats {
    pub updates: u64,
    pub writes: u64,
}

/// The whole summary region, held in memory and written back per block.
pub struct SlabSummary {
    origin: Pbn,
    entries: Vec<SummaryEntry>,
    dirty_blocks: Vec<bool>,
    pub stats: SlabSummaryStats,
}

impl SlabSummary {
    /// Create an all-dirty (never written) summary at `origin`.
    pub fn new(origin: Pbn, slab_count: SlabIndex) -> Self {
        Self {
            origin,
            entries: vec![SummaryEntry::default(); slab_count as usize],
            dirty_blocks: vec![true; SUMMARY_BLOCKS as usize],
            stats: SlabSummaryStats::default(),
        }
    }

    /// The current hint for `slab`.
    pub fn entry(&self, slab: SlabIndex) -> SummaryEntry {
        self.entries[slab as usize]
    }

    /// Record a new hint for `slab`.
    pub fn update(&mut self, slab: SlabIndex, entry: SummaryEntry) {
        self.entries[slab as usize] = entry;
        self.dirty_blocks[slab as usize / SUMMARY_ENTRIES_PER_BLOCK] = true;
        self.stats.updates += 1;
    }

    /// Extend for newly added slabs (grow); new entries are not clean.
    pub fn extend_to(&mut self, slab_count: SlabIndex) {
        while self.entries.len() < slab_count as usize {
            self.dirty_blocks[self.entries.len() / SUMMARY_ENTRIES_PER_BLOCK] = true;
            self.entries.push(SummaryEntry::default());
        }
    }

    /// Write dirty summary blocks.
    pub fn save(&mut self, device: &dyn BlockDevice) -> CdsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..SUMMARY_BLOCKS as usize {
            if !self.dirty_blocks[block] {
                continue;
            }
            buf.fill(0);
            let start = block * SUMMARY_ENTRIES_PER_BLOCK;
            for slot in 0..SUMMARY_ENTRIES_PER_BLOCK {
                let Some(entry) = self.entries.get(start + slot) else {
                    break;
                };
                let offset = slot * 2;
                buf[offset] = if entry.is_clean { FLAG_CLEAN } else { 0 };
                buf[offset + 1] = entry.fullness_hint;
            }
            device.write_block(self.origin + block as u64, &buf, false)?;
            self.dirty_blocks[block] = false;
            self.stats.writes += 1;
        }
        Ok(())
    }

    /// Read the whole region back.
    pub fn load(&mut self, device: &dyn BlockDevice) -> CdsResult<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for block in 0..SUMMARY_BLOCKS as usize {
            let start = block * SUMMARY_ENTRIES_PER_BLOCK;
            if start >= self.entries.len() {
                break;
            }
            device.read_block(self.origin + block as u64, &mut buf)?;
            for slot in 0..SUMMARY_ENTRIES_PER_BLOCK {
                let Some(entry) = self.entries.get_mut(start + slot) else {
                    break;
                };
                let offset = slot * 2;
                entry.is_clean = buf[offset] & FLAG_CLEAN != 0;
                entry.fullness_hint = buf[offset + 1];
            }
            self.dirty_blocks[block] = false;
        }
        Ok(())
    }
}
