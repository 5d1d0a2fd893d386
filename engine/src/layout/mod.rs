//! Fixed partitioning of the physical device.
//!
//! The device is divided once, at format time: a reserved block, the
//! opaque index region, the super block, the block-map root pages, the
//! recovery journal, the slab summary, and finally an array of equally
//! sized slabs. PBN 0 is never used for data; it doubles as the zero
//! block sentinel in mappings.

pub mod super_block;

pub use super_block::SuperBlock;

use crate::config::CondenseConfig;
use crate::core::{BlockCount, CdsError, CdsResult, Pbn, SlabIndex};

// ============================================================================
// Constants
// ============================================================================

/// Slab-summary region size in blocks. Each entry is two bytes, so this
/// fixes the depot at 8192 slabs.
pub const SUMMARY_BLOCKS: BlockCount = 4;

/// Summary entries per summary block.
pub const SUMMARY_ENTRIES_PER_BLOCK: usize = crate::BLOCK_SIZE / 2;

/// Maximum slabs a depot can hold.
pub const MAX_SLABS: SlabIndex = (SUMMARY_BLOCKS as usize * SUMMARY_ENTRIES_PER_BLOCK) as SlabIndex;

// ============================================================================
// Layout
// ============================================================================

/// Computed partition table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Total physical blocks
    pub physical_blocks: BlockCount,
    /// Opaque index region origin (empty when the index is external)
    pub index_origin: Pbn,
    /// Index region size
    pub index_blocks: BlockCount,
    /// Super block location
    pub super_block: Pbn,
    /// First block-map root page
    pub root_origin: Pbn,
    /// Number of root pages
    pub root_count: u8,
    /// First recovery-journal block
    pub journal_origin: Pbn,
    /// Recovery-journal size
    pub journal_blocks: BlockCount,
    /// First slab-summary block
    pub summary_origin: Pbn,
    /// First slab
    pub slab_origin: Pbn,
    /// Blocks per slab
    pub slab_blocks: BlockCount,
    /// Number of slabs
    pub slab_count: SlabIndex,
}

impl Layout {
    /// Partition a device of `physical_blocks` according to `config`.
    pub fn compute(config: &CondenseConfig, physical_blocks: BlockCount) -> CdsResult<Self> {
        config.validate()?;

        let slab_blocks = 1u64 << config.slab_bits;
        let index_origin = 1; // PBN 0 reserved
        let super_block = index_origin + config.index_blocks;
        let root_origin = super_block + 1;
        let journal_origin = root_origin + config.block_map_roots as u64;
        let summary_origin = journal_origin + config.journal_blocks;
        let slab_origin = summary_origin + SUMMARY_BLOCKS;

        if slab_origin + slab_blocks > physical_blocks {
            return Err(CdsError::BadConfiguration);
        }
        let slab_count = ((physical_blocks - slab_origin) / slab_blocks) as SlabIndex;
        if slab_count == 0 || slab_count > MAX_SLABS {
            return Err(CdsError::BadConfiguration);
        }

        Ok(Self {
            physical_blocks,
            index_origin,
            index_blocks: config.index_blocks,
            super_block,
            root_origin,
            root_count: config.block_map_roots,
            journal_origin,
            journal_blocks: config.journal_blocks,
            summary_origin,
            slab_origin,
            slab_blocks,
            slab_count,
        })
    }

    /// Which slab holds `pbn`, if any.
    #[inline]
    pub fn slab_of(&self, pbn: Pbn) -> Option<SlabIndex> {
        if pbn < self.slab_origin {
            return None;
        }
        let index = ((pbn - self.slab_origin) / self.slab_blocks) as SlabIndex;
        (index < self.slab_count).then_some(index)
    }

    /// First PBN of slab `index`.
    #[inline]
    pub fn slab_pbn(&self, index: SlabIndex) -> Pbn {
        self.slab_origin + index as u64 * self.slab_blocks
    }

    /// PBN of root page `root`.
    #[inline]
    pub fn root_pbn(&self, root: u8) -> Pbn {
        debug_assert!(root < self.root_count);
        self.root_origin + root as u64
    }

    /// PBN of journal block `sequence mod journal_blocks`.
    #[inline]
    pub fn journal_pbn(&self, sequence: u64) -> Pbn {
        self.journal_origin + (sequence & (self.journal_blocks - 1))
    }

    /// Data blocks actually available for user data (all slabs' data
    /// regions; refcount and slab-journal overhead excluded by the depot).
    pub fn slab_region_blocks(&self) -> BlockCount {
        self.slab_count as u64 * self.slab_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CondenseConfig;

    fn small_config() -> CondenseConfig {
        CondenseConfig {
            logical_blocks: 256,
            slab_bits: 6,
            journal_blocks: 8,
            tail_buffers: 2,
            cache_pages: 8,
            block_map_roots: 2,
            ..CondenseConfig::default()
        }
    }

    #[test]
    fn test_partition_order() {
        let config = small_config();
        let layout = Layout::compute(&config, 1024).unwrap();
        assert_eq!(layout.super_block, 1);
        assert_eq!(layout.root_origin, 2);
        assert_eq!(layout.journal_origin, 4);
        assert_eq!(layout.summary_origin, 12);
        assert_eq!(layout.slab_origin, 16);
        assert_eq!(layout.slab_blocks, 64);
        assert_eq!(layout.slab_count, 15);
    }

    #[test]
    fn test_slab_addressing() {
        let layout = Layout::compute(&small_config(), 1024).unwrap();
        assert_eq!(layout.slab_of(layout.slab_origin), Some(0));
        assert_eq!(layout.slab_of(layout.slab_origin + 63), Some(0));
        assert_eq!(layout.slab_of(layout.slab_origin + 64), Some(1));
        assert_eq!(layout.slab_of(0), None);
        assert_eq!(layout.slab_pbn(2), layout.slab_origin + 128);
    }

    #[test]
    fn test_journal_wrap() {
        let layout = Layout::compute(&small_config(), 1024).unwrap();
        assert_eq!(layout.journal_pbn(1), layout.journal_origin + 1);
        assert_eq!(layout.journal_pbn(9), layout.journal_origin + 1);
    }

    #[test]
    fn test_too_small_device_rejected() {
        let config = small_config();
        assert_eq!(
            Layout::compute(&config, 40),
            Err(CdsError::BadConfiguration)
        );
    }
}
