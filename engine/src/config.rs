//! Instance configuration.
//!
//! Everything that shapes an instance is collected here and validated
//! before format or load touches the device. Invalid combinations fail
//! with `BadConfiguration` rather than producing a half-working layout.

use crate::core::{BlockCount, CdsError, CdsResult, ZoneCount};
use crate::MAX_BLOCK_MAP_ROOTS;

// ============================================================================
// Write Policy
// ============================================================================

/// Durability policy for the window between journal commit and block-map
/// write-back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WritePolicy {
    /// Every acknowledged write is durable (journal committed with FUA,
    /// barrier before metadata write-back)
    Sync = 0,
    /// Journal commits are durable; block-map write-back keeps the
    /// ordering barrier. The default.
    Async = 1,
    /// Elides the barrier between journal commit and block-map
    /// write-back. Explicit opt-in that trades durability for throughput.
    AsyncUnsafe = 2,
}

impl WritePolicy {
    /// Decode from the super block.
    pub fn from_raw(raw: u8) -> CdsResult<Self> {
        match raw {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Async),
            2 => Ok(Self::AsyncUnsafe),
            _ => Err(CdsError::BadConfiguration),
        }
    }

    /// Does this policy keep the commit/write-back barrier?
    #[inline]
    pub fn wants_barrier(&self) -> bool {
        !matches!(self, Self::AsyncUnsafe)
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::Async
    }
}

// ============================================================================
// Zone Counts
// ============================================================================

/// How many zones of each sharded kind to run. Admin, journal, packer,
/// and flusher zones always exist singly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCounts {
    /// Logical zones (shard the LBN space)
    pub logical: ZoneCount,
    /// Physical zones (shard the slabs)
    pub physical: ZoneCount,
    /// Hash zones (shard the chunk-name space)
    pub hash: ZoneCount,
}

impl Default for ThreadCounts {
    fn default() -> Self {
        Self {
            logical: 1,
            physical: 1,
            hash: 1,
        }
    }
}

// ============================================================================
// Slab Journal Thresholds
// ============================================================================

/// Depth triggers for a slab journal, in journal blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabJournalThresholds {
    /// Depth at which the tail block is pushed out proactively
    pub flushing: BlockCount,
    /// Depth at which new entries stall until space reappears
    pub blocking: BlockCount,
    /// Depth past which a crashed slab must be scrubbed before reuse
    pub scrubbing: BlockCount,
}

impl SlabJournalThresholds {
    /// Derive the standard thresholds for a journal of `size` blocks.
    pub fn for_journal_size(size: BlockCount) -> Self {
        Self {
            flushing: (size * 3 / 4).max(1),
            blocking: size.saturating_sub(1).max(1),
            scrubbing: (size / 2).max(1),
        }
    }
}

// ============================================================================
// Instance Configuration
// ============================================================================

/// Validated knobs for one instance.
#[derive(Clone, Debug)]
pub struct CondenseConfig {
    /// Logical address space, in blocks
    pub logical_blocks: BlockCount,
    /// Slab size as a power of two: each slab is `1 << slab_bits` blocks
    pub slab_bits: u8,
    /// Recovery-journal size in blocks; must be a power of two
    pub journal_blocks: BlockCount,
    /// In-memory recovery-journal tail buffer pool size
    pub tail_buffers: usize,
    /// Block-map page cache size, in pages
    pub cache_pages: usize,
    /// Number of block-map root trees
    pub block_map_roots: u8,
    /// Zone fan-out
    pub threads: ThreadCounts,
    /// Slab-journal thresholds; `None` derives them from the journal size
    pub slab_journal_thresholds: Option<SlabJournalThresholds>,
    /// Durability policy
    pub write_policy: WritePolicy,
    /// Blocks reserved at the front of the device for the external
    /// deduplication index
    pub index_blocks: BlockCount,
}

impl CondenseConfig {
    /// Smallest slab this engine will accept (2^4 blocks, test scale).
    pub const MIN_SLAB_BITS: u8 = 4;
    /// Largest slab (2^23 blocks, 32 GiB).
    pub const MAX_SLAB_BITS: u8 = 23;

    /// Check internal consistency.
    pub fn validate(&self) -> CdsResult<()> {
        if self.logical_blocks == 0 {
            return Err(CdsError::BadConfiguration);
        }
        if self.slab_bits < Self::MIN_SLAB_BITS || self.slab_bits > Self::MAX_SLAB_BITS {
            return Err(CdsError::BadConfiguration);
        }
        if self.journal_blocks < 2 || !self.journal_blocks.is_power_of_two() {
            return Err(CdsError::BadConfiguration);
        }
        if self.tail_buffers == 0 || self.cache_pages < 2 {
            return Err(CdsError::BadConfiguration);
        }
        if self.block_map_roots == 0 || self.block_map_roots > MAX_BLOCK_MAP_ROOTS {
            return Err(CdsError::BadConfiguration);
        }
        if self.threads.logical == 0 || self.threads.physical == 0 || self.threads.hash == 0 {
            return Err(CdsError::BadConfiguration);
        }
        if let Some(t) = self.slab_journal_thresholds {
            if t.flushing == 0 || t.blocking < t.flushing {
                return Err(CdsError::BadConfiguration);
            }
        }
        Ok(())
    }
}

impl Default for CondenseConfig {
    fn default() -> Self {
        Self {
            logical_blocks: 1 << 20,
            slab_bits: 19,
            journal_blocks: 8192,
            tail_buffers: 64,
            cache_pages: 128,
            block_map_roots: 16,
            threads: ThreadCounts::default(),
            slab_journal_thresholds: None,
            write_policy: WritePolicy::default(),
            index_blocks: 0,
        }
    }
}
