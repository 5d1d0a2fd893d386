//! Statistics readout.
//!
//! Component counters are plain integers owned by their zone and updated
//! only there; error counters are atomic because any path may bump them.
//! A snapshot gathers everything into one structure for the management
//! surface.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::block_map::cache::PageCacheStats;
use crate::dedupe::hash_zone::HashZoneStats;
use crate::journal::recovery_journal::RecoveryJournalStats;
use crate::logical::LogicalZoneStats;
use crate::packer::PackerStats;
use crate::physical::PhysicalZoneStats;
use crate::slab::allocator::BlockAllocatorStats;
use crate::slab::journal::SlabJournalStats;
use crate::slab::ref_counts::RefCountStats;
use crate::slab::scrubber::ScrubberStats;
use crate::slab::summary::SlabSummaryStats;

// ============================================================================
// Error Counters
// ============================================================================

/// Cross-thread error counters.
#[derive(Debug, Default)]
pub struct ErrorStats {
    pub io_errors: AtomicU64,
    pub read_only_entries: AtomicU64,
    pub invalid_advice: AtomicU64,
}

impl ErrorStats {
    /// Point-in-time copy.
    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        ErrorStatsSnapshot {
            io_errors: self.io_errors.load(Ordering::Relaxed),
            read_only_entries: self.read_only_entries.load(Ordering::Relaxed),
            invalid_advice: self.invalid_advice.load(Ordering::Relaxed),
        }
    }
}

/// Copied error counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorStatsSnapshot {
    pub io_errors: u64,
    pub read_only_entries: u64,
    pub invalid_advice: u64,
}

// ============================================================================
// Request Counters
// ============================================================================

/// Pipeline-level counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestStats {
    pub reads: u64,
    pub writes: u64,
    pub zero_writes: u64,
    pub dedupe_shares: u64,
    pub compressed_writes: u64,
    pub failed_requests: u64,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Everything the management surface reads, in one place.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub requests: RequestStats,
    pub journal: RecoveryJournalStats,
    pub packer: PackerStats,
    pub page_cache: PageCacheStats,
    pub block_allocator: BlockAllocatorStats,
    pub slab_journal: SlabJournalStats,
    pub slab_summary: SlabSummaryStats,
    pub ref_counts: RefCountStats,
    pub scrubber: ScrubberStats,
    pub hash_locks: HashZoneStats,
    pub logical_zones: LogicalZoneStats,
    pub physical_zones: PhysicalZoneStats,
    pub errors: ErrorStatsSnapshot,
    /// Logical blocks currently mapped
    pub logical_blocks_used: u64,
    /// Tree pages currently allocated
    pub block_map_data_blocks: u64,
    /// Free data blocks across all slabs
    pub free_blocks: u64,
}
