//! Per-zone block-map access.
//!
//! A block-map zone owns the page cache for its share of the trees and
//! exposes the two leaf operations the pipeline needs: reading a mapping
//! entry and installing one under a recovery-journal lock. The update
//! path implements the dirtying discipline: the page keeps a journal
//! reference for the earliest sequence it protects, acquiring for the
//! new sequence when it holds none or when the new one is older, and
//! releasing the one it held.

use alloc::vec::Vec;

use crate::block_map::cache::{LockTransfer, PageCache, PageGet};
use crate::block_map::page;
use crate::core::{CdsResult, DataLocation, Nonce, Pbn, SequenceNumber, ZoneCount};
use crate::device::BlockDevice;
use crate::pipeline::Action;

// ============================================================================
// Results
// ============================================================================

/// Outcome of a leaf read.
#[derive(Debug, PartialEq, Eq)]
pub enum EntryGet {
    /// The decoded mapping
    Ready(DataLocation),
    /// Parked on the cache
    Parked,
}

/// Outcome of a leaf update.
#[derive(Debug, PartialEq, Eq)]
pub enum EntryPut {
    /// Installed; journal references to move
    Applied(LockTransfer),
    /// Parked on the cache
    Parked,
}

// ============================================================================
// Block Map Zone
// ============================================================================

/// One logical zone's slice of the block map.
pub struct BlockMapZone {
    zone: ZoneCount,
    pub cache: PageCache,
}

impl BlockMapZone {
    /// Create a zone with a cache of `cache_pages` frames.
    pub fn new(zone: ZoneCount, cache_pages: usize, nonce: Nonce) -> Self {
        Self {
            zone,
            cache: PageCache::new(cache_pages, nonce),
        }
    }

    /// This zone's index.
    #[inline]
    pub fn zone(&self) -> ZoneCount {
        self.zone
    }

    /// Read the mapping at `index` of the leaf page at `leaf_pbn`.
    /// Alongside the outcome, any cache waiter freed by the release is
    /// handed back for re-enqueueing.
    pub fn read_entry(
        &mut self,
        device: &dyn BlockDevice,
        leaf_pbn: Pbn,
        index: usize,
        waiter: Action,
    ) -> CdsResult<(EntryGet, Vec<Action>)> {
        match self.cache.get_page(device, leaf_pbn, waiter)? {
            PageGet::Parked => Ok((EntryGet::Parked, Vec::new())),
            PageGet::Ready(frame) => {
                let entry = page::entry(self.cache.page(frame), index);
                let released = self.cache.release(frame).into_iter().collect();
                Ok((EntryGet::Ready(entry), released))
            }
        }
    }

    /// Install `new` at `index` of the leaf page at `leaf_pbn`, dirtying
    /// the page under `lock_sequence`.
    pub fn update_entry(
        &mut self,
        device: &dyn BlockDevice,
        leaf_pbn: Pbn,
        index: usize,
        new: DataLocation,
        lock_sequence: SequenceNumber,
        waiter: Action,
    ) -> CdsResult<(EntryPut, Vec<Action>)> {
        match self.cache.get_page(device, leaf_pbn, waiter)? {
            PageGet::Parked => Ok((EntryPut::Parked, Vec::new())),
            PageGet::Ready(frame) => {
                page::set_entry(self.cache.page_mut(frame), index, new);
                let transfer = self.cache.mark_dirty(frame, lock_sequence);
                let released = self.cache.release(frame).into_iter().collect();
                Ok((EntryPut::Applied(transfer), released))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MappingState, VioId};
    use crate::device::RamDevice;
    use crate::pipeline::Op;

    fn waiter() -> Action {
        Action::new(VioId(1), Op::PutMappedBlock)
    }

    #[test]
    fn test_read_then_update_then_read() {
        let device = RamDevice::new(64);
        let mut zone = BlockMapZone::new(0, 4, 7);
        let (get, _) = zone.read_entry(&device, 10, 3, waiter()).unwrap();
        assert_eq!(get, EntryGet::Ready(DataLocation::UNMAPPED));

        let loc = DataLocation::new(99, MappingState::Uncompressed);
        let (put, _) = zone.update_entry(&device, 10, 3, loc, 5, waiter()).unwrap();
        match put {
            EntryPut::Applied(transfer) => assert_eq!(transfer.acquire, Some(5)),
            EntryPut::Parked => panic!("unexpected park"),
        }

        let (get, _) = zone.read_entry(&device, 10, 3, waiter()).unwrap();
        assert_eq!(get, EntryGet::Ready(loc));
    }

    #[test]
    fn test_update_survives_write_back() {
        let device = RamDevice::new(64);
        let mut zone = BlockMapZone::new(0, 4, 7);
        let loc = DataLocation::new(55, MappingState::Compressed(2));
        zone.update_entry(&device, 12, 0, loc, 9, waiter()).unwrap();
        zone.cache.flush_dirty(&device).unwrap();
        device.flush().unwrap();

        // A cold cache re-reads the persisted page.
        let mut cold = BlockMapZone::new(0, 4, 7);
        let (get, _) = cold.read_entry(&device, 12, 0, waiter()).unwrap();
        assert_eq!(get, EntryGet::Ready(loc));
    }
}
