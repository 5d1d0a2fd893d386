//! Deduplication collaborators.
//!
//! Content hashing and the deduplication index are external to this
//! engine: the pipeline consumes a [`ChunkHasher`] to name a block's
//! contents and a [`DedupeIndex`] for advisory mappings. Advice is never
//! trusted; it is verified by re-reading the advised block. An index
//! timeout converts to "no advice".

pub mod hash_zone;

pub use hash_zone::{HashLockOutcome, HashZone};

use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use crate::core::{CdsError, CdsResult, DataLocation, ZoneCount};

// ============================================================================
// Chunk Names
// ============================================================================

/// The 128-bit name of a block's contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkName(pub [u8; 16]);

impl ChunkName {
    /// Which hash zone owns this name.
    #[inline]
    pub fn zone(&self, zones: ZoneCount) -> ZoneCount {
        self.0[0] % zones
    }
}

/// External content-hash provider.
pub trait ChunkHasher: Send + Sync {
    /// Name one block of data.
    fn chunk_name(&self, data: &[u8]) -> ChunkName;
}

/// Built-in FNV-1a style hasher: two passes with distinct offset bases
/// make up the 128-bit name.
pub struct FnvChunkHasher;

impl ChunkHasher for FnvChunkHasher {
    fn chunk_name(&self, data: &[u8]) -> ChunkName {
        const PRIME: u64 = 0x0000_0100_0000_01B3;
        let mut low: u64 = 0xCBF2_9CE4_8422_2325;
        let mut high: u64 = 0x6C62_272E_07BB_0142;
        for &byte in data {
            low = (low ^ byte as u64).wrapping_mul(PRIME);
            high = (high ^ byte.rotate_left(3) as u64).wrapping_mul(PRIME);
        }
        let mut name = [0u8; 16];
        name[..8].copy_from_slice(&low.to_le_bytes());
        name[8..].copy_from_slice(&high.to_le_bytes());
        ChunkName(name)
    }
}

// ============================================================================
// Dedupe Index
// ============================================================================

/// External deduplication index contract. Advice is advisory only.
pub trait DedupeIndex: Send + Sync {
    /// Look up advice for `name`. `Err(Timeout)` is converted by the
    /// caller into "no advice".
    fn query(&self, name: &ChunkName) -> CdsResult<Option<DataLocation>>;

    /// Record that `name` now lives at `location`.
    fn update(&self, name: &ChunkName, location: DataLocation);

    /// Offer a first sighting of `name`; returns whether the index
    /// accepted it as new. Indexes that cannot distinguish treat it as
    /// an update.
    fn post(&self, name: &ChunkName, location: DataLocation) -> bool {
        self.update(name, location);
        true
    }
}

/// In-memory index, suitable for tests and stand-alone use. Can be told
/// to time out to exercise the advice-timeout path.
pub struct MemoryDedupeIndex {
    map: Mutex<HashMap<ChunkName, DataLocation>>,
    timeouts_remaining: Mutex<u32>,
}

impl MemoryDedupeIndex {
    /// Empty index.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            timeouts_remaining: Mutex::new(0),
        })
    }

    /// Make the next `count` queries time out.
    pub fn inject_timeouts(&self, count: u32) {
        *self.timeouts_remaining.lock() = count;
    }

    /// Number of names currently indexed.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl DedupeIndex for MemoryDedupeIndex {
    fn query(&self, name: &ChunkName) -> CdsResult<Option<DataLocation>> {
        {
            let mut timeouts = self.timeouts_remaining.lock();
            if *timeouts > 0 {
                *timeouts -= 1;
                return Err(CdsError::Timeout);
            }
        }
        Ok(self.map.lock().get(name).copied())
    }

    fn update(&self, name: &ChunkName, location: DataLocation) {
        self.map.lock().insert(*name, location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MappingState;

    #[test]
    fn test_hasher_is_deterministic_and_content_sensitive() {
        let a = FnvChunkHasher.chunk_name(&[1, 2, 3]);
        let b = FnvChunkHasher.chunk_name(&[1, 2, 3]);
        let c = FnvChunkHasher.chunk_name(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_memory_index_query_update() {
        let index = MemoryDedupeIndex::new();
        let name = FnvChunkHasher.chunk_name(&[9u8; 64]);
        assert_eq!(index.query(&name), Ok(None));
        let loc = DataLocation::new(42, MappingState::Uncompressed);
        index.update(&name, loc);
        assert_eq!(index.query(&name), Ok(Some(loc)));
    }

    #[test]
    fn test_timeout_injection() {
        let index = MemoryDedupeIndex::new();
        let name = FnvChunkHasher.chunk_name(&[1u8; 8]);
        index.inject_timeouts(1);
        assert_eq!(index.query(&name), Err(CdsError::Timeout));
        assert_eq!(index.query(&name), Ok(None));
    }
}
