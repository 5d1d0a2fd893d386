//! Fundamental block, sequence, and mapping types.
//!
//! All metadata is addressed in 4 KiB blocks. Logical block numbers are the
//! consumer-facing keys; physical block numbers address the backing device.
//! A mapping entry packs a 36-bit PBN and a 4-bit mapping state into five
//! bytes, which is what bounds the compressed-fragment fanout at fourteen.

use crate::core::error::{CdsError, CdsResult};

// ============================================================================
// Block Numbers
// ============================================================================

/// Logical block number, the key exposed to the consumer.
pub type Lbn = u64;

/// Physical block number on the backing device.
pub type Pbn = u64;

/// A count of blocks.
pub type BlockCount = u64;

/// Monotonically increasing journal sequence number.
pub type SequenceNumber = u64;

/// Block offset within a single slab.
pub type SlabBlockNumber = u32;

/// Index of a slab within the depot.
pub type SlabIndex = u32;

/// Count of zones of one kind.
pub type ZoneCount = u8;

/// Per-instance nonce stamped into every metadata block.
pub type Nonce = u64;

/// The well-known physical address of the zero block. Never allocated,
/// never counted.
pub const ZERO_BLOCK: Pbn = 0;

/// Sentinel for "no physical block".
pub const INVALID_PBN: Pbn = u64::MAX;

/// Largest PBN representable in a packed 5-byte mapping entry (36 bits).
pub const MAX_PACKABLE_PBN: Pbn = (1 << 36) - 1;

// ============================================================================
// Journal Point
// ============================================================================

/// Identifies a single recovery-journal entry: a journal block sequence
/// number plus the entry index within that block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct JournalPoint {
    /// Journal block sequence number
    pub sequence: SequenceNumber,
    /// Entry index within the block
    pub entry: u16,
}

impl JournalPoint {
    /// Create a journal point.
    #[inline]
    pub const fn new(sequence: SequenceNumber, entry: u16) -> Self {
        Self { sequence, entry }
    }

    /// The point before any entry has been journaled.
    #[inline]
    pub const fn zero() -> Self {
        Self { sequence: 0, entry: 0 }
    }

    /// Is this point strictly after `other`?
    #[inline]
    pub fn is_after(&self, other: &JournalPoint) -> bool {
        self > other
    }

    /// True once any entry has been recorded.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.sequence > 0
    }
}

// ============================================================================
// Mapping State
// ============================================================================

/// Number of compressed fragments that fit in one physical block. The
/// mapping state nibble has sixteen values; two are taken by unmapped and
/// uncompressed, leaving fourteen slots.
pub const MAX_COMPRESSION_SLOTS: usize = 14;

/// Raw nibble for an unmapped entry.
const RAW_UNMAPPED: u8 = 0;
/// Raw nibble for an uncompressed mapping.
const RAW_UNCOMPRESSED: u8 = 1;
/// First raw nibble used for compressed slots.
const RAW_COMPRESSED_BASE: u8 = 2;

/// Interpretation of a mapping entry's 4-bit state field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingState {
    /// No mapping; reads return the zero block
    Unmapped,
    /// Points at a plain data block
    Uncompressed,
    /// Points at fragment `slot` of a compressed block
    Compressed(u8),
}

impl MappingState {
    /// Decode a raw state nibble. All sixteen values are meaningful.
    #[inline]
    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x0F {
            RAW_UNMAPPED => Self::Unmapped,
            RAW_UNCOMPRESSED => Self::Uncompressed,
            n => Self::Compressed(n - RAW_COMPRESSED_BASE),
        }
    }

    /// Encode as a raw state nibble.
    #[inline]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Unmapped => RAW_UNMAPPED,
            Self::Uncompressed => RAW_UNCOMPRESSED,
            Self::Compressed(slot) => RAW_COMPRESSED_BASE + slot,
        }
    }

    /// Is this a compressed-slot state?
    #[inline]
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed(_))
    }
}

impl Default for MappingState {
    fn default() -> Self {
        Self::Unmapped
    }
}

// ============================================================================
// Data Location
// ============================================================================

/// A decoded mapping: a physical block plus how the data lives there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataLocation {
    /// Physical block number
    pub pbn: Pbn,
    /// Mapping state
    pub state: MappingState,
}

/// Packed on-disk size of one mapping entry.
pub const MAPPING_ENTRY_SIZE: usize = 5;

impl DataLocation {
    /// The canonical unmapped location.
    pub const UNMAPPED: Self = Self {
        pbn: ZERO_BLOCK,
        state: MappingState::Unmapped,
    };

    /// Create a location.
    #[inline]
    pub const fn new(pbn: Pbn, state: MappingState) -> Self {
        Self { pbn, state }
    }

    /// Does this location name real data?
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// Pack into the 5-byte on-disk form: the first byte carries the state
    /// nibble in its high half and PBN bits 32..36 in its low half, the
    /// remaining four bytes are the low PBN word, little-endian.
    pub fn pack(&self) -> [u8; MAPPING_ENTRY_SIZE] {
        debug_assert!(self.pbn <= MAX_PACKABLE_PBN);
        let mut bytes = [0u8; MAPPING_ENTRY_SIZE];
        bytes[0] = (self.state.to_raw() << 4) | ((self.pbn >> 32) as u8 & 0x0F);
        bytes[1..5].copy_from_slice(&(self.pbn as u32).to_le_bytes());
        bytes
    }

    /// Unpack the 5-byte on-disk form.
    pub fn unpack(bytes: &[u8; MAPPING_ENTRY_SIZE]) -> Self {
        let state = MappingState::from_raw(bytes[0] >> 4);
        let high = (bytes[0] & 0x0F) as u64;
        let low = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as u64;
        let pbn = (high << 32) | low;
        // An unmapped entry carries no address; normalize so the default
        // zeroed page decodes to UNMAPPED exactly.
        if state == MappingState::Unmapped {
            Self::UNMAPPED
        } else {
            Self { pbn, state }
        }
    }

    /// Validate a decoded location against the device size.
    pub fn check(&self, physical_blocks: BlockCount) -> CdsResult<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        if self.pbn == ZERO_BLOCK || self.pbn >= physical_blocks {
            return Err(CdsError::BadMapping);
        }
        if let MappingState::Compressed(slot) = self.state {
            if slot as usize >= MAX_COMPRESSION_SLOTS {
                return Err(CdsError::BadMapping);
            }
        }
        Ok(())
    }
}

impl Default for DataLocation {
    fn default() -> Self {
        Self::UNMAPPED
    }
}

// ============================================================================
// Request Identity
// ============================================================================

/// Identifies an in-flight request within the instance's request pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VioId(pub u32);

impl VioId {
    /// Pool slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_point_order() {
        let a = JournalPoint::new(3, 7);
        let b = JournalPoint::new(3, 8);
        let c = JournalPoint::new(4, 0);
        assert!(b.is_after(&a));
        assert!(c.is_after(&b));
        assert!(!a.is_after(&a));
        assert!(!JournalPoint::zero().is_valid());
    }

    #[test]
    fn test_mapping_state_raw_round_trip() {
        for raw in 0u8..16 {
            assert_eq!(MappingState::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(MappingState::from_raw(2), MappingState::Compressed(0));
        assert_eq!(MappingState::from_raw(15), MappingState::Compressed(13));
    }

    #[test]
    fn test_location_pack_unpack() {
        let loc = DataLocation::new(0x8_1234_5678, MappingState::Compressed(5));
        let packed = loc.pack();
        assert_eq!(DataLocation::unpack(&packed), loc);

        let plain = DataLocation::new(42, MappingState::Uncompressed);
        assert_eq!(DataLocation::unpack(&plain.pack()), plain);
    }

    #[test]
    fn test_zeroed_entry_is_unmapped() {
        let zero = [0u8; MAPPING_ENTRY_SIZE];
        assert_eq!(DataLocation::unpack(&zero), DataLocation::UNMAPPED);
    }

    #[test]
    fn test_location_check() {
        let loc = DataLocation::new(100, MappingState::Uncompressed);
        assert!(loc.check(101).is_ok());
        assert_eq!(loc.check(100), Err(CdsError::BadMapping));
        assert_eq!(
            DataLocation::new(0, MappingState::Uncompressed).check(100),
            Err(CdsError::BadMapping)
        );
        assert!(DataLocation::UNMAPPED.check(1).is_ok());
    }
}
