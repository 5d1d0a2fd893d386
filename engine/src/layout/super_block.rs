//! Super block codec.
//!
//! The super block is the root of all instance metadata: identity (magic,
//! version, nonce, UUID), the partition geometry, the recovery-journal
//! state as of the last clean save, and the read-only latch. It is sealed
//! with a CRC-32 trailer and always written with FUA.

use crate::config::WritePolicy;
use crate::core::{BlockCount, CdsError, CdsResult, Nonce, SequenceNumber};
use crate::layout::{Layout, SUMMARY_BLOCKS};
use crate::util::crc32;
use crate::BLOCK_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Magic number: "CONDNSE1" in little-endian.
pub const SUPER_BLOCK_MAGIC: u64 = 0x3145_534E_444E_4F43;

/// Current on-disk version.
pub const SUPER_BLOCK_VERSION: u32 = 1;

/// Encoded payload size, CRC trailer included.
pub const SUPER_BLOCK_SIZE: usize = 128;

/// Instance was saved cleanly; journal state in this block is current.
pub const FLAG_CLEAN: u8 = 1 << 0;
/// Instance latched into read-only mode.
pub const FLAG_READ_ONLY: u8 = 1 << 1;

// ============================================================================
// Super Block
// ============================================================================

/// Decoded super block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    /// Instance nonce, stamped into every metadata block
    pub nonce: Nonce,
    /// Instance UUID
    pub uuid: [u8; 16],
    /// Logical address space in blocks
    pub logical_blocks: BlockCount,
    /// Physical device size in blocks
    pub physical_blocks: BlockCount,
    /// Opaque index region size
    pub index_blocks: BlockCount,
    /// Slab size exponent
    pub slab_bits: u8,
    /// Block-map root count
    pub root_count: u8,
    /// Recovery-journal size in blocks
    pub journal_blocks: BlockCount,
    /// Slab count at last save
    pub slab_count: u32,
    /// Journal head at last clean save
    pub journal_head: SequenceNumber,
    /// Journal tail at last clean save
    pub journal_tail: SequenceNumber,
    /// Logical blocks mapped at last clean save
    pub logical_blocks_used: u64,
    /// Tree pages allocated at last clean save
    pub block_map_data_blocks: u64,
    /// CLEAN / READ_ONLY flags
    pub flags: u8,
    /// Durability policy the instance was formatted with
    pub write_policy: WritePolicy,
}

impl SuperBlock {
    /// Was the instance saved cleanly?
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.flags & FLAG_CLEAN != 0
    }

    /// Is the read-only latch persisted?
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.flags & FLAG_READ_ONLY != 0
    }

    /// Reconstruct the partition table this super block describes.
    pub fn layout(&self) -> CdsResult<Layout> {
        let slab_blocks = 1u64 << self.slab_bits;
        let index_origin = 1;
        let super_block = index_origin + self.index_blocks;
        let root_origin = super_block + 1;
        let journal_origin = root_origin + self.root_count as u64;
        let summary_origin = journal_origin + self.journal_blocks;
        let slab_origin = summary_origin + SUMMARY_BLOCKS;
        if slab_origin + self.slab_count as u64 * slab_blocks > self.physical_blocks {
            return Err(CdsError::BadConfiguration);
        }
        Ok(Layout {
            physical_blocks: self.physical_blocks,
            index_origin,
            index_blocks: self.index_blocks,
            super_block,
            root_origin,
            root_count: self.root_count,
            journal_origin,
            journal_blocks: self.journal_blocks,
            summary_origin,
            slab_origin,
            slab_blocks,
            slab_count: self.slab_count,
        })
    }

    /// Encode into a block buffer.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        buf.fill(0);
        put_u64(buf, 0, SUPER_BLOCK_MAGIC);
        put_u32(buf, 8, SUPER_BLOCK_VERSION);
        buf[12] = self.write_policy as u8;
        buf[13] = self.flags;
        buf[14] = self.slab_bits;
        buf[15] = self.root_count;
        put_u64(buf, 16, self.nonce);
        buf[24..40].copy_from_slice(&self.uuid);
        put_u64(buf, 40, self.logical_blocks);
        put_u64(buf, 48, self.physical_blocks);
        put_u64(buf, 56, self.index_blocks);
        put_u64(buf, 64, self.journal_blocks);
        put_u32(buf, 72, self.slab_count);
        put_u64(buf, 80, self.journal_head);
        put_u64(buf, 88, self.journal_tail);
        put_u64(buf, 96, self.logical_blocks_used);
        put_u64(buf, 104, self.block_map_data_blocks);
        let crc = crc32(&buf[..SUPER_BLOCK_SIZE - 4]);
        put_u32(buf, SUPER_BLOCK_SIZE - 4, crc);
    }

    /// Decode and validate a block buffer.
    pub fn decode(buf: &[u8]) -> CdsResult<Self> {
        if buf.len() < SUPER_BLOCK_SIZE {
            return Err(CdsError::BadPage);
        }
        if get_u64(buf, 0) != SUPER_BLOCK_MAGIC {
            return Err(CdsError::BadPage);
        }
        if get_u32(buf, 8) != SUPER_BLOCK_VERSION {
            return Err(CdsError::BadPage);
        }
        let stored_crc = get_u32(buf, SUPER_BLOCK_SIZE - 4);
        if crc32(&buf[..SUPER_BLOCK_SIZE - 4]) != stored_crc {
            return Err(CdsError::BadPage);
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[24..40]);
        Ok(Self {
            write_policy: WritePolicy::from_raw(buf[12])?,
            flags: buf[13],
            slab_bits: buf[14],
            root_count: buf[15],
            nonce: get_u64(buf, 16),
            uuid,
            logical_blocks: get_u64(buf, 40),
            physical_blocks: get_u64(buf, 48),
            index_blocks: get_u64(buf, 56),
            journal_blocks: get_u64(buf, 64),
            slab_count: get_u32(buf, 72),
            journal_head: get_u64(buf, 80),
            journal_tail: get_u64(buf, 88),
            logical_blocks_used: get_u64(buf, 96),
            block_map_data_blocks: get_u64(buf, 104),
        })
    }
}

#[inline]
fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

#[inline]
fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}
