//! Recovery journal on-disk format.
//!
//! The journal is a circular array of blocks; a block's position is its
//! sequence number modulo the journal size, and a one-byte check byte
//! derived from the generation (`sequence / size`) distinguishes a block
//! written this time around from one left over from a previous lap.
//! Entries record a logical block's old and new mapping; tree-page
//! allocations ride the same format under a synthetic key.

pub mod lock_counter;
pub mod recovery_journal;
pub mod replay;

pub use lock_counter::{LockCounter, ZoneType};
pub use recovery_journal::{AppendOutcome, RecoveryJournal};

use alloc::vec::Vec;

use crate::core::{
    BlockCount, CdsError, CdsResult, DataLocation, Lbn, Nonce, SequenceNumber,
};
use crate::core::types::MAPPING_ENTRY_SIZE;
use crate::BLOCK_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Journal block header size.
pub const JOURNAL_HEADER_SIZE: usize = 48;

/// Packed size of one journal entry.
pub const JOURNAL_ENTRY_SIZE: usize = 8 + 2 * MAPPING_ENTRY_SIZE + 1;

/// Entries per journal block.
pub const ENTRIES_PER_JOURNAL_BLOCK: usize =
    (BLOCK_SIZE - JOURNAL_HEADER_SIZE) / JOURNAL_ENTRY_SIZE;

static_assertions::const_assert_eq!(ENTRIES_PER_JOURNAL_BLOCK, 213);

const FLAG_INC_REF: u8 = 1 << 0;
const FLAG_BLOCK_MAP: u8 = 1 << 1;

/// Check byte for `sequence` in a journal of `size` blocks.
#[inline]
pub fn check_byte(sequence: SequenceNumber, size: BlockCount) -> u8 {
    (((sequence / size) & 0x7F) as u8) | 0x80
}

// ============================================================================
// Tree Page Keys
// ============================================================================

/// Marks a journal entry key as naming a tree page rather than an LBN.
const TREE_KEY_FLAG: u64 = 1 << 63;

/// Encode a tree page position as a journal entry key.
#[inline]
pub fn tree_page_key(root: u8, level: u8, page_index: u64) -> u64 {
    debug_assert!(page_index < (1 << 40));
    TREE_KEY_FLAG | ((root as u64) << 48) | ((level as u64) << 40) | page_index
}

/// Decode a tree page key, if the key is one.
#[inline]
pub fn decode_tree_page_key(key: u64) -> Option<(u8, u8, u64)> {
    if key & TREE_KEY_FLAG == 0 {
        return None;
    }
    Some((
        ((key >> 48) & 0xFF) as u8,
        ((key >> 40) & 0xFF) as u8,
        key & ((1 << 40) - 1),
    ))
}

// ============================================================================
// Entries
// ============================================================================

/// One mapping delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    /// LBN, or a tree page key when `block_map` is set
    pub key: Lbn,
    /// Mapping being replaced
    pub old: DataLocation,
    /// Mapping being installed
    pub new: DataLocation,
    /// Does the new mapping take a reference?
    pub inc_ref: bool,
    /// Is this a tree-page allocation?
    pub block_map: bool,
}

impl JournalEntry {
    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.key.to_le_bytes());
        buf[8..13].copy_from_slice(&self.old.pack());
        buf[13..18].copy_from_slice(&self.new.pack());
        let mut flags = 0;
        if self.inc_ref {
            flags |= FLAG_INC_REF;
        }
        if self.block_map {
            flags |= FLAG_BLOCK_MAP;
        }
        buf[18] = flags;
    }

    fn decode(buf: &[u8]) -> Self {
        let old: &[u8; MAPPING_ENTRY_SIZE] = buf[8..13].try_into().unwrap();
        let new: &[u8; MAPPING_ENTRY_SIZE] = buf[13..18].try_into().unwrap();
        Self {
            key: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            old: DataLocation::unpack(old),
            new: DataLocation::unpack(new),
            inc_ref: buf[18] & FLAG_INC_REF != 0,
            block_map: buf[18] & FLAG_BLOCK_MAP != 0,
        }
    }
}

// ============================================================================
// Block Codec
// ============================================================================

/// Decoded journal block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalBlock {
    /// Block sequence number
    pub sequence: SequenceNumber,
    /// Journal head as of this commit
    pub head: SequenceNumber,
    /// Logical blocks mapped as of this commit
    pub logical_blocks_used: u64,
    /// Tree pages allocated as of this commit
    pub block_map_data_blocks: u64,
    /// Entries in commit order
    pub entries: Vec<JournalEntry>,
}

/// Encode a journal block.
pub fn encode_block(buf: &mut [u8], nonce: Nonce, size: BlockCount, block: &JournalBlock) {
    debug_assert_eq!(buf.len(), BLOCK_SIZE);
    debug_assert!(block.entries.len() <= ENTRIES_PER_JOURNAL_BLOCK);
    buf.fill(0);
    buf[0..8].copy_from_slice(&nonce.to_le_bytes());
    buf[8..16].copy_from_slice(&block.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&block.head.to_le_bytes());
    buf[24..32].copy_from_slice(&block.logical_blocks_used.to_le_bytes());
    buf[32..40].copy_from_slice(&block.block_map_data_blocks.to_le_bytes());
    buf[40..42].copy_from_slice(&(block.entries.len() as u16).to_le_bytes());
    buf[42] = check_byte(block.sequence, size);
    let mut offset = JOURNAL_HEADER_SIZE;
    for entry in &block.entries {
        entry.encode(&mut buf[offset..offset + JOURNAL_ENTRY_SIZE]);
        offset += JOURNAL_ENTRY_SIZE;
    }
}

/// Decode whatever valid block occupies `slot`, whichever lap wrote it.
/// `Ok(None)` for a slot that holds nothing of ours; `CorruptJournal`
/// for a block that validates but cannot be real.
pub fn probe_block(
    buf: &[u8],
    nonce: Nonce,
    size: BlockCount,
    slot: u64,
) -> CdsResult<Option<JournalBlock>> {
    let block_nonce = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let block_sequence = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    if block_nonce != nonce || block_sequence % size != slot {
        return Ok(None);
    }
    decode_at(buf, size, block_sequence)
}

/// Decode a journal block that is expected to hold `sequence`. Returns
/// `Ok(None)` for a block that is simply from another lap (or never
/// written), and `CorruptJournal` for a block that claims the sequence
/// but cannot.
pub fn decode_block(
    buf: &[u8],
    nonce: Nonce,
    size: BlockCount,
    sequence: SequenceNumber,
) -> CdsResult<Option<JournalBlock>> {
    let block_nonce = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let block_sequence = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    if block_nonce != nonce || block_sequence != sequence {
        return Ok(None);
    }
    decode_at(buf, size, sequence)
}

fn decode_at(
    buf: &[u8],
    size: BlockCount,
    sequence: SequenceNumber,
) -> CdsResult<Option<JournalBlock>> {
    if buf[42] != check_byte(sequence, size) {
        return Ok(None);
    }
    let entry_count = u16::from_le_bytes(buf[40..42].try_into().unwrap()) as usize;
    if entry_count > ENTRIES_PER_JOURNAL_BLOCK {
        return Err(CdsError::CorruptJournal);
    }
    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = JOURNAL_HEADER_SIZE;
    for _ in 0..entry_count {
        entries.push(JournalEntry::decode(&buf[offset..offset + JOURNAL_ENTRY_SIZE]));
        offset += JOURNAL_ENTRY_SIZE;
    }
    Ok(Some(JournalBlock {
        sequence,
        head: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        logical_blocks_used: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        block_map_data_blocks: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        entries,
    }))
}
