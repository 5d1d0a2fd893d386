//! Per-slab circular change log.
//!
//! Every reference-count change is journaled here before the counters are
//! written back, tagged with the recovery-journal point that authorized
//! it. The tail block is pushed out once the flushing threshold is
//! reached; past the blocking threshold new entries stall until reaping
//! frees space. Reaping writes the dirty counter blocks first so a
//! journal entry's effect is never durable only in the counters.

use alloc::vec;
use alloc::vec::Vec;

use crate::core::{
    BlockCount, CdsError, CdsResult, JournalPoint, Nonce, Pbn, SequenceNumber, SlabBlockNumber,
};
use crate::config::SlabJournalThresholds;
use crate::device::BlockDevice;
use crate::pipeline::Action;
use crate::slab::RefOp;
use crate::util::WaitQueue;
use crate::BLOCK_SIZE;

// ============================================================================
// On-Disk Format
// ============================================================================

/// Slab-journal block header size.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 32;

/// Packed entry size.
pub const SLAB_JOURNAL_ENTRY_SIZE: usize = 16;

/// Entries per slab-journal block.
pub const ENTRIES_PER_SLAB_BLOCK: usize =
    (BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / SLAB_JOURNAL_ENTRY_SIZE;

static_assertions::const_assert_eq!(ENTRIES_PER_SLAB_BLOCK, 254);

/// One slab-journal entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabJournalEntry {
    /// Slab block the change applies to
    pub sbn: SlabBlockNumber,
    /// The change
    pub op: RefOp,
    /// Recovery-journal point that authorized it
    pub recovery_point: JournalPoint,
}

impl SlabJournalEntry {
    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sbn.to_le_bytes());
        buf[4] = self.op as u8;
        buf[6..8].copy_from_slice(&self.recovery_point.entry.to_le_bytes());
        buf[8..16].copy_from_slice(&self.recovery_point.sequence.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> CdsResult<Self> {
        Ok(Self {
            sbn: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            op: RefOp::from_raw(buf[4])?,
            recovery_point: JournalPoint::new(
                u64::from_le_bytes(buf[8..16].try_into().unwrap()),
                u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            ),
        })
    }
}

/// A decoded slab-journal block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabJournalBlock {
    pub sequence: SequenceNumber,
    pub head: SequenceNumber,
    pub has_block_map_increments: bool,
    pub entries: Vec<SlabJournalEntry>,
}

fn encode_block(buf: &mut [u8], nonce: Nonce, block: &SlabJournalBlock) {
    debug_assert!(block.entries.len() <= ENTRIES_PER_SLAB_BLOCK);
    buf.fill(0);
    buf[0..8].copy_from_slice(&nonce.to_le_bytes());
    buf[8..16].copy_from_slice(&block.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&block.head.to_le_bytes());
    buf[24..26].copy_from_slice(&(block.entries.len() as u16).to_le_bytes());
    buf[26] = block.has_block_map_increments as u8;
    let mut offset = SLAB_JOURNAL_HEADER_SIZE;
    for entry in &block.entries {
        entry.encode(&mut buf[offset..offset + SLAB_JOURNAL_ENTRY_SIZE]);
        offset += SLAB_JOURNAL_ENTRY_SIZE;
    }
}

/// Decode the block in `buf` if it is a valid block for `slot` of a
/// journal of `size` blocks. `Ok(None)` means "not ours" (stale or never
/// written); a block that claims a slot it cannot hold or an impossible
/// entry count is `CorruptJournal`.
pub fn decode_slab_block(
    buf: &[u8],
    nonce: Nonce,
    size: BlockCount,
    slot: u64,
) -> CdsResult<Option<SlabJournalBlock>> {
    let block_nonce = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    if block_nonce != nonce {
        return Ok(None);
    }
    let sequence = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    if sequence == 0 || sequence % size != slot {
        return Ok(None);
    }
    let entry_count = u16::from_le_bytes(buf[24..26].try_into().unwrap()) as usize;
    if entry_count > ENTRIES_PER_SLAB_BLOCK {
        return Err(CdsError::CorruptJournal);
    }
    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = SLAB_JOURNAL_HEADER_SIZE;
    for _ in 0..entry_count {
        entries.push(SlabJournalEntry::decode(
            &buf[offset..offset + SLAB_JOURNAL_ENTRY_SIZE],
        )?);
        offset += SLAB_JOURNAL_ENTRY_SIZE;
    }
    Ok(Some(SlabJournalBlock {
        sequence,
        head: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        has_block_map_increments: buf[26] != 0,
        entries,
    }))
}

// ============================================================================
// Runtime
// ============================================================================

/// Outcome of a slab-journal append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabAppendOutcome {
    /// Entry recorded at this slab-journal point
    Appended(JournalPoint),
    /// Journal at the blocking threshold; waiter parked
    Parked,
}

/// Slab-journal counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlabJournalStats {
    pub entries: u64,
    pub blocks_written: u64,
    pub blocked_appends: u64,
    pub flushes: u64,
}

/// The circular journal of one slab.
pub struct SlabJournal {
    nonce: Nonce,
    /// First journal block (the slab origin)
    origin: Pbn,
    size: BlockCount,
    thresholds: SlabJournalThresholds,
    /// Oldest sequence whose counter effects are not yet durable
    head: SequenceNumber,
    /// Sequence of the active tail block
    tail: SequenceNumber,
    active: Vec<SlabJournalEntry>,
    active_has_block_map: bool,
    /// Recovery sequences to release when the active block commits
    active_recovery_seqs: Vec<SequenceNumber>,
    /// Highest recovery point durably recorded in this journal
    recovery_fence: JournalPoint,
    blocked_waiters: WaitQueue<Action>,
    pub stats: SlabJournalStats,
}

impl SlabJournal {
    /// Fresh journal starting at sequence 1.
    pub fn new(nonce: Nonce, origin: Pbn, size: BlockCount, thresholds: SlabJournalThresholds) -> Self {
        Self {
            nonce,
            origin,
            size,
            thresholds,
            head: 1,
            tail: 1,
            active: Vec::new(),
            active_has_block_map: false,
            active_recovery_seqs: Vec::new(),
            recovery_fence: JournalPoint::zero(),
            blocked_waiters: WaitQueue::new(),
            stats: SlabJournalStats::default(),
        }
    }

    /// Blocks between head and the active tail.
    #[inline]
    pub fn depth(&self) -> BlockCount {
        self.tail - self.head
    }

    /// Highest recovery point already recorded durably; recovery replay
    /// must skip entries at or before this.
    #[inline]
    pub fn recovery_fence(&self) -> JournalPoint {
        self.recovery_fence
    }

    /// Is a crashed slab's journal deep enough to demand scrubbing?
    #[inline]
    pub fn demands_scrubbing(&self) -> bool {
        self.depth() >= self.thresholds.scrubbing
    }

    /// Should the tail block be pushed out proactively?
    pub fn wants_flush(&self) -> bool {
        !self.active.is_empty()
            && (self.depth() >= self.thresholds.flushing
                || self.active.len() >= ENTRIES_PER_SLAB_BLOCK)
    }

    /// The slab-journal point the next entry would get.
    #[inline]
    pub fn next_point(&self) -> JournalPoint {
        JournalPoint::new(self.tail, self.active.len() as u16)
    }

    /// Are there entries buffered in the tail block?
    #[inline]
    pub fn has_pending_entries(&self) -> bool {
        !self.active.is_empty()
    }

    /// Append a change. Past the blocking threshold the waiter parks
    /// until space is reaped.
    pub fn append(&mut self, entry: SlabJournalEntry, waiter: Action) -> SlabAppendOutcome {
        if self.depth() >= self.thresholds.blocking && self.active.is_empty() {
            self.stats.blocked_appends += 1;
            self.blocked_waiters.enqueue(waiter);
            return SlabAppendOutcome::Parked;
        }
        let point = self.next_point();
        if entry.op.is_block_map() && entry.op.is_increment() {
            self.active_has_block_map = true;
        }
        if entry.recovery_point.is_valid() {
            self.active_recovery_seqs.push(entry.recovery_point.sequence);
        }
        self.active.push(entry);
        self.stats.entries += 1;
        if self.active.len() >= ENTRIES_PER_SLAB_BLOCK {
            // Full tail block; the caller commits via wants_flush.
        }
        SlabAppendOutcome::Appended(point)
    }

    /// Write out the active tail block. Returns the recovery sequences
    /// whose physical-zone journal locks may now be released.
    pub fn commit(&mut self, device: &dyn BlockDevice) -> CdsResult<Vec<SequenceNumber>> {
        if self.active.is_empty() {
            return Ok(Vec::new());
        }
        let block = SlabJournalBlock {
            sequence: self.tail,
            head: self.head,
            has_block_map_increments: self.active_has_block_map,
            entries: core::mem::take(&mut self.active),
        };
        let mut buf = vec![0u8; BLOCK_SIZE];
        encode_block(&mut buf, self.nonce, &block);
        let pbn = self.origin + (self.tail % self.size);
        device.write_block(pbn, &buf, true)?;
        self.stats.blocks_written += 1;
        self.tail += 1;
        self.active_has_block_map = false;
        Ok(core::mem::take(&mut self.active_recovery_seqs))
    }

    /// Release journal space after the counter blocks covering entries up
    /// to the tail are durable. Wakes parked appenders.
    pub fn reap(&mut self) -> Vec<Action> {
        if self.head == self.tail {
            return Vec::new();
        }
        self.stats.flushes += 1;
        self.head = self.tail;
        self.blocked_waiters.notify_all().into_iter().collect()
    }

    /// Scan the on-disk journal: find the durable head/tail window and
    /// return its blocks in sequence order. Also restores the recovery
    /// fence and the next sequence to use.
    pub fn scan(&mut self, device: &dyn BlockDevice) -> CdsResult<Vec<SlabJournalBlock>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut newest: Option<SlabJournalBlock> = None;
        let mut by_sequence: Vec<SlabJournalBlock> = Vec::new();
        for slot in 0..self.size {
            device.read_block(self.origin + slot, &mut buf)?;
            if let Some(block) = decode_slab_block(&buf, self.nonce, self.size, slot)? {
                if newest.as_ref().map_or(true, |n| block.sequence > n.sequence) {
                    newest = Some(block.clone());
                }
                by_sequence.push(block);
            }
        }
        let Some(newest) = newest else {
            self.head = 1;
            self.tail = 1;
            return Ok(Vec::new());
        };

        // Only blocks in [head of newest, newest] are live; anything else
        // is from an already reaped generation.
        let head = newest.head;
        let tail = newest.sequence + 1;
        by_sequence.retain(|b| b.sequence >= head && b.sequence < tail);
        by_sequence.sort_by_key(|b| b.sequence);
        for block in &by_sequence {
            for entry in &block.entries {
                if entry.recovery_point.is_after(&self.recovery_fence) {
                    self.recovery_fence = entry.recovery_point;
                }
            }
        }
        self.head = head;
        self.tail = tail;
        Ok(by_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VioId;
    use crate::device::RamDevice;
    use crate::pipeline::Op;

    fn thresholds() -> SlabJournalThresholds {
        SlabJournalThresholds {
            flushing: 2,
            blocking: 3,
            scrubbing: 2,
        }
    }

    fn entry(sbn: u32, op: RefOp, seq: u64, index: u16) -> SlabJournalEntry {
        SlabJournalEntry {
            sbn,
            op,
            recovery_point: JournalPoint::new(seq, index),
        }
    }

    fn waiter() -> Action {
        Action::new(VioId(1), Op::JournalIncrement)
    }

    #[test]
    fn test_append_commit_scan_round_trip() {
        let device = RamDevice::new(64);
        let mut journal = SlabJournal::new(9, 4, 4, thresholds());
        journal.append(entry(5, RefOp::DataIncrement, 3, 0), waiter());
        journal.append(entry(6, RefOp::BlockMapIncrement, 3, 1), waiter());
        let released = journal.commit(&device).unwrap();
        assert_eq!(released, [3, 3]);
        assert_eq!(journal.depth(), 1);

        let mut fresh = SlabJournal::new(9, 4, 4, thresholds());
        let blocks = fresh.scan(&device).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].has_block_map_increments);
        assert_eq!(blocks[0].entries.len(), 2);
        assert_eq!(fresh.recovery_fence(), JournalPoint::new(3, 1));
        // The next sequence continues past what is on disk.
        assert_eq!(fresh.next_point().sequence, 2);
    }

    #[test]
    fn test_blocking_threshold_parks() {
        let device = RamDevice::new(64);
        let mut journal = SlabJournal::new(9, 4, 8, thresholds());
        for seq in 1..=3u64 {
            journal.append(entry(1, RefOp::DataIncrement, seq, 0), waiter());
            journal.commit(&device).unwrap();
        }
        assert_eq!(journal.depth(), 3);
        assert_eq!(
            journal.append(entry(2, RefOp::DataIncrement, 9, 0), waiter()),
            SlabAppendOutcome::Parked
        );
        let woken = journal.reap();
        assert_eq!(woken.len(), 1);
        assert_eq!(journal.depth(), 0);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let device = RamDevice::new(64);
        let mut journal = SlabJournal::new(9, 4, 2, thresholds());
        // Write sequences 1..=4; slots recycle twice, heads advance.
        for seq in 1..=4u64 {
            journal.append(entry(seq as u32, RefOp::DataIncrement, seq, 0), waiter());
            journal.commit(&device).unwrap();
            if seq == 2 {
                journal.reap();
            }
        }
        let mut fresh = SlabJournal::new(9, 4, 2, thresholds());
        let blocks = fresh.scan(&device).unwrap();
        // Only the live window [3, 4] survives.
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].sequence, 3);
        assert_eq!(blocks[1].sequence, 4);
    }

    #[test]
    fn test_wants_flush_at_threshold() {
        let device = RamDevice::new(64);
        let mut journal = SlabJournal::new(9, 4, 8, thresholds());
        journal.append(entry(1, RefOp::DataIncrement, 1, 0), waiter());
        assert!(!journal.wants_flush());
        journal.commit(&device).unwrap();
        journal.append(entry(1, RefOp::DataIncrement, 2, 0), waiter());
        journal.commit(&device).unwrap();
        // Depth two reaches the flushing threshold.
        journal.append(entry(1, RefOp::DataIncrement, 3, 0), waiter());
        assert!(journal.wants_flush());
    }
}
