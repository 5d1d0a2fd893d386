//! Recovery journal runtime.
//!
//! Entries accumulate in a bounded pool of in-memory tail blocks. A block
//! is sealed when full or at commit time; sealed blocks are committed to
//! disk in ascending sequence with FUA, and a block's waiters are only
//! woken once their entries are durable. Back-pressure is explicit: a
//! caller that cannot get a tail buffer parks on the pool queue
//! (commit completion), and one that cannot get on-disk space parks on
//! the reap queue. Reaping advances the head past blocks whose multi-zone
//! lock counts have all reached zero.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::core::{
    BlockCount, CdsResult, JournalPoint, Nonce, Pbn, SequenceNumber, ZoneCount,
};
use crate::device::BlockDevice;
use crate::journal::lock_counter::{LockCounter, ZoneType};
use crate::journal::{encode_block, JournalBlock, JournalEntry, ENTRIES_PER_JOURNAL_BLOCK};
use crate::pipeline::Action;
use crate::util::WaitQueue;
use crate::BLOCK_SIZE;

// ============================================================================
// Tail Blocks
// ============================================================================

struct TailBlock {
    sequence: SequenceNumber,
    entries: Vec<JournalEntry>,
    /// Waiters for this block's durability, with their entry index
    waiters: Vec<(Action, u16)>,
}

impl TailBlock {
    fn new(sequence: SequenceNumber) -> Self {
        Self {
            sequence,
            entries: Vec::with_capacity(ENTRIES_PER_JOURNAL_BLOCK),
            waiters: Vec::new(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entry recorded at this journal point
    Appended(JournalPoint),
    /// No buffer or no space; the waiter was parked
    Parked,
}

/// Journal counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryJournalStats {
    pub entries_appended: u64,
    pub blocks_committed: u64,
    pub commits: u64,
    pub pool_waits: u64,
    pub space_waits: u64,
    pub reaps: u64,
}

// ============================================================================
// Recovery Journal
// ============================================================================

/// The global mapping-delta journal.
pub struct RecoveryJournal {
    nonce: Nonce,
    origin: Pbn,
    size: BlockCount,
    tail_pool: usize,
    /// Barrier the device before each commit batch so every data write a
    /// journal entry references is durable first. Elided only by the
    /// unsafe write policy.
    preflush: bool,
    /// Oldest sequence still needed
    head: SequenceNumber,
    /// Sequence the next opened block will carry
    tail: SequenceNumber,
    active: Option<TailBlock>,
    pending: VecDeque<TailBlock>,
    /// Highest sequence committed to disk (contiguous from below)
    committed_through: SequenceNumber,
    pool_waiters: WaitQueue<Action>,
    space_waiters: WaitQueue<Action>,
    lock_counter: LockCounter,
    /// Logical blocks currently mapped
    pub logical_blocks_used: u64,
    /// Tree pages currently allocated
    pub block_map_data_blocks: u64,
    pub stats: RecoveryJournalStats,
}

impl RecoveryJournal {
    /// Create a journal whose next sequence is `tail`.
    pub fn new(
        nonce: Nonce,
        origin: Pbn,
        size: BlockCount,
        tail_pool: usize,
        logical_zones: ZoneCount,
        physical_zones: ZoneCount,
        tail: SequenceNumber,
    ) -> Self {
        Self {
            nonce,
            origin,
            size,
            tail_pool,
            preflush: true,
            head: tail,
            tail,
            active: None,
            pending: VecDeque::new(),
            committed_through: tail - 1,
            pool_waiters: WaitQueue::new(),
            space_waiters: WaitQueue::new(),
            lock_counter: LockCounter::new(size as usize, logical_zones, physical_zones),
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            stats: RecoveryJournalStats::default(),
        }
    }

    /// Elide the pre-commit barrier (the unsafe write policy's explicit
    /// trade of durability for throughput).
    pub fn set_preflush(&mut self, preflush: bool) {
        self.preflush = preflush;
    }

    /// Oldest active sequence.
    #[inline]
    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    /// Next sequence to open.
    #[inline]
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Are appenders parked waiting for reaped space?
    #[inline]
    pub fn has_space_waiters(&self) -> bool {
        !self.space_waiters.is_empty()
    }

    /// Restore the used-block counters after replay.
    pub fn set_counters(&mut self, logical_blocks_used: u64, block_map_data_blocks: u64) {
        self.logical_blocks_used = logical_blocks_used;
        self.block_map_data_blocks = block_map_data_blocks;
    }

    /// Restart the journal empty at `tail` once replay has reapplied
    /// everything the old window held.
    pub fn reset_after_replay(&mut self, tail: SequenceNumber) {
        debug_assert!(self.is_quiescent());
        self.head = tail;
        self.tail = tail;
        self.committed_through = tail - 1;
        self.active = None;
        self.lock_counter = LockCounter::new(
            self.size as usize,
            self.lock_counter_logical_zones(),
            self.lock_counter_physical_zones(),
        );
    }

    fn lock_counter_logical_zones(&self) -> ZoneCount {
        self.lock_counter.logical_zones() as ZoneCount
    }

    fn lock_counter_physical_zones(&self) -> ZoneCount {
        self.lock_counter.physical_zones() as ZoneCount
    }

    /// No entries buffered or awaiting commit?
    pub fn is_quiescent(&self) -> bool {
        self.pending.is_empty()
            && self.active.as_ref().map_or(true, |b| b.entries.is_empty())
            && self.pool_waiters.is_empty()
            && self.space_waiters.is_empty()
    }

    /// Append one entry. On back-pressure the `retry` action parks (and
    /// later re-enqueues so the caller re-attempts the append); on
    /// success the optional `committed` action parks until the entry is
    /// durable.
    pub fn append(
        &mut self,
        entry: JournalEntry,
        retry: Action,
        committed: Option<Action>,
    ) -> AppendOutcome {
        if self.active.is_none() {
            if self.tail - self.head >= self.size {
                self.stats.space_waits += 1;
                self.space_waiters.enqueue(retry);
                return AppendOutcome::Parked;
            }
            if self.pending.len() + 1 > self.tail_pool {
                self.stats.pool_waits += 1;
                self.pool_waiters.enqueue(retry);
                return AppendOutcome::Parked;
            }
            self.active = Some(TailBlock::new(self.tail));
            // Per-sequence reference, held until the final commit.
            self.lock_counter.acquire(ZoneType::Journal, 0, self.tail);
        }

        let block = self.active.as_mut().unwrap();
        let index = block.entries.len() as u16;
        let point = JournalPoint::new(block.sequence, index);
        // Per-entry reference, held until the block-map update lands in
        // memory.
        self.lock_counter
            .acquire(ZoneType::Journal, 0, block.sequence);
        block.entries.push(entry);
        self.stats.entries_appended += 1;

        if entry.block_map {
            self.block_map_data_blocks += 1;
        } else if entry.new.is_mapped() && !entry.old.is_mapped() {
            self.logical_blocks_used += 1;
        } else if !entry.new.is_mapped() && entry.old.is_mapped() {
            self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1);
        }

        if let Some(committed) = committed {
            block.waiters.push((committed, index));
        }
        if block.entries.len() == ENTRIES_PER_JOURNAL_BLOCK {
            self.seal();
        }
        AppendOutcome::Appended(point)
    }

    fn seal(&mut self) {
        if let Some(block) = self.active.take() {
            debug_assert_eq!(block.sequence, self.tail);
            self.tail += 1;
            self.pending.push_back(block);
        }
    }

    /// Seal the active block (if it has entries) and commit every sealed
    /// block in sequence order. Returns the waiters to re-enqueue.
    pub fn commit(&mut self, device: &dyn BlockDevice) -> CdsResult<Vec<Action>> {
        if self
            .active
            .as_ref()
            .is_some_and(|block| !block.entries.is_empty())
        {
            self.seal();
        }
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        // Order every referenced data write ahead of the journal blocks.
        if self.preflush {
            device.flush()?;
        }
        self.stats.commits += 1;
        let mut woken = Vec::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        while let Some(mut block) = self.pending.pop_front() {
            let pbn = self.origin + (block.sequence & (self.size - 1));
            let on_disk = JournalBlock {
                sequence: block.sequence,
                head: self.head,
                logical_blocks_used: self.logical_blocks_used,
                block_map_data_blocks: self.block_map_data_blocks,
                entries: core::mem::take(&mut block.entries),
            };
            encode_block(&mut buf, self.nonce, self.size, &on_disk);
            device.write_block(pbn, &buf, true)?;
            self.stats.blocks_committed += 1;
            self.committed_through = block.sequence;

            // The per-sequence reference: this was the last commit.
            self.lock_counter
                .release(ZoneType::Journal, 0, block.sequence);
            woken.extend(block.waiters.drain(..).map(|(action, _)| action));
            // A tail buffer came free.
            if let Some(waiter) = self.pool_waiters.notify_one() {
                woken.push(waiter);
            }
        }
        woken.extend(self.reap());
        Ok(woken)
    }

    /// Abandon all buffered work after a commit failure: every parked
    /// and commit-waiting action comes back so the caller can fail its
    /// request. The journal no longer accepts the lost entries as state.
    pub fn abandon(&mut self) -> Vec<Action> {
        let mut orphans = Vec::new();
        if let Some(mut block) = self.active.take() {
            orphans.extend(block.waiters.drain(..).map(|(action, _)| action));
        }
        while let Some(mut block) = self.pending.pop_front() {
            orphans.extend(block.waiters.drain(..).map(|(action, _)| action));
        }
        orphans.extend(self.pool_waiters.notify_all());
        orphans.extend(self.space_waiters.notify_all());
        orphans
    }

    /// Take a lock on the block holding `sequence` for another zone.
    pub fn acquire_lock(&mut self, zone_type: ZoneType, zone: ZoneCount, sequence: SequenceNumber) {
        self.lock_counter.acquire(zone_type, zone, sequence);
    }

    /// Release a lock; on a zero crossing, reap and return any space
    /// waiters to re-enqueue.
    pub fn release_lock(
        &mut self,
        zone_type: ZoneType,
        zone: ZoneCount,
        sequence: SequenceNumber,
    ) -> Vec<Action> {
        if self.lock_counter.release(zone_type, zone, sequence) {
            self.reap()
        } else {
            Vec::new()
        }
    }

    /// Advance the head past fully unlocked, committed blocks; wake space
    /// waiters on progress.
    fn reap(&mut self) -> Vec<Action> {
        let mut progressed = false;
        while self.head <= self.committed_through && self.lock_counter.is_unlocked(self.head) {
            self.head += 1;
            progressed = true;
        }
        if progressed {
            self.stats.reaps += 1;
            self.space_waiters.notify_all().into_iter().collect()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataLocation, MappingState, VioId};
    use crate::device::RamDevice;
    use crate::journal::decode_block;
    use crate::pipeline::Op;

    fn entry(lbn: u64, pbn: u64) -> JournalEntry {
        JournalEntry {
            key: lbn,
            old: DataLocation::UNMAPPED,
            new: DataLocation::new(pbn, MappingState::Uncompressed),
            inc_ref: true,
            block_map: false,
        }
    }

    fn waiter(n: u32) -> Action {
        Action::new(VioId(n), Op::PutMappedBlock)
    }

    fn journal(size: BlockCount, pool: usize) -> RecoveryJournal {
        RecoveryJournal::new(7, 100, size, pool, 1, 1, 1)
    }

    #[test]
    fn test_append_and_commit() {
        let device = RamDevice::new(256);
        let mut journal = journal(8, 2);
        let outcome = journal.append(entry(1, 50), waiter(1), Some(waiter(1)));
        assert_eq!(outcome, AppendOutcome::Appended(JournalPoint::new(1, 0)));
        let outcome = journal.append(entry(2, 51), waiter(2), Some(waiter(2)));
        assert_eq!(outcome, AppendOutcome::Appended(JournalPoint::new(1, 1)));
        assert_eq!(journal.logical_blocks_used, 2);

        let woken = journal.commit(&device).unwrap();
        assert_eq!(woken.len(), 2);
        assert_eq!(journal.tail(), 2);

        // The block is on disk, FUA, at origin + 1.
        let block = device.durable_block(101);
        let decoded = decode_block(&block, 7, 8, 1).unwrap().unwrap();
        assert_eq!(decoded.entries.len(), 2);
    }

    #[test]
    fn test_pool_exhaustion_parks() {
        let device = RamDevice::new(256);
        let mut journal = journal(8, 1);
        assert!(matches!(
            journal.append(entry(1, 50), waiter(1), Some(waiter(1))),
            AppendOutcome::Appended(_)
        ));
        // Fill and seal the only buffer.
        for i in 1..ENTRIES_PER_JOURNAL_BLOCK as u64 {
            assert!(matches!(
                journal.append(entry(i + 1, 50 + i), waiter(1), None),
                AppendOutcome::Appended(_)
            ));
        }
        // Buffer sealed, pool of one exhausted.
        assert_eq!(
            journal.append(entry(999, 99), waiter(9), Some(waiter(9))),
            AppendOutcome::Parked
        );
        assert_eq!(journal.stats.pool_waits, 1);
        // Commit frees the buffer and hands the waiter back.
        let woken = journal.commit(&device).unwrap();
        assert!(woken.contains(&waiter(9)));
    }

    #[test]
    fn test_space_exhaustion_parks_until_reap() {
        let device = RamDevice::new(256);
        let mut journal = journal(2, 4);
        // Two sequences with an extra per-entry lock held (block-map
        // update not yet applied).
        for seq in 1..=2u64 {
            assert!(matches!(
                journal.append(entry(seq, 50 + seq), waiter(seq as u32), Some(waiter(seq as u32))),
                AppendOutcome::Appended(_)
            ));
            journal.commit(&device).unwrap();
        }
        assert_eq!(journal.tail() - journal.head(), 2);
        // Window full: the next append parks.
        assert_eq!(
            journal.append(entry(3, 60), waiter(3), Some(waiter(3))),
            AppendOutcome::Parked
        );
        assert_eq!(journal.stats.space_waits, 1);

        // Applying the first block-map update releases its per-entry
        // lock; the head advances and the space waiter wakes.
        let woken = journal.release_lock(ZoneType::Journal, 0, 1);
        assert!(woken.contains(&waiter(3)));
        assert_eq!(journal.head(), 2);
        // Room again: the retried append succeeds.
        assert!(matches!(
            journal.append(entry(3, 60), waiter(3), Some(waiter(3))),
            AppendOutcome::Appended(_)
        ));
        journal.release_lock(ZoneType::Journal, 0, 2);
        assert_eq!(journal.head(), 3);
    }

    #[test]
    fn test_reap_blocked_by_any_zone() {
        let device = RamDevice::new(256);
        let mut journal = journal(4, 2);
        journal.append(entry(1, 50), waiter(1), Some(waiter(1)));
        // A logical zone protects this sequence (a dirty page).
        journal.acquire_lock(ZoneType::Logical, 0, 1);
        journal.commit(&device).unwrap();
        // The per-entry lock drops, but the page still pins the block.
        journal.release_lock(ZoneType::Journal, 0, 1);
        assert_eq!(journal.head(), 1);
        // Page write-back releases the last reference.
        journal.release_lock(ZoneType::Logical, 0, 1);
        assert_eq!(journal.head(), 2);
    }

    #[test]
    fn test_unmapping_adjusts_used_count() {
        let device = RamDevice::new(256);
        let mut journal = journal(8, 2);
        journal.append(entry(1, 50), waiter(1), None);
        assert_eq!(journal.logical_blocks_used, 1);
        let unmap = JournalEntry {
            key: 1,
            old: DataLocation::new(50, MappingState::Uncompressed),
            new: DataLocation::UNMAPPED,
            inc_ref: false,
            block_map: false,
        };
        journal.append(unmap, waiter(1), None);
        assert_eq!(journal.logical_blocks_used, 0);
        journal.commit(&device).unwrap();
        assert!(journal.is_quiescent());
    }
}
