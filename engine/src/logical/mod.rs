//! Logical zones: LBN locks.
//!
//! Within one LBN all updates are serialized by a lock held for the
//! duration of one logical operation. Contention policy: a read arriving
//! while a write that has already allocated holds the lock may
//! short-circuit by copying from the writer's buffer; any other waiter
//! parks FIFO, and the blocking write is cancelled out of the packer so
//! it cannot sit in a half-full bin indefinitely.

use crate::core::{Lbn, VioId, ZoneCount};
use crate::pipeline::Action;
use crate::util::{IntMap, WaitQueue};

// ============================================================================
// LBN Locks
// ============================================================================

struct LbnLock {
    holder: VioId,
    holder_is_write: bool,
    /// The writer's buffer already holds the final data
    holder_allocated: bool,
    waiters: WaitQueue<Action>,
}

/// Outcome of a lock attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum LbnLockOutcome {
    /// Lock taken
    Acquired,
    /// Parked behind `holder`; the caller cancels the holder out of the
    /// packer
    Parked {
        /// Current lock holder
        holder: VioId,
        /// Holder is a write that should be pulled out of the packer
        cancel_holder_packing: bool,
    },
    /// Read satisfied directly from the allocated writer's buffer
    ReadFromWriter(VioId),
}

/// Logical-zone counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogicalZoneStats {
    pub locks_taken: u64,
    pub contentions: u64,
    pub read_shortcuts: u64,
}

// ============================================================================
// Logical Zone
// ============================================================================

/// One shard of the LBN space.
pub struct LogicalZone {
    zone: ZoneCount,
    locks: IntMap<LbnLock>,
    pub stats: LogicalZoneStats,
}

impl LogicalZone {
    /// Empty zone.
    pub fn new(zone: ZoneCount) -> Self {
        Self {
            zone,
            locks: IntMap::new(),
            stats: LogicalZoneStats::default(),
        }
    }

    /// This zone's index.
    #[inline]
    pub fn zone(&self) -> ZoneCount {
        self.zone
    }

    /// Try to take the lock for `lbn`.
    pub fn try_lock(
        &mut self,
        lbn: Lbn,
        vio: VioId,
        is_write: bool,
        waiter: Action,
    ) -> LbnLockOutcome {
        match self.locks.get_mut(lbn) {
            None => {
                self.locks.insert(
                    lbn,
                    LbnLock {
                        holder: vio,
                        holder_is_write: is_write,
                        holder_allocated: false,
                        waiters: WaitQueue::new(),
                    },
                );
                self.stats.locks_taken += 1;
                LbnLockOutcome::Acquired
            }
            Some(lock) => {
                self.stats.contentions += 1;
                if !is_write && lock.holder_is_write && lock.holder_allocated {
                    self.stats.read_shortcuts += 1;
                    return LbnLockOutcome::ReadFromWriter(lock.holder);
                }
                let cancel = lock.holder_is_write;
                let holder = lock.holder;
                lock.waiters.enqueue(waiter);
                LbnLockOutcome::Parked {
                    holder,
                    cancel_holder_packing: cancel,
                }
            }
        }
    }

    /// Note that the holding write has its data buffered and allocated.
    pub fn mark_allocated(&mut self, lbn: Lbn) {
        if let Some(lock) = self.locks.get_mut(lbn) {
            lock.holder_allocated = true;
        }
    }

    /// Is anyone parked behind the holder of `lbn`? A holder with
    /// waiters must not linger in the packer.
    pub fn has_waiters(&self, lbn: Lbn) -> bool {
        self.locks
            .get(lbn)
            .map_or(false, |lock| !lock.waiters.is_empty())
    }

    /// Release `vio`'s lock on `lbn`. Every waiter is handed back for a
    /// retry; queue order decides who re-acquires first.
    pub fn unlock(&mut self, lbn: Lbn, vio: VioId) -> alloc::collections::VecDeque<Action> {
        let Some(mut lock) = self.locks.remove(lbn) else {
            return alloc::collections::VecDeque::new();
        };
        debug_assert_eq!(lock.holder, vio);
        lock.waiters.notify_all()
    }

    /// Locks currently held.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
