//! Hash zones and hash locks.
//!
//! Concurrent writes of identical data rendezvous on a hash lock keyed
//! by chunk name. The first arrival becomes the agent and runs the full
//! dedupe/write path; later arrivals park on the lock and, once the
//! agent's mapping is durable, share its block by journaling an
//! increment against it (after verifying the data, since names can
//! collide).

use alloc::collections::VecDeque;
use hashbrown::HashMap;

use crate::core::{DataLocation, VioId, ZoneCount};
use crate::dedupe::ChunkName;
use crate::pipeline::Action;
use crate::util::WaitQueue;

// ============================================================================
// Hash Locks
// ============================================================================

/// Where the agent is in its journey.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashLockState {
    /// Agent querying the index
    Querying,
    /// Agent verifying advice against the advised block
    Verifying,
    /// Agent writing its own copy
    Writing,
    /// Agent finished; result available to sharers
    Available,
}

struct HashLock {
    agent: VioId,
    state: HashLockState,
    /// Where the data landed, once the agent finished
    result: Option<DataLocation>,
    waiters: WaitQueue<Action>,
    holders: u32,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of acquiring a hash lock.
#[derive(Debug, PartialEq, Eq)]
pub enum HashLockOutcome {
    /// First arrival: run the dedupe/write path
    Agent,
    /// Agent still working: parked on the lock
    Parked,
    /// Agent finished with this result
    Available(Option<DataLocation>),
}

/// Hash-lock counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashZoneStats {
    pub locks_created: u64,
    pub concurrent_waits: u64,
    pub advice_valid: u64,
    pub advice_stale: u64,
    pub advice_timeouts: u64,
    pub dedupe_shares: u64,
}

// ============================================================================
// Hash Zone
// ============================================================================

/// One shard of the chunk-name space.
pub struct HashZone {
    zone: ZoneCount,
    locks: HashMap<ChunkName, HashLock>,
    pub stats: HashZoneStats,
}

impl HashZone {
    /// Empty zone.
    pub fn new(zone: ZoneCount) -> Self {
        Self {
            zone,
            locks: HashMap::new(),
            stats: HashZoneStats::default(),
        }
    }

    /// This zone's index.
    #[inline]
    pub fn zone(&self) -> ZoneCount {
        self.zone
    }

    /// Acquire the lock for `name`. A parked waiter is re-enqueued when
    /// the agent publishes its result.
    pub fn acquire(&mut self, name: ChunkName, vio: VioId, waiter: Action) -> HashLockOutcome {
        match self.locks.get_mut(&name) {
            None => {
                self.locks.insert(
                    name,
                    HashLock {
                        agent: vio,
                        state: HashLockState::Querying,
                        result: None,
                        waiters: WaitQueue::new(),
                        holders: 1,
                    },
                );
                self.stats.locks_created += 1;
                HashLockOutcome::Agent
            }
            Some(lock) => {
                lock.holders += 1;
                if lock.state == HashLockState::Available {
                    HashLockOutcome::Available(lock.result)
                } else {
                    self.stats.concurrent_waits += 1;
                    lock.waiters.enqueue(waiter);
                    HashLockOutcome::Parked
                }
            }
        }
    }

    /// Record the agent's progress.
    pub fn set_state(&mut self, name: &ChunkName, state: HashLockState) {
        if let Some(lock) = self.locks.get_mut(name) {
            lock.state = state;
        }
    }

    /// The agent finished: publish where the data lives (None when the
    /// write failed) and wake every waiter.
    pub fn publish(&mut self, name: &ChunkName, result: Option<DataLocation>) -> VecDeque<Action> {
        match self.locks.get_mut(name) {
            Some(lock) => {
                lock.state = HashLockState::Available;
                lock.result = result;
                lock.waiters.notify_all()
            }
            None => VecDeque::new(),
        }
    }

    /// The published result of an available lock, if any.
    pub fn result_of(&self, name: &ChunkName) -> Option<DataLocation> {
        self.locks
            .get(name)
            .filter(|lock| lock.state == HashLockState::Available)
            .and_then(|lock| lock.result)
    }

    /// Drop one holder; the lock disappears with the last one.
    pub fn release(&mut self, name: &ChunkName) {
        let Some(lock) = self.locks.get_mut(name) else {
            return;
        };
        debug_assert!(lock.holders > 0);
        lock.holders -= 1;
        if lock.holders == 0 {
            self.locks.remove(name);
        }
    }

    /// Outstanding locks.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MappingState;
    use crate::pipeline::Op;

    fn name(b: u8) -> ChunkName {
        ChunkName([b; 16])
    }

    fn action(v: u32) -> Action {
        Action::new(VioId(v), Op::CheckForDuplication)
    }

    #[test]
    fn test_first_arrival_is_agent() {
        let mut zone = HashZone::new(0);
        assert_eq!(
            zone.acquire(name(1), VioId(1), action(1)),
            HashLockOutcome::Agent
        );
        assert_eq!(zone.lock_count(), 1);
    }

    #[test]
    fn test_waiters_park_then_share_result() {
        let mut zone = HashZone::new(0);
        zone.acquire(name(1), VioId(1), action(1));
        assert_eq!(
            zone.acquire(name(1), VioId(2), action(2)),
            HashLockOutcome::Parked
        );
        let loc = DataLocation::new(77, MappingState::Uncompressed);
        let woken = zone.publish(&name(1), Some(loc));
        assert_eq!(woken.len(), 1);
        // A later arrival sees the published result directly.
        assert_eq!(
            zone.acquire(name(1), VioId(3), action(3)),
            HashLockOutcome::Available(Some(loc))
        );
    }

    #[test]
    fn test_lock_freed_with_last_holder() {
        let mut zone = HashZone::new(0);
        zone.acquire(name(1), VioId(1), action(1));
        zone.acquire(name(1), VioId(2), action(2));
        zone.publish(&name(1), None);
        zone.release(&name(1));
        assert_eq!(zone.lock_count(), 1);
        zone.release(&name(1));
        assert_eq!(zone.lock_count(), 0);
        // A fresh acquire starts a new generation.
        assert_eq!(
            zone.acquire(name(1), VioId(3), action(3)),
            HashLockOutcome::Agent
        );
    }

    #[test]
    fn test_distinct_names_do_not_interfere() {
        let mut zone = HashZone::new(0);
        assert_eq!(
            zone.acquire(name(1), VioId(1), action(1)),
            HashLockOutcome::Agent
        );
        assert_eq!(
            zone.acquire(name(2), VioId(2), action(2)),
            HashLockOutcome::Agent
        );
    }
}
