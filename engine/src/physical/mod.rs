//! Physical zones: PBN locks.
//!
//! A physical zone shards the slabs and guards individual PBNs while a
//! deduplicating request verifies a candidate block or an allocating
//! request confirms one. Read locks are shared; a write lock is
//! exclusive and blocks new read locks, which keeps a block from being
//! retargeted while someone is still comparing against it.

use crate::core::{Pbn, VioId, ZoneCount};
use crate::util::IntMap;

// ============================================================================
// PBN Locks
// ============================================================================

/// Lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbnLockKind {
    /// Shared: dedupe verification against the block
    Read,
    /// Exclusive: the block is being (re)written
    Write,
}

struct PbnLock {
    kind: PbnLockKind,
    holders: u32,
}

/// Physical-zone counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalZoneStats {
    pub read_locks: u64,
    pub write_locks: u64,
    pub contentions: u64,
}

// ============================================================================
// Physical Zone
// ============================================================================

/// One shard of the PBN space.
pub struct PhysicalZone {
    zone: ZoneCount,
    locks: IntMap<PbnLock>,
    pub stats: PhysicalZoneStats,
}

impl PhysicalZone {
    /// Empty zone.
    pub fn new(zone: ZoneCount) -> Self {
        Self {
            zone,
            locks: IntMap::new(),
            stats: PhysicalZoneStats::default(),
        }
    }

    /// This zone's index.
    #[inline]
    pub fn zone(&self) -> ZoneCount {
        self.zone
    }

    /// Take a shared read lock on `pbn` for dedupe verification. Fails
    /// against a write lock.
    pub fn lock_read(&mut self, pbn: Pbn, _vio: VioId) -> bool {
        match self.locks.get_mut(pbn) {
            None => {
                self.locks.insert(
                    pbn,
                    PbnLock {
                        kind: PbnLockKind::Read,
                        holders: 1,
                    },
                );
                self.stats.read_locks += 1;
                true
            }
            Some(lock) if lock.kind == PbnLockKind::Read => {
                lock.holders += 1;
                self.stats.read_locks += 1;
                true
            }
            Some(_) => {
                self.stats.contentions += 1;
                false
            }
        }
    }

    /// Drop a read lock.
    pub fn unlock_read(&mut self, pbn: Pbn) {
        if let Some(lock) = self.locks.get_mut(pbn) {
            debug_assert_eq!(lock.kind, PbnLockKind::Read);
            lock.holders -= 1;
            if lock.holders == 0 {
                self.locks.remove(pbn);
            }
        }
    }

    /// Take the exclusive write lock on `pbn`.
    pub fn lock_write(&mut self, pbn: Pbn, _vio: VioId) -> bool {
        if self.locks.contains_key(pbn) {
            self.stats.contentions += 1;
            return false;
        }
        self.locks.insert(
            pbn,
            PbnLock {
                kind: PbnLockKind::Write,
                holders: 1,
            },
        );
        self.stats.write_locks += 1;
        true
    }

    /// Drop the write lock.
    pub fn unlock_write(&mut self, pbn: Pbn) {
        if let Some(lock) = self.locks.get(pbn) {
            debug_assert_eq!(lock.kind, PbnLockKind::Write);
            let _ = lock;
            self.locks.remove(pbn);
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

    #[test]
    fn test_shared_read_locks() {
        let mut zone = PhysicalZone::new(0);
        assert!(zone.lock_read(10, VioId(1)));
        assert!(zone.lock_read(10, VioId(2)));
        zone.unlock_read(10);
        assert_eq!(zone.lock_count(), 1);
        zone.unlock_read(10);
        assert_eq!(zone.lock_count(), 0);
    }

    #[test]
    fn test_write_excludes_read() {
        let mut zone = PhysicalZone::new(0);
        assert!(zone.lock_write(10, VioId(1)));
        assert!(!zone.lock_read(10, VioId(2)));
        assert!(!zone.lock_write(10, VioId(3)));
        zone.unlock_write(10);
        assert!(zone.lock_read(10, VioId(2)));
    }

    #[test]
    fn test_read_excludes_write() {
        let mut zone = PhysicalZone::new(0);
        assert!(zone.lock_read(10, VioId(1)));
        assert!(!zone.lock_write(10, VioId(2)));
    }
}
