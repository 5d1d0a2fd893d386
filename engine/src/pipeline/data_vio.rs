//! Per-request state.
//!
//! A `DataVio` carries everything one logical operation needs as it hops
//! between zones: identity, buffers, the locks it holds, its old and new
//! mapping, compression state, and a sticky result where the first
//! failure is preserved. The pool recycles slots so request identity is
//! a small dense index.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::block_map::TreeSlot;
use crate::core::{
    CdsError, DataLocation, JournalPoint, Lbn, Pbn, VioId, INVALID_PBN,
};
use crate::dedupe::ChunkName;
use crate::pipeline::Op;
use crate::slab::RefOp;
use crate::BLOCK_SIZE;

bitflags! {
    /// Request modifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VioFlags: u8 {
        /// Barrier before the operation
        const FLUSH_BEFORE = 1 << 0;
        /// Durable before acknowledgement
        const FLUSH_AFTER = 1 << 1;
    }
}

/// Operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VioKind {
    Read,
    Write,
}

/// Compression progress of a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VioCompression {
    /// Not attempted (yet)
    Inactive,
    /// Fragment produced, packer involved
    Compressing,
    /// Batch written; mapping points at a compressed slot
    Packed,
    /// Compression declined or cancelled; plain write
    Skipped,
}

// ============================================================================
// Data Vio
// ============================================================================

/// One in-flight request.
pub struct DataVio {
    pub id: VioId,
    pub kind: VioKind,
    pub flags: VioFlags,
    pub lbn: Lbn,
    /// Zone owning the LBN (and its block-map root)
    pub logical_zone: u8,
    /// Zone owning the chunk name, once hashed
    pub hash_zone: u8,
    /// User data: payload on a write, destination on a read
    pub data: Vec<u8>,
    /// Write of the zero block
    pub is_zero: bool,
    /// Sticky result; the first failure wins
    pub result: Option<CdsError>,
    /// Current async-operation tag, for tracing
    pub last_op: Op,
    /// Resolved tree position of the LBN
    pub tree_slot: TreeSlot,
    /// Leaf page holding the mapping
    pub leaf_pbn: Pbn,
    /// Mapping being replaced
    pub old_location: DataLocation,
    /// Mapping being installed
    pub new_location: DataLocation,
    /// Name of the data, once hashed
    pub chunk_name: Option<ChunkName>,
    /// This request holds its chunk name's hash lock
    pub holds_hash_lock: bool,
    /// This request is the hash lock's agent
    pub is_hash_agent: bool,
    /// Provisionally referenced physical block
    pub allocation: Option<Pbn>,
    /// Compression progress
    pub compression: VioCompression,
    /// Compressed form of `data`
    pub fragment: Option<Vec<u8>>,
    /// Candidate duplicate location being verified or shared
    pub duplicate: Option<DataLocation>,
    /// Read lock held on the duplicate PBN
    pub duplicate_read_locked: bool,
    /// Tree-page reference update that parked in a slab journal
    pub pending_ref_update: Option<(Pbn, RefOp, JournalPoint)>,
    /// Journal point of this request's mapping entry
    pub recovery_point: JournalPoint,
    /// The per-entry journal lock is still held
    pub holds_entry_lock: bool,
    /// LBN lock held
    pub holds_lbn_lock: bool,
    /// New-mapping reference confirmed
    pub increment_done: bool,
    /// Old-mapping reference dropped
    pub decrement_done: bool,
    /// Acknowledged; result is final
    pub acked: bool,
}

impl DataVio {
    fn new(id: VioId, kind: VioKind, lbn: Lbn, data: Vec<u8>, flags: VioFlags) -> Self {
        let is_zero = kind == VioKind::Write && data.iter().all(|&b| b == 0);
        Self {
            id,
            kind,
            flags,
            lbn,
            logical_zone: 0,
            hash_zone: 0,
            data,
            is_zero,
            result: None,
            last_op: Op::AttemptLbnLock,
            tree_slot: TreeSlot {
                root: 0,
                leaf: 0,
                entry: 0,
            },
            leaf_pbn: INVALID_PBN,
            old_location: DataLocation::UNMAPPED,
            new_location: DataLocation::UNMAPPED,
            chunk_name: None,
            holds_hash_lock: false,
            is_hash_agent: false,
            allocation: None,
            compression: VioCompression::Inactive,
            fragment: None,
            duplicate: None,
            duplicate_read_locked: false,
            pending_ref_update: None,
            recovery_point: JournalPoint::zero(),
            holds_entry_lock: false,
            holds_lbn_lock: false,
            increment_done: false,
            decrement_done: false,
            acked: false,
        }
    }

    /// A write carrying `data`.
    pub fn new_write(id: VioId, lbn: Lbn, data: Vec<u8>, flags: VioFlags) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Self::new(id, VioKind::Write, lbn, data, flags)
    }

    /// A read into a zeroed buffer.
    pub fn new_read(id: VioId, lbn: Lbn) -> Self {
        Self::new(id, VioKind::Read, lbn, vec![0u8; BLOCK_SIZE], VioFlags::empty())
    }

    /// Is this a write?
    #[inline]
    pub fn is_write(&self) -> bool {
        self.kind == VioKind::Write
    }

    /// Record a failure; the first one sticks.
    pub fn set_error(&mut self, error: CdsError) {
        if self.result.is_none() {
            self.result = Some(error);
        }
    }

    /// Final result once acknowledged.
    pub fn outcome(&self) -> Result<(), CdsError> {
        match self.result {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Vio Pool
// ============================================================================

/// Dense pool of in-flight requests.
pub struct VioPool {
    slots: Vec<Option<DataVio>>,
    free: Vec<u32>,
}

impl VioPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Create a request, building it from its assigned id.
    pub fn create<F: FnOnce(VioId) -> DataVio>(&mut self, build: F) -> VioId {
        let id = match self.free.pop() {
            Some(index) => VioId(index),
            None => {
                self.slots.push(None);
                VioId(self.slots.len() as u32 - 1)
            }
        };
        self.slots[id.index()] = Some(build(id));
        id
    }

    /// Borrow a request.
    #[inline]
    pub fn get(&self, id: VioId) -> Option<&DataVio> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Borrow a request mutably.
    #[inline]
    pub fn get_mut(&mut self, id: VioId) -> Option<&mut DataVio> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Retire a request, freeing its slot.
    pub fn remove(&mut self, id: VioId) -> Option<DataVio> {
        let vio = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        Some(vio)
    }

    /// Requests still in flight (not yet retired).
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Ids of requests not yet acknowledged.
    pub fn unacked(&self) -> Vec<VioId> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|v| !v.acked)
            .map(|v| v.id)
            .collect()
    }
}

impl Default for VioPool {
    fn default() -> Self {
        Self::new()
    }
}
