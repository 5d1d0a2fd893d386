//! Write-back page cache for block-map leaf pages.
//!
//! The cache maps PBN to a fixed pool of page frames. A frame walks
//! `Free -> Incoming -> Resident <-> Dirty -> Outgoing` and, on a failed
//! load outside rebuild mode, `Failed`. Eviction takes the least recently
//! used frame whose busy count is zero; dirty frames are written back
//! first. At most one load is ever issued for a given PBN; later
//! requesters for a frame in transit park on the frame's wait queue, and
//! requesters that cannot get a frame at all park on the cache-wide
//! queue in FIFO order.
//!
//! Each frame carries one piece of client context: the earliest
//! recovery-journal sequence number that must not be reaped until the
//! frame is written back. The write hook returns it so the block-map zone
//! can release the journal lock.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_map::page::{self, PageValidity};
use crate::core::{CdsError, CdsResult, Nonce, Pbn, SequenceNumber};
use crate::device::BlockDevice;
use crate::pipeline::Action;
use crate::util::{IntMap, WaitQueue};
use crate::BLOCK_SIZE;

// ============================================================================
// Page State
// ============================================================================

/// State of a cache frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Unused frame
    Free,
    /// Load in flight
    Incoming,
    /// Write-back in flight
    Outgoing,
    /// Clean and usable
    Resident,
    /// Modified since last write-back
    Dirty,
    /// Load failed; poisoned until reset
    Failed,
}

// ============================================================================
// Page Frame
// ============================================================================

/// One cached page frame (`page_info`).
pub struct PageFrame {
    /// Current state
    pub state: PageState,
    /// Owning PBN when not free
    pub pbn: Pbn,
    /// Requesters currently using the page
    pub busy: u32,
    /// Page contents
    pub buffer: Vec<u8>,
    /// Requesters parked on this frame
    pub waiters: WaitQueue<Action>,
    /// LRU timestamp
    lru: u64,
    /// Earliest journal sequence this page protects (0 = none)
    pub recovery_lock: SequenceNumber,
}

impl PageFrame {
    fn new() -> Self {
        Self {
            state: PageState::Free,
            pbn: 0,
            busy: 0,
            buffer: vec![0u8; BLOCK_SIZE],
            waiters: WaitQueue::new(),
            lru: 0,
            recovery_lock: 0,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a page request.
#[derive(Debug, PartialEq, Eq)]
pub enum PageGet {
    /// Frame index; the caller holds a busy reference and must release it
    Ready(usize),
    /// Parked on a frame or cache-wide queue; retried on wake
    Parked,
}

/// Journal-lock movement caused by dirtying a page.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LockTransfer {
    /// Sequence to acquire a journal reference for
    pub acquire: Option<SequenceNumber>,
    /// Sequence whose journal reference is released
    pub release: Option<SequenceNumber>,
}

/// Cache counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub reformats: u64,
    pub evictions: u64,
    pub dirty_writes: u64,
    pub wait_for_frame: u64,
}

// ============================================================================
// Page Cache
// ============================================================================

/// Fixed-size write-back cache over block-map pages.
pub struct PageCache {
    nonce: Nonce,
    frames: Vec<PageFrame>,
    map: IntMap<usize>,
    lru_tick: u64,
    frame_waiters: WaitQueue<Action>,
    rebuild_mode: bool,
    pub stats: PageCacheStats,
}

impl PageCache {
    /// Create a cache of `pages` frames.
    pub fn new(pages: usize, nonce: Nonce) -> Self {
        let mut frames = Vec::with_capacity(pages);
        frames.resize_with(pages, PageFrame::new);
        Self {
            nonce,
            frames,
            map: IntMap::with_capacity(pages),
            lru_tick: 0,
            frame_waiters: WaitQueue::new(),
            rebuild_mode: false,
            stats: PageCacheStats::default(),
        }
    }

    /// In rebuild mode load errors degrade to a zeroed page instead of
    /// failing the instance.
    pub fn set_rebuild_mode(&mut self, rebuild: bool) {
        self.rebuild_mode = rebuild;
    }

    #[inline]
    fn touch(&mut self, frame: usize) {
        self.lru_tick += 1;
        self.frames[frame].lru = self.lru_tick;
    }

    /// Fetch the page at `pbn`, loading it if needed. On `Ready` the
    /// caller holds a busy reference. On `Parked` the waiter has been
    /// queued and will be re-enqueued by a later wake.
    pub fn get_page(
        &mut self,
        device: &dyn BlockDevice,
        pbn: Pbn,
        waiter: Action,
    ) -> CdsResult<PageGet> {
        if let Some(&index) = self.map.get(pbn) {
            match self.frames[index].state {
                PageState::Resident | PageState::Dirty => {
                    self.stats.hits += 1;
                    self.frames[index].busy += 1;
                    self.touch(index);
                    return Ok(PageGet::Ready(index));
                }
                PageState::Incoming | PageState::Outgoing => {
                    self.frames[index].waiters.enqueue(waiter);
                    return Ok(PageGet::Parked);
                }
                PageState::Failed => return Err(CdsError::BadPage),
                PageState::Free => unreachable!("mapped frame cannot be free"),
            }
        }

        self.stats.misses += 1;
        let Some(index) = self.claim_frame(device)? else {
            self.stats.wait_for_frame += 1;
            self.frame_waiters.enqueue(waiter);
            return Ok(PageGet::Parked);
        };
        self.load(device, index, pbn)?;
        self.frames[index].busy += 1;
        self.touch(index);
        Ok(PageGet::Ready(index))
    }

    /// Find a frame to (re)use: a free frame, else the LRU clean frame,
    /// else the LRU dirty frame after writing it back. `None` when every
    /// frame is busy.
    fn claim_frame(&mut self, device: &dyn BlockDevice) -> CdsResult<Option<usize>> {
        if let Some(index) = self.frames.iter().position(|f| f.state == PageState::Free) {
            return Ok(Some(index));
        }

        let victim = |state: PageState, frames: &[PageFrame]| {
            frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.state == state && f.busy == 0 && f.waiters.is_empty())
                .min_by_key(|(_, f)| f.lru)
                .map(|(i, _)| i)
        };

        if let Some(index) = victim(PageState::Resident, &self.frames) {
            self.evict(index);
            return Ok(Some(index));
        }
        if let Some(index) = victim(PageState::Dirty, &self.frames) {
            self.write_page(device, index, false)?;
            self.evict(index);
            return Ok(Some(index));
        }
        Ok(None)
    }

    fn evict(&mut self, index: usize) {
        debug_assert_eq!(self.frames[index].busy, 0);
        debug_assert_eq!(self.frames[index].recovery_lock, 0);
        self.stats.evictions += 1;
        self.map.remove(self.frames[index].pbn);
        self.frames[index].state = PageState::Free;
    }

    /// Load `pbn` into `index`, running the read hook.
    fn load(&mut self, device: &dyn BlockDevice, index: usize, pbn: Pbn) -> CdsResult<()> {
        self.stats.loads += 1;
        self.frames[index].state = PageState::Incoming;
        self.frames[index].pbn = pbn;
        self.map.insert(pbn, index);

        let frame = &mut self.frames[index];
        let read = device.read_block(pbn, &mut frame.buffer);
        let validity = match read {
            Ok(()) => page::validate_page(&frame.buffer, self.nonce, pbn),
            Err(error) if self.rebuild_mode => {
                log::warn!("block map: read of page {pbn} failed in rebuild mode: {error}");
                PageValidity::Empty
            }
            Err(error) => {
                frame.state = PageState::Failed;
                return Err(error);
            }
        };

        match validity {
            PageValidity::Valid => {}
            PageValidity::Empty => {
                self.stats.reformats += 1;
                page::format_page(&mut frame.buffer, pbn, self.nonce, false);
            }
            PageValidity::Bad if self.rebuild_mode => {
                self.stats.reformats += 1;
                page::format_page(&mut frame.buffer, pbn, self.nonce, false);
            }
            PageValidity::Bad => {
                frame.state = PageState::Failed;
                return Err(CdsError::BadPage);
            }
        }
        frame.state = PageState::Resident;
        Ok(())
    }

    /// Access a resident page read-only. The frame must be held busy.
    pub fn page(&self, index: usize) -> &[u8] {
        debug_assert!(matches!(
            self.frames[index].state,
            PageState::Resident | PageState::Dirty
        ));
        &self.frames[index].buffer
    }

    /// Access a resident page mutably. The frame must be held busy.
    pub fn page_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.frames[index].buffer
    }

    /// Mark `index` dirty under `new_lock`, computing the journal-lock
    /// transfer: the frame keeps a reference on its earliest protecting
    /// sequence, acquiring for `new_lock` when it has none or when
    /// `new_lock` is older, and releasing the one it held.
    pub fn mark_dirty(&mut self, index: usize, new_lock: SequenceNumber) -> LockTransfer {
        let frame = &mut self.frames[index];
        frame.state = PageState::Dirty;
        let old_lock = frame.recovery_lock;
        if old_lock == 0 || new_lock < old_lock {
            frame.recovery_lock = new_lock;
            LockTransfer {
                acquire: Some(new_lock),
                release: (old_lock != 0).then_some(old_lock),
            }
        } else {
            LockTransfer::default()
        }
    }

    /// Drop a busy reference. Returns a cache-wide waiter to retry if the
    /// frame may now be reclaimable.
    pub fn release(&mut self, index: usize) -> Option<Action> {
        let frame = &mut self.frames[index];
        debug_assert!(frame.busy > 0);
        frame.busy -= 1;
        if frame.busy == 0 {
            self.frame_waiters.notify_one()
        } else {
            None
        }
    }

    /// Write one dirty page out (the write hook). Marks the page
    /// initialized, clears its journal lock, and returns the released
    /// sequence (0 when none was held).
    pub fn write_page(
        &mut self,
        device: &dyn BlockDevice,
        index: usize,
        fua: bool,
    ) -> CdsResult<SequenceNumber> {
        let frame = &mut self.frames[index];
        debug_assert_eq!(frame.state, PageState::Dirty);
        frame.state = PageState::Outgoing;
        page::set_initialized(&mut frame.buffer);
        page::set_recovery_lock(&mut frame.buffer, frame.recovery_lock);
        let result = device.write_block(frame.pbn, &frame.buffer, fua);
        match result {
            Ok(()) => {
                self.stats.dirty_writes += 1;
                frame.state = PageState::Resident;
                let released = frame.recovery_lock;
                frame.recovery_lock = 0;
                Ok(released)
            }
            Err(error) => {
                log::error!(
                    "block map: write-back of page {} failed: {error}",
                    frame.pbn
                );
                frame.state = PageState::Dirty;
                Err(error)
            }
        }
    }

    /// Write back every dirty page whose journal lock is older than
    /// `sequence`, returning the released sequences. The caller issues the
    /// ordering barrier before calling.
    pub fn write_pages_locking_before(
        &mut self,
        device: &dyn BlockDevice,
        sequence: SequenceNumber,
    ) -> CdsResult<Vec<SequenceNumber>> {
        let targets: Vec<usize> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.state == PageState::Dirty && f.recovery_lock < sequence)
            .map(|(i, _)| i)
            .collect();
        let mut released = Vec::with_capacity(targets.len());
        for index in targets {
            released.push(self.write_page(device, index, false)?);
        }
        Ok(released)
    }

    /// Write back every dirty page. Used by drain.
    pub fn flush_dirty(&mut self, device: &dyn BlockDevice) -> CdsResult<Vec<SequenceNumber>> {
        self.write_pages_locking_before(device, SequenceNumber::MAX)
    }

    /// Are any pages dirty or in transit?
    pub fn is_clean(&self) -> bool {
        self.frames.iter().all(|f| {
            matches!(f.state, PageState::Free | PageState::Resident) && f.waiters.is_empty()
        }) && self.frame_waiters.is_empty()
    }

    /// Drop everything; only valid when clean or when the instance is
    /// being torn down after a crash simulation.
    pub fn invalidate(&mut self) {
        for frame in &mut self.frames {
            frame.state = PageState::Free;
            frame.busy = 0;
            frame.recovery_lock = 0;
        }
        self.map.clear();
    }
}
