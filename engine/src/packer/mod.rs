//! Compressed-fragment packer.
//!
//! Batches compressed fragments from multiple requests into one physical
//! block of up to fourteen slots. Bins are kept sorted ascending by free
//! space and selection is first-fit on that order, which is best-fit.
//! Each batch has one agent (the first request in, whose allocated block
//! receives the write); every other member is a client that copied its
//! fragment into the batch at an offset. A batch that would hold a single
//! fragment is aborted, since writing it packed saves nothing.

use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::core::{CdsError, CdsResult, VioId};
use crate::core::types::MAX_COMPRESSION_SLOTS;
use crate::BLOCK_SIZE;

// ============================================================================
// Compressed Block Codec
// ============================================================================

/// Compressed block header: version, padding, fourteen fragment sizes.
pub const COMPRESSED_BLOCK_HEADER_SIZE: usize = 8 + 2 * MAX_COMPRESSION_SLOTS;

/// Compressed block format version.
pub const COMPRESSED_BLOCK_VERSION: u32 = 1;

/// Fragment payload capacity of one compressed block.
pub const COMPRESSED_BLOCK_DATA_SIZE: usize = BLOCK_SIZE - COMPRESSED_BLOCK_HEADER_SIZE;

static_assertions::const_assert_eq!(COMPRESSED_BLOCK_HEADER_SIZE, 36);

/// Read the fragment for `slot` out of a compressed block: slot `k`
/// begins after the header plus the sizes of all prior slots.
pub fn fragment(buf: &[u8], slot: u8) -> CdsResult<&[u8]> {
    if slot as usize >= MAX_COMPRESSION_SLOTS {
        return Err(CdsError::InvalidFragment);
    }
    let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if version != COMPRESSED_BLOCK_VERSION {
        return Err(CdsError::InvalidFragment);
    }
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for prior in 0..slot {
        offset += size_of_slot(buf, prior) as usize;
    }
    let size = size_of_slot(buf, slot) as usize;
    if size == 0 || offset + size > BLOCK_SIZE {
        return Err(CdsError::InvalidFragment);
    }
    Ok(&buf[offset..offset + size])
}

#[inline]
fn size_of_slot(buf: &[u8], slot: u8) -> u16 {
    let at = 8 + slot as usize * 2;
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

// ============================================================================
// Bins
// ============================================================================

struct BinSlot {
    vio: VioId,
    size: u16,
}

/// One input bin: fragments packed back to back.
struct Bin {
    slots: ArrayVec<BinSlot, MAX_COMPRESSION_SLOTS>,
    data: Vec<u8>,
    used: usize,
}

impl Bin {
    fn new() -> Self {
        Self {
            slots: ArrayVec::new(),
            data: vec![0u8; COMPRESSED_BLOCK_DATA_SIZE],
            used: 0,
        }
    }

    #[inline]
    fn free_space(&self) -> usize {
        if self.slots.is_full() {
            0
        } else {
            COMPRESSED_BLOCK_DATA_SIZE - self.used
        }
    }

    fn add(&mut self, vio: VioId, fragment: &[u8]) {
        debug_assert!(fragment.len() <= self.free_space());
        self.data[self.used..self.used + fragment.len()].copy_from_slice(fragment);
        self.used += fragment.len();
        self.slots.push(BinSlot {
            vio,
            size: fragment.len() as u16,
        });
    }

    fn remove(&mut self, vio: VioId) -> Option<(Vec<u8>, u16)> {
        let index = self.slots.iter().position(|s| s.vio == vio)?;
        let offset: usize = self.slots[..index].iter().map(|s| s.size as usize).sum();
        let size = self.slots[index].size as usize;
        let bytes = self.data[offset..offset + size].to_vec();
        self.data.copy_within(offset + size..self.used, offset);
        self.used -= size;
        self.slots.remove(index);
        Some((bytes, size as u16))
    }

    fn contains(&self, vio: VioId) -> bool {
        self.slots.iter().any(|s| s.vio == vio)
    }
}

// ============================================================================
// Sealed Batches
// ============================================================================

/// A finished batch ready to be written by its agent.
pub struct SealedBatch {
    /// The request whose allocated block receives the write
    pub agent: VioId,
    /// Every member with its final slot and fragment size
    pub members: Vec<(VioId, u8, u16)>,
    /// Encoded compressed block
    pub block: Vec<u8>,
}

impl SealedBatch {
    /// A single-member batch saves nothing and is aborted.
    #[inline]
    pub fn is_single(&self) -> bool {
        self.members.len() == 1
    }
}

fn seal(bin: &mut Bin) -> SealedBatch {
    debug_assert!(!bin.slots.is_empty());
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..4].copy_from_slice(&COMPRESSED_BLOCK_VERSION.to_le_bytes());
    let mut members = Vec::with_capacity(bin.slots.len());
    for (slot, entry) in bin.slots.iter().enumerate() {
        let at = 8 + slot * 2;
        block[at..at + 2].copy_from_slice(&entry.size.to_le_bytes());
        members.push((entry.vio, slot as u8, entry.size));
    }
    block[COMPRESSED_BLOCK_HEADER_SIZE..COMPRESSED_BLOCK_HEADER_SIZE + bin.used]
        .copy_from_slice(&bin.data[..bin.used]);
    let agent = members[0].0;
    bin.slots.clear();
    bin.used = 0;
    SealedBatch {
        agent,
        members,
        block,
    }
}

// ============================================================================
// Packer
// ============================================================================

/// Outcome of offering a fragment to the packer.
pub enum PackOutcome {
    /// Fragment parked in a bin; the request waits for the batch
    Packed,
    /// A bin filled: here is the batch, and the fragment was parked in a
    /// fresh bin
    Sealed(SealedBatch),
    /// Nothing fits and no bin is worth writing out; continue
    /// uncompressed
    Rejected,
}

/// Packer counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackerStats {
    pub fragments_accepted: u64,
    pub fragments_rejected: u64,
    pub batches_sealed: u64,
    pub singles_aborted: u64,
    pub cancellations: u64,
}

/// The compressed-fragment packer.
pub struct Packer {
    /// Sorted ascending by free space
    bins: Vec<Bin>,
    /// Holds entries extracted by cancellation until their requests
    /// rendezvous with them
    canceled: Bin,
    pub stats: PackerStats,
}

impl Packer {
    /// Default bin count.
    pub const DEFAULT_BINS: usize = 16;

    /// Create a packer with `bins` input bins.
    pub fn new(bins: usize) -> Self {
        let mut vec = Vec::with_capacity(bins.max(1));
        vec.resize_with(bins.max(1), Bin::new);
        Self {
            bins: vec,
            canceled: Bin::new(),
            stats: PackerStats::default(),
        }
    }

    fn sort_bins(&mut self) {
        self.bins.sort_by_key(Bin::free_space);
    }

    /// Offer a request's compressed fragment. First-fit on the
    /// ascending-by-free-space bin list is best-fit; when nothing fits,
    /// the fullest bin is written out if that frees at least the
    /// fragment's worth of space.
    pub fn attempt(&mut self, vio: VioId, fragment: &[u8]) -> PackOutcome {
        let size = fragment.len();
        if size == 0 || size > COMPRESSED_BLOCK_DATA_SIZE {
            self.stats.fragments_rejected += 1;
            return PackOutcome::Rejected;
        }

        if let Some(bin) = self.bins.iter_mut().find(|b| b.free_space() >= size) {
            bin.add(vio, fragment);
            self.stats.fragments_accepted += 1;
            let sealed = bin.slots.is_full().then(|| seal(bin));
            self.sort_bins();
            return match sealed {
                Some(batch) => {
                    self.stats.batches_sealed += 1;
                    PackOutcome::Sealed(batch)
                }
                None => PackOutcome::Packed,
            };
        }

        // The fullest bin is the one with the least free space that has
        // members; bins are sorted ascending by free space.
        let fullest = self
            .bins
            .iter_mut()
            .filter(|b| !b.slots.is_empty())
            .min_by_key(|b| b.free_space());
        match fullest {
            Some(bin) if bin.used >= size => {
                let batch = seal(bin);
                bin.add(vio, fragment);
                self.stats.fragments_accepted += 1;
                self.stats.batches_sealed += 1;
                self.sort_bins();
                PackOutcome::Sealed(batch)
            }
            _ => {
                self.stats.fragments_rejected += 1;
                PackOutcome::Rejected
            }
        }
    }

    /// Extract a canceled request from its bin. The entry moves to the
    /// canceled bin so the canceling request can still rendezvous with
    /// it; returns whether the request was found.
    pub fn remove_lock_holder(&mut self, vio: VioId) -> bool {
        if self.canceled.contains(vio) {
            return true;
        }
        let Some(bin) = self.bins.iter_mut().find(|b| b.contains(vio)) else {
            return false;
        };
        let (bytes, _) = bin.remove(vio).unwrap();
        self.sort_bins();
        if self.canceled.free_space() >= bytes.len() {
            self.canceled.add(vio, &bytes);
        }
        self.stats.cancellations += 1;
        true
    }

    /// Claim a canceled entry back; the request continues uncompressed.
    pub fn take_canceled(&mut self, vio: VioId) -> bool {
        self.canceled.remove(vio).is_some()
    }

    /// Seal every non-empty bin, canceled bin included. Used on suspend
    /// and drain.
    pub fn flush(&mut self) -> Vec<SealedBatch> {
        let mut batches = Vec::new();
        for bin in self.bins.iter_mut().chain(core::iter::once(&mut self.canceled)) {
            if bin.slots.is_empty() {
                continue;
            }
            let batch = seal(bin);
            if batch.is_single() {
                self.stats.singles_aborted += 1;
            } else {
                self.stats.batches_sealed += 1;
            }
            batches.push(batch);
        }
        self.sort_bins();
        batches
    }

    /// Is any fragment parked here?
    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|b| b.slots.is_empty()) && self.canceled.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vio(n: u32) -> VioId {
        VioId(n)
    }

    #[test]
    fn test_fragment_codec() {
        let mut packer = Packer::new(4);
        let frag_a = vec![1u8; 900];
        let frag_b = vec![2u8; 1100];
        assert!(matches!(packer.attempt(vio(1), &frag_a), PackOutcome::Packed));
        assert!(matches!(packer.attempt(vio(2), &frag_b), PackOutcome::Packed));
        let batches = packer.flush();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.agent, vio(1));
        assert_eq!(batch.members.len(), 2);

        assert_eq!(fragment(&batch.block, 0).unwrap(), &frag_a[..]);
        assert_eq!(fragment(&batch.block, 1).unwrap(), &frag_b[..]);
        assert_eq!(fragment(&batch.block, 2), Err(CdsError::InvalidFragment));
    }

    #[test]
    fn test_first_fit_is_best_fit() {
        let mut packer = Packer::new(2);
        // Bin A gets a large fragment, bin B a small one; the next
        // fragment that fits both must land in the fuller bin.
        packer.attempt(vio(1), &vec![1u8; 3000]);
        packer.attempt(vio(2), &vec![2u8; 500]);
        packer.attempt(vio(3), &vec![3u8; 1000]);
        let batches = packer.flush();
        assert_eq!(batches.len(), 2);
        let with_three: Vec<_> = batches
            .iter()
            .filter(|b| b.members.iter().any(|(v, _, _)| *v == vio(3)))
            .collect();
        assert_eq!(with_three.len(), 1);
        // vio 3 shares a block with vio 1 (free 1060 < free 3560).
        assert!(with_three[0].members.iter().any(|(v, _, _)| *v == vio(1)));
    }

    #[test]
    fn test_full_bin_seals_on_fourteenth() {
        let mut packer = Packer::new(1);
        for i in 0..13 {
            assert!(matches!(
                packer.attempt(vio(i), &[7u8; 100]),
                PackOutcome::Packed
            ));
        }
        match packer.attempt(vio(13), &[7u8; 100]) {
            PackOutcome::Sealed(batch) => {
                assert_eq!(batch.members.len(), MAX_COMPRESSION_SLOTS);
                assert_eq!(batch.members[13].1, 13);
            }
            _ => panic!("fourteenth fragment must seal the batch"),
        }
        assert!(packer.is_empty());
    }

    #[test]
    fn test_overflow_writes_fullest_bin() {
        let mut packer = Packer::new(1);
        packer.attempt(vio(1), &vec![1u8; 2000]);
        packer.attempt(vio(2), &vec![2u8; 2000]);
        // 4000 bytes used, 60 free: a 500-byte fragment cannot fit, but
        // writing the bin frees 4000 >= 500.
        match packer.attempt(vio(3), &vec![3u8; 500]) {
            PackOutcome::Sealed(batch) => {
                assert_eq!(batch.members.len(), 2);
            }
            _ => panic!("fullest bin should have been written"),
        }
        // vio 3 is parked in the recycled bin.
        assert!(!packer.is_empty());
    }

    #[test]
    fn test_tiny_fragment_rejected_when_nothing_to_write() {
        let mut packer = Packer::new(1);
        // An over-large fragment is rejected outright.
        assert!(matches!(
            packer.attempt(vio(1), &vec![1u8; COMPRESSED_BLOCK_DATA_SIZE + 1]),
            PackOutcome::Rejected
        ));
        // A bin with less content than the incoming fragment is not
        // worth writing out.
        packer.attempt(vio(2), &vec![2u8; 100]);
        match packer.attempt(vio(3), &vec![3u8; 4000]) {
            PackOutcome::Rejected => {}
            _ => panic!("should reject when writing saves less than the fragment"),
        }
    }

    #[test]
    fn test_cancellation_rendezvous() {
        let mut packer = Packer::new(2);
        packer.attempt(vio(1), &[1u8; 600]);
        packer.attempt(vio(2), &[2u8; 700]);
        assert!(packer.remove_lock_holder(vio(1)));
        assert!(!packer.remove_lock_holder(vio(99)));
        // The canceled entry waits in the canceled bin.
        assert!(packer.take_canceled(vio(1)));
        assert!(!packer.take_canceled(vio(1)));
        // The remaining member still flushes (as a single, aborted).
        let batches = packer.flush();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_single());
        assert_eq!(packer.stats.singles_aborted, 1);
    }
}
