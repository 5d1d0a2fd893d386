//! RAM-backed block device with exact barrier semantics.
//!
//! Two images are kept: the volatile image receives every write, and the
//! durable image is advanced by flush (promoting all volatile writes) or
//! by a FUA write (promoting that block alone). `power_cut` discards the
//! volatile image, which is precisely what a crash does to a device with
//! a writeback cache. Fault injection can fail individual blocks or start
//! failing after a countdown.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::core::{BlockCount, CdsError, CdsResult, Pbn};
use crate::device::BlockDevice;
use crate::BLOCK_SIZE;

// ============================================================================
// Ram Device
// ============================================================================

struct RamInner {
    volatile: Vec<u8>,
    durable: Vec<u8>,
    /// Blocks whose reads should fail
    bad_reads: Vec<Pbn>,
    /// Remaining writes before injected failure; None disables
    writes_until_failure: Option<u64>,
    reads: u64,
    writes: u64,
    fua_writes: u64,
    flushes: u64,
}

/// An in-memory [`BlockDevice`].
pub struct RamDevice {
    blocks: BlockCount,
    inner: Mutex<RamInner>,
}

impl RamDevice {
    /// Create a zero-filled device of `blocks` blocks.
    pub fn new(blocks: BlockCount) -> Self {
        let bytes = blocks as usize * BLOCK_SIZE;
        Self {
            blocks,
            inner: Mutex::new(RamInner {
                volatile: vec![0u8; bytes],
                durable: vec![0u8; bytes],
                bad_reads: Vec::new(),
                writes_until_failure: None,
                reads: 0,
                writes: 0,
                fua_writes: 0,
                flushes: 0,
            }),
        }
    }

    /// Discard the volatile image, as a power loss would.
    pub fn power_cut(&self) {
        let mut inner = self.inner.lock();
        let durable = inner.durable.clone();
        inner.volatile = durable;
    }

    /// Make reads of `pbn` fail with `Io`.
    pub fn fail_reads_of(&self, pbn: Pbn) {
        self.inner.lock().bad_reads.push(pbn);
    }

    /// Clear injected read failures.
    pub fn clear_read_faults(&self) {
        self.inner.lock().bad_reads.clear();
    }

    /// Accept `count` more writes, then fail every write with `Io`.
    pub fn fail_writes_after(&self, count: u64) {
        self.inner.lock().writes_until_failure = Some(count);
    }

    /// I/O counters: (reads, writes, fua writes, flushes).
    pub fn io_counts(&self) -> (u64, u64, u64, u64) {
        let inner = self.inner.lock();
        (inner.reads, inner.writes, inner.fua_writes, inner.flushes)
    }

    /// Copy of the durable image of one block, for test inspection.
    pub fn durable_block(&self, pbn: Pbn) -> Vec<u8> {
        let inner = self.inner.lock();
        let offset = pbn as usize * BLOCK_SIZE;
        inner.durable[offset..offset + BLOCK_SIZE].to_vec()
    }

    #[inline]
    fn offset_of(&self, pbn: Pbn) -> CdsResult<usize> {
        if pbn >= self.blocks {
            return Err(CdsError::OutOfRange);
        }
        Ok(pbn as usize * BLOCK_SIZE)
    }
}

impl BlockDevice for RamDevice {
    fn block_count(&self) -> BlockCount {
        self.blocks
    }

    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> CdsResult<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = self.offset_of(pbn)?;
        let mut inner = self.inner.lock();
        if inner.bad_reads.contains(&pbn) {
            return Err(CdsError::Io);
        }
        inner.reads += 1;
        buf.copy_from_slice(&inner.volatile[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, pbn: Pbn, data: &[u8], fua: bool) -> CdsResult<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let offset = self.offset_of(pbn)?;
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.writes_until_failure {
            if remaining == 0 {
                return Err(CdsError::Io);
            }
            inner.writes_until_failure = Some(remaining - 1);
        }
        inner.writes += 1;
        inner.volatile[offset..offset + BLOCK_SIZE].copy_from_slice(data);
        if fua {
            inner.fua_writes += 1;
            inner.durable[offset..offset + BLOCK_SIZE].copy_from_slice(data);
        }
        Ok(())
    }

    fn flush(&self) -> CdsResult<()> {
        let mut inner = self.inner.lock();
        inner.flushes += 1;
        let volatile = inner.volatile.clone();
        inner.durable = volatile;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_cut_loses_unflushed_writes() {
        let dev = RamDevice::new(4);
        let data = [0xAAu8; BLOCK_SIZE];
        dev.write_block(1, &data, false).unwrap();
        dev.power_cut();
        let mut buf = [0xFFu8; BLOCK_SIZE];
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_flush_makes_writes_durable() {
        let dev = RamDevice::new(4);
        let data = [0xBBu8; BLOCK_SIZE];
        dev.write_block(2, &data, false).unwrap();
        dev.flush().unwrap();
        dev.power_cut();
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_fua_write_survives_power_cut() {
        let dev = RamDevice::new(4);
        let data = [0xCCu8; BLOCK_SIZE];
        dev.write_block(3, &data, true).unwrap();
        dev.power_cut();
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_fault_injection() {
        let dev = RamDevice::new(4);
        dev.fail_reads_of(1);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(dev.read_block(1, &mut buf), Err(CdsError::Io));
        dev.clear_read_faults();
        assert!(dev.read_block(1, &mut buf).is_ok());

        dev.fail_writes_after(1);
        let data = [0u8; BLOCK_SIZE];
        assert!(dev.write_block(0, &data, false).is_ok());
        assert_eq!(dev.write_block(0, &data, false), Err(CdsError::Io));
    }

    #[test]
    fn test_out_of_range() {
        let dev = RamDevice::new(2);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(dev.read_block(2, &mut buf), Err(CdsError::OutOfRange));
    }
}
