//! Block device abstraction.
//!
//! The engine talks to its backing store through [`BlockDevice`]: aligned
//! 4 KiB reads and writes, an explicit flush barrier that orders all prior
//! writes before subsequent ones, and optional FUA on a single write. I/O
//! completes synchronously from the caller's point of view; the pipeline
//! routes completions through zone queues, never by recursion.

pub mod ram;
pub mod registry;

pub use ram::RamDevice;
pub use registry::{get_device, register_device, unregister_device};

use crate::core::{BlockCount, CdsResult, Pbn};

// ============================================================================
// Block Device Trait
// ============================================================================

/// A 4 KiB-sectored backing store with barrier semantics.
pub trait BlockDevice: Send + Sync {
    /// Total device size in blocks.
    fn block_count(&self) -> BlockCount;

    /// Read one block into `buf` (`buf.len() == BLOCK_SIZE`).
    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> CdsResult<()>;

    /// Write one block. With `fua` set the write must be durable before
    /// this returns; otherwise durability is deferred to the next flush.
    fn write_block(&self, pbn: Pbn, data: &[u8], fua: bool) -> CdsResult<()>;

    /// Barrier: make every previously accepted write durable.
    fn flush(&self) -> CdsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn test_trait_object_usage() {
        let dev = RamDevice::new(8);
        let dyn_dev: &dyn BlockDevice = &dev;
        assert_eq!(dyn_dev.block_count(), 8);
        let buf = [7u8; BLOCK_SIZE];
        dyn_dev.write_block(3, &buf, true).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        dyn_dev.read_block(3, &mut out).unwrap();
        assert_eq!(out, buf);
    }
}
