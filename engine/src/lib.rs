//! # Condense - Deduplicating, Compressing Virtual Block Layer
//!
//! Condense exposes a logical 4 KiB block device backed by a smaller
//! physical device. Space comes back three ways: duplicate blocks share a
//! single physical copy, non-duplicate blocks are compressed and packed up
//! to fourteen fragments per physical block, and the logical-to-physical
//! map is stored compactly while staying crash consistent.
//!
//! This crate is the metadata engine: the durable, concurrent machinery
//! that turns an incoming logical read or write into a confirmed mapping
//! change with crash recoverability. The deduplication index, the
//! compressor, and the block-device queues are external collaborators
//! behind narrow traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Request Pipeline                             │
//! │        (per-request state machine across zone queues)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐                │
//! │  │  LBN Locks  │ │ Hash Locks  │ │  PBN Locks  │                │
//! │  └─────────────┘ └─────────────┘ └─────────────┘                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Metadata Layer                               │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐                │
//! │  │  Block Map  │ │  Recovery   │ │   Packer    │                │
//! │  │  + Cache    │ │  Journal    │ │             │                │
//! │  └─────────────┘ └─────────────┘ └─────────────┘                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Slab Depot                                   │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐                │
//! │  │  Allocator  │ │  Ref Counts │ │ Slab Journal│                │
//! │  └─────────────┘ └─────────────┘ └─────────────┘                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Block Device                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! PBN 0:        Reserved (doubles as the zero-block sentinel)
//! Index:        Opaque region for the external dedupe index
//! Super block:  Identity, geometry, journal state, read-only latch
//! Roots:        Block-map root pages (one per root tree)
//! Journal:      Circular recovery journal
//! Summary:      Per-slab clean/fullness hints
//! Slabs:        Equal-sized, self-describing slabs
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// ============================================================================
// Core Module Exports
// ============================================================================

pub mod admin;
pub mod block_map;
pub mod compress;
pub mod config;
pub mod core;
pub mod dedupe;
pub mod device;
pub mod instance;
pub mod journal;
pub mod layout;
pub mod logical;
pub mod packer;
pub mod physical;
pub mod pipeline;
pub mod slab;
pub mod stats;
pub mod util;

// Re-exports for convenience
pub use crate::config::{CondenseConfig, ThreadCounts, WritePolicy};
pub use crate::core::error::{CdsError, CdsResult};
pub use crate::core::types::*;
pub use crate::device::{BlockDevice, RamDevice};
pub use crate::instance::CondenseInstance;
pub use crate::layout::SuperBlock;

/// Condense version information
pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 1;
pub const VERSION_STRING: &str = "0.1.0";

/// Block size (4 KiB, the unit of all I/O and all metadata)
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SHIFT: u32 = 12;

/// Maximum number of block-map root trees
pub const MAX_BLOCK_MAP_ROOTS: u8 = 60;
