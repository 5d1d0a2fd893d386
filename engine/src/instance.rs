//! The instance root: owns every zone and drives the pipeline.
//!
//! All per-instance state hangs off [`CondenseInstance`]. Work moves as
//! tagged actions through per-zone FIFO queues; the pump drains the
//! queues, then runs housekeeping (journal commit, slab-journal
//! thresholds, write-back under journal space pressure, packer flush
//! when the pipeline would otherwise stall) until everything in flight
//! has either acknowledged or parked for input only new work can
//! provide.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::admin::{AdminState, DrainKind, ReadOnlyNotifier, DRAIN_PHASES};
use crate::block_map::{self, BlockMapZone, Forest};
use crate::compress::{Compressor, RleCompressor};
use crate::config::{CondenseConfig, SlabJournalThresholds};
use crate::core::{
    BlockCount, CdsError, CdsResult, DataLocation, Lbn, Nonce, Pbn, SequenceNumber, VioId,
};
use crate::dedupe::{ChunkHasher, DedupeIndex, FnvChunkHasher, HashZone, MemoryDedupeIndex};
use crate::device::BlockDevice;
use crate::journal::{RecoveryJournal, ZoneType};
use crate::layout::{Layout, SuperBlock};
use crate::layout::super_block::{FLAG_CLEAN, FLAG_READ_ONLY};
use crate::logical::LogicalZone;
use crate::packer::Packer;
use crate::physical::PhysicalZone;
use crate::pipeline::{
    read, write, Action, DataVio, Dispatcher, Op, VioFlags, VioKind, VioPool, ZoneKind,
};
use crate::slab::scrubber::Scrubber;
use crate::slab::SlabDepot;
use crate::stats::{ErrorStats, RequestStats, Statistics};
use crate::BLOCK_SIZE;

// ============================================================================
// Instance
// ============================================================================

/// One deduplicating, compressing block-layer instance.
pub struct CondenseInstance {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) config: CondenseConfig,
    pub(crate) layout: Layout,
    pub(crate) nonce: Nonce,
    pub(crate) uuid: [u8; 16],
    pub(crate) admin: AdminState,
    pub(crate) read_only: ReadOnlyNotifier,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) vios: VioPool,
    pub(crate) logical_zones: Vec<LogicalZone>,
    pub(crate) physical_zones: Vec<PhysicalZone>,
    pub(crate) hash_zones: Vec<HashZone>,
    pub(crate) block_map: Vec<BlockMapZone>,
    pub(crate) forest: Forest,
    pub(crate) journal: RecoveryJournal,
    pub(crate) depot: SlabDepot,
    pub(crate) scrubber: Scrubber,
    pub(crate) packer: Packer,
    pub(crate) compressor: Arc<dyn Compressor>,
    pub(crate) hasher: Arc<dyn ChunkHasher>,
    pub(crate) index: Arc<dyn DedupeIndex>,
    pub(crate) errors: ErrorStats,
    pub(crate) requests: RequestStats,
    /// The on-disk super block currently carries the CLEAN flag; the
    /// first mutation after a clean period clears it so a crash is
    /// recognized at the next load.
    sb_clean: bool,
}

impl CondenseInstance {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    fn build(
        device: Arc<dyn BlockDevice>,
        config: CondenseConfig,
        layout: Layout,
        nonce: Nonce,
        uuid: [u8; 16],
        journal_tail: SequenceNumber,
    ) -> Self {
        let threads = config.threads;
        let thresholds = config.slab_journal_thresholds.unwrap_or_else(|| {
            let geometry = crate::slab::SlabGeometry::compute(layout.slab_blocks);
            SlabJournalThresholds::for_journal_size(geometry.journal_blocks)
        });
        let cache_pages = (config.cache_pages / threads.logical as usize).max(2);
        let height = block_map::tree_height(config.logical_blocks, layout.root_count);
        let per_tree = block_map::leaves_per_tree(config.logical_blocks, layout.root_count);
        let root_pbns = (0..layout.root_count).map(|r| layout.root_pbn(r)).collect();
        let mut journal = RecoveryJournal::new(
            nonce,
            layout.journal_origin,
            layout.journal_blocks,
            config.tail_buffers,
            threads.logical,
            threads.physical,
            journal_tail,
        );
        journal.set_preflush(config.write_policy.wants_barrier());

        Self {
            journal,
            depot: SlabDepot::new(&layout, nonce, thresholds, threads.physical),
            forest: Forest::new(root_pbns, height, per_tree, nonce),
            block_map: (0..threads.logical)
                .map(|z| BlockMapZone::new(z, cache_pages, nonce))
                .collect(),
            logical_zones: (0..threads.logical).map(LogicalZone::new).collect(),
            physical_zones: (0..threads.physical).map(PhysicalZone::new).collect(),
            hash_zones: (0..threads.hash).map(HashZone::new).collect(),
            dispatcher: Dispatcher::new(threads.logical, threads.physical, threads.hash),
            vios: VioPool::new(),
            scrubber: Scrubber::new(),
            packer: Packer::new(Packer::DEFAULT_BINS),
            compressor: Arc::new(RleCompressor),
            hasher: Arc::new(FnvChunkHasher),
            index: MemoryDedupeIndex::new(),
            admin: AdminState::Normal,
            read_only: ReadOnlyNotifier::new(),
            errors: ErrorStats::default(),
            requests: RequestStats::default(),
            sb_clean: false,
            device,
            config,
            layout,
            nonce,
            uuid,
        }
    }

    /// Clear the persisted CLEAN flag before the first mutation of a
    /// clean period, so an unclean shutdown is detected.
    fn mark_dirty(&mut self) -> CdsResult<()> {
        if !self.sb_clean {
            return Ok(());
        }
        self.write_super_block(false)?;
        self.device.flush()?;
        self.sb_clean = false;
        Ok(())
    }

    /// Create a fresh instance on `device`, destroying prior contents.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        config: CondenseConfig,
        nonce: Nonce,
        uuid: [u8; 16],
    ) -> CdsResult<Self> {
        config.validate()?;
        let layout = Layout::compute(&config, device.block_count())?;
        let mut instance = Self::build(device, config, layout, nonce, uuid, 1);

        // Empty root pages; the cache reformats structurally empty pages
        // on first touch.
        let zeros = vec![0u8; BLOCK_SIZE];
        for root in 0..instance.layout.root_count {
            instance
                .device
                .write_block(instance.layout.root_pbn(root), &zeros, false)?;
        }
        // Counters and summary establish the all-free baseline.
        for index in 0..instance.depot.slabs.len() {
            let slab = &mut instance.depot.slabs[index];
            let ref_origin = slab.ref_origin();
            slab.ref_counts.save_all(&*instance.device, ref_origin)?;
        }
        instance.write_super_block(true)?;
        instance.device.flush()?;
        instance.sb_clean = true;
        // The drain marks every slab clean in the summary.
        let device = instance.device.clone();
        instance.depot.drain(&*device, &mut instance.journal)?;
        log::info!(
            "formatted instance: {} slabs, {} roots, journal of {} blocks",
            instance.layout.slab_count,
            instance.layout.root_count,
            instance.layout.journal_blocks
        );
        Ok(instance)
    }

    /// Bring an existing instance online. Geometry comes from the super
    /// block; `config` supplies the runtime knobs (zones, cache size,
    /// tail pool, thresholds).
    pub fn load(device: Arc<dyn BlockDevice>, config: CondenseConfig) -> CdsResult<Self> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        // The super block location depends only on the index size, which
        // the caller must supply consistently.
        let super_pbn = 1 + config.index_blocks;
        device.read_block(super_pbn, &mut buf)?;
        let sb = SuperBlock::decode(&buf)?;
        let layout = sb.layout()?;

        let mut runtime = config;
        runtime.logical_blocks = sb.logical_blocks;
        runtime.slab_bits = sb.slab_bits;
        runtime.journal_blocks = sb.journal_blocks;
        runtime.block_map_roots = sb.root_count;
        runtime.write_policy = sb.write_policy;
        runtime.index_blocks = sb.index_blocks;
        runtime.validate()?;

        let clean = sb.is_clean();
        let tail = if clean { sb.journal_tail.max(1) } else { sb.journal_head.max(1) };
        let mut instance = Self::build(device, runtime, layout, sb.nonce, sb.uuid, tail);
        if sb.is_read_only() {
            // Restore the latch before anything rewrites the super block.
            instance.read_only.latch_from_disk();
        }

        let unrecovered = instance.depot.load(&*instance.device)?;
        instance.forest.load(&*instance.device)?;

        if clean {
            debug_assert!(unrecovered.is_empty());
            instance
                .journal
                .set_counters(sb.logical_blocks_used, sb.block_map_data_blocks);
            log::info!("loaded clean instance, journal tail {}", sb.journal_tail);
        } else {
            log::warn!("unclean shutdown detected, running recovery");
            instance.admin = AdminState::Scrubbing;
            for slab in unrecovered {
                instance.scrubber.register(&instance.depot, slab);
            }
            let mut scrubber = core::mem::take(&mut instance.scrubber);
            let device = instance.device.clone();
            scrubber.scrub_all(&mut instance.depot, &*device)?;
            instance.scrubber = scrubber;
            // Baseline counters from the last save; replay overrides them
            // with the values in the newest journal block.
            instance
                .journal
                .set_counters(sb.logical_blocks_used, sb.block_map_data_blocks);
            crate::journal::replay::replay(&mut instance, sb.journal_head.max(1))?;
            instance.admin = AdminState::Normal;
            instance.save()?;
        }
        instance.sb_clean = true;
        for name in ["admin", "depot", "journal", "block-map", "packer"] {
            instance.read_only.register_listener(name);
        }
        Ok(instance)
    }

    fn write_super_block(&mut self, clean: bool) -> CdsResult<()> {
        let mut flags = 0;
        if clean {
            flags |= FLAG_CLEAN;
        }
        if self.read_only.is_read_only() {
            flags |= FLAG_READ_ONLY;
        }
        let sb = SuperBlock {
            nonce: self.nonce,
            uuid: self.uuid,
            logical_blocks: self.config.logical_blocks,
            physical_blocks: self.layout.physical_blocks,
            index_blocks: self.layout.index_blocks,
            slab_bits: self.config.slab_bits,
            root_count: self.layout.root_count,
            journal_blocks: self.layout.journal_blocks,
            slab_count: self.depot.slab_count(),
            journal_head: self.journal.head(),
            journal_tail: self.journal.tail(),
            logical_blocks_used: self.journal.logical_blocks_used,
            block_map_data_blocks: self.journal.block_map_data_blocks,
            flags,
            write_policy: self.config.write_policy,
        };
        let mut buf = vec![0u8; BLOCK_SIZE];
        sb.encode(&mut buf);
        self.device
            .write_block(self.layout.super_block, &buf, true)
    }

    // ------------------------------------------------------------------
    // Request entry points
    // ------------------------------------------------------------------

    pub(crate) fn zone_for_lbn(&self, lbn: Lbn) -> u8 {
        let slot = block_map::slot_for_lbn(lbn, self.layout.root_count);
        slot.root % self.config.threads.logical
    }

    pub(crate) fn physical_zone_of(&self, pbn: Pbn) -> u8 {
        self.depot
            .slab_for_pbn(pbn)
            .map(|index| self.depot.zone_of(index))
            .unwrap_or(0)
    }

    fn admit(&self, is_write: bool) -> CdsResult<()> {
        if !self.admin.accepts_new_work() {
            return Err(CdsError::ShuttingDown);
        }
        if is_write && self.read_only.is_read_only() {
            return Err(CdsError::ReadOnly);
        }
        Ok(())
    }

    /// Submit a write of one block.
    pub fn write(&mut self, lbn: Lbn, data: &[u8]) -> CdsResult<VioId> {
        self.write_with_flags(lbn, data, VioFlags::empty())
    }

    /// Submit a write with explicit flush flags.
    pub fn write_with_flags(&mut self, lbn: Lbn, data: &[u8], flags: VioFlags) -> CdsResult<VioId> {
        self.admit(true)?;
        if lbn >= self.config.logical_blocks || data.len() != BLOCK_SIZE {
            return Err(CdsError::OutOfRange);
        }
        self.mark_dirty()?;
        if flags.contains(VioFlags::FLUSH_BEFORE) {
            self.device.flush()?;
        }
        let zone = self.zone_for_lbn(lbn);
        let id = self.vios.create(|id| {
            let mut vio = DataVio::new_write(id, lbn, data.to_vec(), flags);
            vio.logical_zone = zone;
            vio
        });
        self.dispatcher
            .enqueue(ZoneKind::Logical(zone), Action::new(id, Op::AttemptLbnLock));
        Ok(id)
    }

    /// Submit a read of one block.
    pub fn read(&mut self, lbn: Lbn) -> CdsResult<VioId> {
        self.admit(false)?;
        if lbn >= self.config.logical_blocks {
            return Err(CdsError::OutOfRange);
        }
        let zone = self.zone_for_lbn(lbn);
        let id = self.vios.create(|id| {
            let mut vio = DataVio::new_read(id, lbn);
            vio.logical_zone = zone;
            vio
        });
        self.dispatcher
            .enqueue(ZoneKind::Logical(zone), Action::new(id, Op::AttemptLbnLock));
        Ok(id)
    }

    /// Collect a finished request: its result and (for reads) the data.
    pub fn take_result(&mut self, id: VioId) -> Option<CdsResult<Vec<u8>>> {
        let vio = self.vios.get(id)?;
        if !vio.acked {
            return None;
        }
        let vio = self.vios.remove(id)?;
        Some(match vio.result {
            Some(error) => Err(error),
            None => Ok(vio.data),
        })
    }

    /// Write synchronously.
    pub fn write_sync(&mut self, lbn: Lbn, data: &[u8]) -> CdsResult<()> {
        let id = self.write(lbn, data)?;
        self.run_until_idle();
        self.take_result(id)
            .expect("request did not finish")
            .map(|_| ())
    }

    /// Read synchronously.
    pub fn read_sync(&mut self, lbn: Lbn) -> CdsResult<Vec<u8>> {
        let id = self.read(lbn)?;
        self.run_until_idle();
        self.take_result(id).expect("request did not finish")
    }

    /// Read-modify-write of a partial block.
    pub fn write_partial(&mut self, lbn: Lbn, offset: usize, data: &[u8]) -> CdsResult<()> {
        if offset + data.len() > BLOCK_SIZE {
            return Err(CdsError::OutOfRange);
        }
        let mut block = self.read_sync(lbn)?;
        block[offset..offset + data.len()].copy_from_slice(data);
        self.write_sync(lbn, &block)
    }

    // ------------------------------------------------------------------
    // The pump
    // ------------------------------------------------------------------

    /// Route an action to the zone its op runs on.
    pub(crate) fn route(&mut self, action: Action) {
        let Some(vio) = self.vios.get(action.vio) else {
            return;
        };
        let zone = match action.op {
            Op::AttemptLbnLock
            | Op::FindBlockMapSlot
            | Op::GetMappedBlockForRead
            | Op::GetMappedBlockForDedupe
            | Op::GetMappedBlockForWrite
            | Op::PutMappedBlock
            | Op::Hash
            | Op::AcknowledgeWrite => ZoneKind::Logical(vio.logical_zone),
            Op::AcquireHashLock
            | Op::CheckForDuplication
            | Op::Compress
            | Op::UpdateDedupeIndex => ZoneKind::Hash(vio.hash_zone),
            Op::JournalMapping | Op::JournalUnmapping => ZoneKind::Journal,
            Op::AttemptPacking => ZoneKind::Packer,
            Op::JournalIncrement => {
                ZoneKind::Physical(self.physical_zone_of(vio.new_location.pbn))
            }
            Op::JournalDecrement => {
                ZoneKind::Physical(self.physical_zone_of(vio.old_location.pbn))
            }
            Op::LockDuplicatePbn | Op::VerifyDuplication => {
                let pbn = vio.duplicate.map(|d| d.pbn).unwrap_or(0);
                ZoneKind::Physical(self.physical_zone_of(pbn))
            }
            Op::WriteData => {
                let pbn = vio.allocation.unwrap_or(0);
                ZoneKind::Physical(self.physical_zone_of(pbn))
            }
            Op::ReadData => {
                ZoneKind::Physical(self.physical_zone_of(vio.old_location.pbn))
            }
        };
        self.dispatcher.enqueue(zone, action);
    }

    /// Route a batch of woken waiters.
    pub(crate) fn route_all<I: IntoIterator<Item = Action>>(&mut self, actions: I) {
        for action in actions {
            self.route(action);
        }
    }

    fn step(&mut self, action: Action) {
        let Some(vio) = self.vios.get_mut(action.vio) else {
            return;
        };
        vio.last_op = action.op;
        match vio.kind {
            VioKind::Write => write::step(self, action),
            VioKind::Read => read::step(self, action),
        }
    }

    /// Journal commit, slab-journal thresholds, and space-pressure
    /// write-back. Returns whether anything moved.
    fn housekeeping(&mut self) -> bool {
        let mut progress = false;

        if !self.journal.is_quiescent() {
            let committed_before = self.journal.stats.blocks_committed;
            match self.journal.commit(&*self.device) {
                Ok(woken) => {
                    progress |= !woken.is_empty()
                        || self.journal.stats.blocks_committed != committed_before;
                    self.route_all(woken);
                }
                Err(error) => {
                    self.enter_read_only(error, "recovery journal commit");
                    // Whoever was waiting on durability fails cleanly
                    // rather than wedging the pump.
                    let orphans = self.journal.abandon();
                    progress |= !orphans.is_empty();
                    for action in orphans {
                        if let Some(vio) = self.vios.get_mut(action.vio) {
                            vio.set_error(error);
                        }
                        self.route(Action::new(action.vio, Op::AcknowledgeWrite));
                    }
                }
            }
        }

        match self.depot.flush_journals(&*self.device, &mut self.journal) {
            Ok(woken) => {
                progress |= !woken.is_empty();
                self.route_all(woken);
            }
            Err(error) => self.enter_read_only(error, "slab journal commit"),
        }

        if self.journal.has_space_waiters() {
            progress |= self.write_back_for_reap();
        }
        if self.journal.has_space_waiters() {
            // Space waiters can also be pinned by physical-zone locks in
            // shallow slab journals; push those out too.
            let device = self.device.clone();
            match self.depot.flush_all_journals(&*device, &mut self.journal) {
                Ok(woken) => {
                    progress |= !woken.is_empty();
                    self.route_all(woken);
                }
                Err(error) => self.enter_read_only(error, "slab journal flush"),
            }
        }
        progress
    }

    /// Journal space is exhausted: push dirty block-map pages out so
    /// their journal locks release and the head can advance. A barrier
    /// orders the committed journal ahead of the overwritten pages.
    fn write_back_for_reap(&mut self) -> bool {
        if self.config.write_policy.wants_barrier() {
            if let Err(error) = self.device.flush() {
                self.enter_read_only(error, "write-back barrier");
                return false;
            }
        }
        let mut progress = false;
        for zone in 0..self.block_map.len() {
            let device = self.device.clone();
            let released = match self.block_map[zone].cache.write_pages_locking_before(&*device, u64::MAX)
            {
                Ok(released) => released,
                Err(error) => {
                    self.enter_read_only(error, "block map write-back");
                    return progress;
                }
            };
            for sequence in released {
                if sequence == 0 {
                    continue;
                }
                progress = true;
                let woken =
                    self.journal
                        .release_lock(ZoneType::Logical, zone as u8, sequence);
                self.route_all(woken);
            }
        }
        progress
    }

    /// Seal and dispatch packer batches when the pipeline has stalled
    /// with fragments parked in bins.
    fn flush_packer_if_stalled(&mut self) -> bool {
        if self.packer.is_empty() {
            return false;
        }
        let batches = self.packer.flush();
        if batches.is_empty() {
            return false;
        }
        for batch in batches {
            write::dispatch_batch(self, batch);
        }
        true
    }

    /// Pump until every queue is empty and nothing further can move.
    pub fn run_until_idle(&mut self) {
        loop {
            let mut progress = false;
            while let Some(action) = self.dispatcher.dequeue() {
                progress = true;
                self.step(action);
            }
            progress |= self.housekeeping();
            if !self.dispatcher.is_idle() {
                continue;
            }
            if !progress && !self.flush_packer_if_stalled() {
                break;
            }
        }
    }

    pub(crate) fn enter_read_only(&mut self, error: CdsError, context: &str) {
        use core::sync::atomic::Ordering;
        if error == CdsError::Io {
            self.errors.io_errors.fetch_add(1, Ordering::Relaxed);
        }
        if !self.read_only.is_read_only() {
            self.errors.read_only_entries.fetch_add(1, Ordering::Relaxed);
            self.read_only.enter(error, context);
            // Best effort persistence of the latch.
            let _ = self.write_super_block(false);
        }
    }

    // ------------------------------------------------------------------
    // Admin operations
    // ------------------------------------------------------------------

    /// Commit the journal and barrier the device.
    pub fn flush(&mut self) -> CdsResult<()> {
        self.run_until_idle();
        let woken = self.journal.commit(&*self.device)?;
        self.route_all(woken);
        self.run_until_idle();
        self.device.flush()
    }

    fn drain(&mut self, kind: DrainKind) -> CdsResult<()> {
        self.admin = AdminState::Draining(kind);
        self.run_until_idle();

        for phase in DRAIN_PHASES {
            log::debug!("drain phase: {phase}");
            match phase {
                "depot" => {
                    let device = self.device.clone();
                    let woken = self.depot.drain(&*device, &mut self.journal)?;
                    self.route_all(woken);
                }
                "journal" => {
                    let woken = self.journal.commit(&*self.device)?;
                    self.route_all(woken);
                }
                "block-map" => {
                    if self.config.write_policy.wants_barrier() {
                        self.device.flush()?;
                    }
                    for zone in 0..self.block_map.len() {
                        let device = self.device.clone();
                        let released = self.block_map[zone].cache.flush_dirty(&*device)?;
                        for sequence in released {
                            if sequence != 0 {
                                let woken = self.journal.release_lock(
                                    ZoneType::Logical,
                                    zone as u8,
                                    sequence,
                                );
                                self.route_all(woken);
                            }
                        }
                    }
                    self.forest.save(&*self.device)?;
                }
                "logical-zones" => {
                    debug_assert!(self.logical_zones.iter().all(|z| z.lock_count() == 0));
                }
                "packer" => {
                    debug_assert!(self.packer.is_empty());
                }
                "flusher" => {
                    self.device.flush()?;
                }
                _ => unreachable!(),
            }
        }
        self.run_until_idle();
        Ok(())
    }

    /// Persist everything and mark the super block clean.
    pub fn save(&mut self) -> CdsResult<()> {
        self.drain(DrainKind::Save)?;
        self.write_super_block(true)?;
        self.device.flush()?;
        self.sb_clean = true;
        self.admin = AdminState::Normal;
        log::info!(
            "saved: journal head {} tail {}, {} logical blocks used",
            self.journal.head(),
            self.journal.tail(),
            self.journal.logical_blocks_used
        );
        Ok(())
    }

    /// Drain and stop accepting work.
    pub fn suspend(&mut self) -> CdsResult<()> {
        self.admin = AdminState::Suspending;
        self.drain(DrainKind::Suspend)?;
        self.write_super_block(true)?;
        self.device.flush()?;
        self.sb_clean = true;
        self.admin = AdminState::Suspended;
        Ok(())
    }

    /// Resume a suspended instance.
    pub fn resume(&mut self) -> CdsResult<()> {
        if !self.admin.is_quiescent() {
            return Err(CdsError::BadConfiguration);
        }
        self.admin = AdminState::Resuming;
        self.admin = AdminState::Normal;
        Ok(())
    }

    /// Extend the logical address space. The forest grows lazily; growth
    /// that would deepen the trees is not supported online.
    pub fn grow_logical(&mut self, new_logical_blocks: BlockCount) -> CdsResult<()> {
        if new_logical_blocks <= self.config.logical_blocks {
            return Err(CdsError::BadConfiguration);
        }
        let height = block_map::tree_height(new_logical_blocks, self.layout.root_count);
        if height != self.forest.height() {
            return Err(CdsError::BadConfiguration);
        }
        self.config.logical_blocks = new_logical_blocks;
        self.save()
    }

    /// Claim device space beyond the current slab array.
    pub fn grow_physical(&mut self) -> CdsResult<()> {
        let device_blocks = self.device.block_count();
        let usable = (device_blocks - self.layout.slab_origin) / self.layout.slab_blocks;
        let current = self.depot.slab_count() as u64;
        if usable <= current {
            return Err(CdsError::BadConfiguration);
        }
        self.depot.grow((usable - current) as u32)?;
        self.layout.slab_count = usable as u32;
        self.layout.physical_blocks = device_blocks;
        self.save()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Current mapping of `lbn`, bypassing the pipeline. Test and
    /// verification surface.
    pub fn probe_mapping(&mut self, lbn: Lbn) -> CdsResult<DataLocation> {
        let slot = block_map::slot_for_lbn(lbn, self.layout.root_count);
        let zone = self.zone_for_lbn(lbn) as usize;
        let Some(leaf) = self.forest.leaf_pbn(slot.root, slot.leaf) else {
            return Ok(DataLocation::UNMAPPED);
        };
        let device = self.device.clone();
        let waiter = Action::new(VioId(u32::MAX), Op::FindBlockMapSlot);
        let (get, released) =
            self.block_map[zone].read_entry(&*device, leaf, slot.entry, waiter)?;
        self.route_all(released);
        match get {
            crate::block_map::zone::EntryGet::Ready(entry) => Ok(entry),
            crate::block_map::zone::EntryGet::Parked => Err(CdsError::Io),
        }
    }

    /// Reference count of a physical block.
    pub fn reference_count(&self, pbn: Pbn) -> CdsResult<u8> {
        self.depot.reference_count(pbn)
    }

    /// Journal head (tests and invariant checks).
    pub fn journal_head(&self) -> SequenceNumber {
        self.journal.head()
    }

    /// Journal tail.
    pub fn journal_tail(&self) -> SequenceNumber {
        self.journal.tail()
    }

    /// Has the read-only latch tripped?
    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only()
    }

    /// Swap in an external compressor.
    pub fn set_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressor = compressor;
    }

    /// Swap in an external dedupe index.
    pub fn set_dedupe_index(&mut self, index: Arc<dyn DedupeIndex>) {
        self.index = index;
    }

    /// Swap in an external chunk hasher.
    pub fn set_chunk_hasher(&mut self, hasher: Arc<dyn ChunkHasher>) {
        self.hasher = hasher;
    }

    /// Point-in-time statistics snapshot.
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            requests: self.requests,
            journal: self.journal.stats,
            packer: self.packer.stats,
            scrubber: self.scrubber.stats,
            slab_summary: self.depot.summary.stats,
            errors: self.errors.snapshot(),
            logical_blocks_used: self.journal.logical_blocks_used,
            block_map_data_blocks: self.journal.block_map_data_blocks,
            free_blocks: self.depot.free_blocks(),
            ..Statistics::default()
        };
        for zone in &self.block_map {
            let c = &zone.cache.stats;
            let s = &mut stats.page_cache;
            s.hits += c.hits;
            s.misses += c.misses;
            s.loads += c.loads;
            s.reformats += c.reformats;
            s.evictions += c.evictions;
            s.dirty_writes += c.dirty_writes;
            s.wait_for_frame += c.wait_for_frame;
        }
        for allocator in &self.depot.allocators {
            let a = &allocator.stats;
            let s = &mut stats.block_allocator;
            s.allocations += a.allocations;
            s.provisional_releases += a.provisional_releases;
            s.no_space_errors += a.no_space_errors;
            s.slabs_reprioritized += a.slabs_reprioritized;
        }
        for slab in &self.depot.slabs {
            let j = &slab.journal.stats;
            let s = &mut stats.slab_journal;
            s.entries += j.entries;
            s.blocks_written += j.blocks_written;
            s.blocked_appends += j.blocked_appends;
            s.flushes += j.flushes;
            let r = &slab.ref_counts.stats;
            let t = &mut stats.ref_counts;
            t.increments += r.increments;
            t.decrements += r.decrements;
            t.provisional_grants += r.provisional_grants;
            t.provisional_releases += r.provisional_releases;
        }
        for zone in &self.hash_zones {
            let h = &zone.stats;
            let s = &mut stats.hash_locks;
            s.locks_created += h.locks_created;
            s.concurrent_waits += h.concurrent_waits;
            s.advice_valid += h.advice_valid;
            s.advice_stale += h.advice_stale;
            s.advice_timeouts += h.advice_timeouts;
            s.dedupe_shares += h.dedupe_shares;
        }
        for zone in &self.logical_zones {
            let l = &zone.stats;
            let s = &mut stats.logical_zones;
            s.locks_taken += l.locks_taken;
            s.contentions += l.contentions;
            s.read_shortcuts += l.read_shortcuts;
        }
        for zone in &self.physical_zones {
            let p = &zone.stats;
            let s = &mut stats.physical_zones;
            s.read_locks += p.read_locks;
            s.write_locks += p.write_locks;
            s.contentions += p.contentions;
        }
        stats
    }
}
