//! Write-path state machine.
//!
//! A write threads through: LBN lock, block-map slot resolution (with
//! lazy tree-page allocation), old-mapping read, hashing and the hash
//! lock, dedupe advice with verification, allocation, compression and
//! packing, the recovery-journal entry, and then the post-commit tail:
//! block-map update, reference-count increment and decrement, index
//! update, and acknowledgement. Every handler first honors the sticky
//! result: once a request has failed, stages only run their cleanup.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_map::{self, forest::TreeWalk};
use crate::block_map::zone::{EntryGet, EntryPut};
use crate::compress::CompressionResult;
use crate::config::WritePolicy;
use crate::core::{
    CdsError, DataLocation, MappingState, VioId,
};
use crate::dedupe::hash_zone::{HashLockOutcome, HashLockState};
use crate::instance::CondenseInstance;
use crate::journal::{self, AppendOutcome, JournalEntry, ZoneType};
use crate::logical::LbnLockOutcome;
use crate::packer::{PackOutcome, SealedBatch, COMPRESSED_BLOCK_DATA_SIZE};
use crate::pipeline::{Action, Op, VioCompression, VioFlags};
use crate::slab::RefOp;
use crate::BLOCK_SIZE;

/// Dispatch one write-path action.
pub(crate) fn step(inst: &mut CondenseInstance, action: Action) {
    let id = action.vio;
    let failed = inst
        .vios
        .get(id)
        .map_or(true, |vio| vio.result.is_some());
    if failed && action.op != Op::AcknowledgeWrite {
        finish(inst, id);
        return;
    }
    let result = match action.op {
        Op::AttemptLbnLock => attempt_lbn_lock(inst, id),
        Op::FindBlockMapSlot => find_block_map_slot(inst, id),
        Op::GetMappedBlockForWrite | Op::GetMappedBlockForDedupe => {
            get_mapped_block_for_write(inst, id)
        }
        Op::Hash => hash(inst, id),
        Op::AcquireHashLock => acquire_hash_lock(inst, id),
        Op::CheckForDuplication => check_for_duplication(inst, id),
        Op::LockDuplicatePbn => lock_duplicate_pbn(inst, id),
        Op::VerifyDuplication => verify_duplication(inst, id),
        Op::Compress => compress(inst, id),
        Op::AttemptPacking => attempt_packing(inst, id),
        Op::WriteData => write_data(inst, id),
        Op::JournalMapping | Op::JournalUnmapping => journal_mapping(inst, id),
        Op::PutMappedBlock => put_mapped_block(inst, id),
        Op::JournalIncrement => journal_increment(inst, id),
        Op::JournalDecrement => journal_decrement(inst, id),
        Op::UpdateDedupeIndex => update_dedupe_index(inst, id),
        Op::AcknowledgeWrite => {
            finish(inst, id);
            Ok(())
        }
        Op::GetMappedBlockForRead | Op::ReadData => {
            debug_assert!(false, "read op on a write request");
            Ok(())
        }
    };
    if let Err(error) = result {
        fail(inst, id, error);
    }
}

fn fail(inst: &mut CondenseInstance, id: VioId, error: CdsError) {
    if error.is_read_only_trigger() {
        inst.enter_read_only(error, "write path");
    }
    if let Some(vio) = inst.vios.get_mut(id) {
        vio.set_error(error);
    }
    finish(inst, id);
}

// ============================================================================
// Locking and Slot Resolution
// ============================================================================

fn attempt_lbn_lock(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (lbn, zone) = {
        let vio = inst.vios.get_mut(id).unwrap();
        (vio.lbn, vio.logical_zone as usize)
    };
    let outcome = inst.logical_zones[zone].try_lock(
        lbn,
        id,
        true,
        Action::new(id, Op::AttemptLbnLock),
    );
    match outcome {
        LbnLockOutcome::Acquired => {
            inst.vios.get_mut(id).unwrap().holds_lbn_lock = true;
            inst.route(Action::new(id, Op::FindBlockMapSlot));
        }
        LbnLockOutcome::Parked {
            holder,
            cancel_holder_packing,
        } => {
            if cancel_holder_packing {
                cancel_packing(inst, holder);
            }
        }
        LbnLockOutcome::ReadFromWriter(_) => unreachable!("writes never shortcut"),
    }
    Ok(())
}

/// A waiter is parked behind `holder`: pull the holder out of the packer
/// so it cannot sit in a half-full bin indefinitely.
pub(crate) fn cancel_packing(inst: &mut CondenseInstance, holder: VioId) {
    if !inst.packer.remove_lock_holder(holder) {
        return;
    }
    inst.packer.take_canceled(holder);
    if let Some(vio) = inst.vios.get_mut(holder) {
        if vio.compression == VioCompression::Compressing {
            vio.compression = VioCompression::Skipped;
            vio.fragment = None;
            inst.route(Action::new(holder, Op::WriteData));
        }
    }
}

/// Shared with the read path, which walks without allocating.
pub(crate) fn find_block_map_slot(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    // A tree-page reference update that parked in a slab journal runs
    // first; the walk restarts after it lands.
    if let Some((pbn, op, point)) = inst.vios.get(id).unwrap().pending_ref_update {
        let outcome = inst.depot.modify(
            pbn,
            op,
            point,
            Action::new(id, Op::FindBlockMapSlot),
            &mut inst.journal,
        )?;
        match outcome {
            crate::slab::depot::ModifyOutcome::Parked => return Ok(()),
            crate::slab::depot::ModifyOutcome::Applied => {
                inst.vios.get_mut(id).unwrap().pending_ref_update = None;
                let woken = inst
                    .journal
                    .release_lock(ZoneType::Journal, 0, point.sequence);
                inst.route_all(woken);
            }
        }
    }

    let (lbn, is_write) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.lbn, vio.is_write())
    };
    let slot = block_map::slot_for_lbn(lbn, inst.layout.root_count);
    inst.vios.get_mut(id).unwrap().tree_slot = slot;

    loop {
        match inst.forest.walk(slot.root, slot.leaf) {
            TreeWalk::Leaf(pbn) => {
                let vio = inst.vios.get_mut(id).unwrap();
                vio.leaf_pbn = pbn;
                let next = if is_write {
                    Op::GetMappedBlockForWrite
                } else {
                    Op::GetMappedBlockForRead
                };
                inst.route(Action::new(id, next));
                return Ok(());
            }
            TreeWalk::Missing { level, page_index } => {
                if !is_write {
                    // Unmapped subtree: the read completes with zeros.
                    let vio = inst.vios.get_mut(id).unwrap();
                    vio.leaf_pbn = crate::core::INVALID_PBN;
                    inst.route(Action::new(id, Op::GetMappedBlockForRead));
                    return Ok(());
                }
                if !allocate_tree_page(inst, id, slot.root, level, page_index)? {
                    return Ok(()); // parked
                }
            }
        }
    }
}

/// Allocate and journal one missing tree page. Returns false when the
/// request parked on journal back-pressure.
fn allocate_tree_page(
    inst: &mut CondenseInstance,
    id: VioId,
    root: u8,
    level: u8,
    page_index: u64,
) -> Result<bool, CdsError> {
    let zone = root % inst.config.threads.physical;
    let pbn = inst.depot.allocate(zone)?;
    // A recycled block may still hold another page's bytes; a zeroed
    // block is what the cache recognizes as structurally empty.
    let zeros = vec![0u8; BLOCK_SIZE];
    inst.device.write_block(pbn, &zeros, false)?;
    let entry = JournalEntry {
        key: journal::tree_page_key(root, level, page_index),
        old: DataLocation::UNMAPPED,
        new: DataLocation::new(pbn, MappingState::Uncompressed),
        inc_ref: true,
        block_map: true,
    };
    let retry = Action::new(id, Op::FindBlockMapSlot);
    match inst.journal.append(entry, retry, None) {
        AppendOutcome::Parked => {
            inst.depot.release_provisional(pbn)?;
            Ok(false)
        }
        AppendOutcome::Appended(point) => {
            inst.forest.insert_page(root, level, page_index, pbn);
            let outcome = inst.depot.modify(
                pbn,
                RefOp::BlockMapIncrement,
                point,
                retry,
                &mut inst.journal,
            )?;
            match outcome {
                crate::slab::depot::ModifyOutcome::Parked => {
                    inst.vios.get_mut(id).unwrap().pending_ref_update =
                        Some((pbn, RefOp::BlockMapIncrement, point));
                    Ok(false)
                }
                crate::slab::depot::ModifyOutcome::Applied => {
                    let woken = inst
                        .journal
                        .release_lock(ZoneType::Journal, 0, point.sequence);
                    inst.route_all(woken);
                    Ok(true)
                }
            }
        }
    }
}

fn get_mapped_block_for_write(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (leaf, zone, entry_index, is_zero) = {
        let vio = inst.vios.get(id).unwrap();
        (
            vio.leaf_pbn,
            vio.logical_zone as usize,
            vio.tree_slot.entry,
            vio.is_zero,
        )
    };
    let device = inst.device.clone();
    let waiter = Action::new(id, Op::GetMappedBlockForWrite);
    let (get, released) =
        inst.block_map[zone].read_entry(&*device, leaf, entry_index, waiter)?;
    inst.route_all(released);
    let entry = match get {
        EntryGet::Ready(entry) => entry,
        EntryGet::Parked => return Ok(()),
    };
    entry.check(inst.layout.physical_blocks)?;

    let vio = inst.vios.get_mut(id).unwrap();
    vio.old_location = entry;
    if is_zero {
        vio.new_location = DataLocation::UNMAPPED;
        inst.route(Action::new(id, Op::JournalUnmapping));
    } else {
        inst.route(Action::new(id, Op::Hash));
    }
    Ok(())
}

// ============================================================================
// Hashing and Deduplication
// ============================================================================

fn hash(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let name = {
        let vio = inst.vios.get(id).unwrap();
        inst.hasher.chunk_name(&vio.data)
    };
    let vio = inst.vios.get_mut(id).unwrap();
    vio.chunk_name = Some(name);
    vio.hash_zone = name.zone(inst.config.threads.hash);
    inst.route(Action::new(id, Op::AcquireHashLock));
    Ok(())
}

fn acquire_hash_lock(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (name, zone) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.chunk_name.unwrap(), vio.hash_zone as usize)
    };
    let outcome =
        inst.hash_zones[zone].acquire(name, id, Action::new(id, Op::CheckForDuplication));
    let vio = inst.vios.get_mut(id).unwrap();
    vio.holds_hash_lock = true;
    match outcome {
        HashLockOutcome::Agent => {
            vio.is_hash_agent = true;
            inst.route(Action::new(id, Op::CheckForDuplication));
        }
        HashLockOutcome::Parked => {}
        HashLockOutcome::Available(result) => adopt_shared_result(inst, id, result),
    }
    Ok(())
}

/// A hash-lock waiter (or late arrival) takes the agent's published
/// location as its dedupe candidate, still verifying the data.
fn adopt_shared_result(
    inst: &mut CondenseInstance,
    id: VioId,
    result: Option<DataLocation>,
) {
    let shareable = result
        .map(|loc| inst.depot.is_shareable(loc.pbn))
        .unwrap_or(false);
    if shareable {
        let zone = inst.vios.get(id).unwrap().hash_zone as usize;
        inst.hash_zones[zone].stats.dedupe_shares += 1;
        inst.vios.get_mut(id).unwrap().duplicate = result;
        inst.route(Action::new(id, Op::LockDuplicatePbn));
    } else {
        inst.route(Action::new(id, Op::Compress));
    }
}

fn check_for_duplication(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (name, zone, is_agent) = {
        let vio = inst.vios.get(id).unwrap();
        (
            vio.chunk_name.unwrap(),
            vio.hash_zone as usize,
            vio.is_hash_agent,
        )
    };
    if !is_agent {
        // Woken by the agent's publish.
        let result = inst.hash_zones[zone].result_of(&name);
        adopt_shared_result(inst, id, result);
        return Ok(());
    }

    inst.hash_zones[zone].set_state(&name, HashLockState::Querying);
    let advice = match inst.index.query(&name) {
        Ok(advice) => advice,
        Err(CdsError::Timeout) => {
            inst.hash_zones[zone].stats.advice_timeouts += 1;
            log::warn!("dedupe index timed out; continuing without advice");
            None
        }
        Err(error) => return Err(error),
    };
    let valid = advice.filter(|loc| {
        loc.check(inst.layout.physical_blocks).is_ok() && inst.depot.is_shareable(loc.pbn)
    });
    match valid {
        Some(location) => {
            inst.hash_zones[zone].stats.advice_valid += 1;
            inst.vios.get_mut(id).unwrap().duplicate = Some(location);
            inst.route(Action::new(id, Op::LockDuplicatePbn));
        }
        None => {
            if advice.is_some() {
                inst.hash_zones[zone].stats.advice_stale += 1;
                inst.errors
                    .invalid_advice
                    .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
            inst.route(Action::new(id, Op::Compress));
        }
    }
    Ok(())
}

fn lock_duplicate_pbn(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let dup = inst.vios.get(id).unwrap().duplicate.unwrap();
    let zone = inst.physical_zone_of(dup.pbn) as usize;
    if inst.physical_zones[zone].lock_read(dup.pbn, id) {
        inst.vios.get_mut(id).unwrap().duplicate_read_locked = true;
        inst.route(Action::new(id, Op::VerifyDuplication));
    } else {
        // Contended candidate: fall back to a plain write.
        inst.vios.get_mut(id).unwrap().duplicate = None;
        inst.route(Action::new(id, Op::Compress));
    }
    Ok(())
}

fn verify_duplication(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (dup, zone_hash, is_agent) = {
        let vio = inst.vios.get(id).unwrap();
        (
            vio.duplicate.unwrap(),
            vio.hash_zone as usize,
            vio.is_hash_agent,
        )
    };
    if is_agent {
        if let Some(name) = inst.vios.get(id).unwrap().chunk_name {
            inst.hash_zones[zone_hash].set_state(&name, HashLockState::Verifying);
        }
    }

    // Advice is advisory only: any failure to read or decode the
    // candidate just means it is not a usable duplicate.
    let mut candidate = vec![0u8; BLOCK_SIZE];
    let matches = match read_location(inst, dup, &mut candidate) {
        Ok(()) => candidate == inst.vios.get(id).unwrap().data,
        Err(_) => false,
    };

    if matches {
        let vio = inst.vios.get_mut(id).unwrap();
        vio.new_location = dup;
        inst.route(Action::new(id, Op::JournalMapping));
    } else {
        inst.hash_zones[zone_hash].stats.advice_stale += 1;
        inst.errors
            .invalid_advice
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let pz = inst.physical_zone_of(dup.pbn) as usize;
        inst.physical_zones[pz].unlock_read(dup.pbn);
        let vio = inst.vios.get_mut(id).unwrap();
        vio.duplicate = None;
        vio.duplicate_read_locked = false;
        inst.route(Action::new(id, Op::Compress));
    }
    Ok(())
}

/// Read the data a location names: plain block or compressed fragment.
pub(crate) fn read_location(
    inst: &CondenseInstance,
    location: DataLocation,
    out: &mut [u8],
) -> Result<(), CdsError> {
    match location.state {
        MappingState::Unmapped => {
            out.fill(0);
            Ok(())
        }
        MappingState::Uncompressed => inst.device.read_block(location.pbn, out),
        MappingState::Compressed(slot) => {
            let mut block = vec![0u8; BLOCK_SIZE];
            inst.device.read_block(location.pbn, &mut block)?;
            let fragment = crate::packer::fragment(&block, slot)?;
            inst.compressor.decompress(fragment, out)
        }
    }
}

// ============================================================================
// Allocation, Compression, Packing
// ============================================================================

fn compress(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    // Allocate first so the packer and the plain path both have a block.
    if inst.vios.get(id).unwrap().allocation.is_none() {
        let zone = inst.vios.get(id).unwrap().hash_zone % inst.config.threads.physical;
        let pbn = inst.depot.allocate(zone)?;
        let (lbn, logical_zone) = {
            let vio = inst.vios.get_mut(id).unwrap();
            vio.allocation = Some(pbn);
            (vio.lbn, vio.logical_zone as usize)
        };
        inst.logical_zones[logical_zone].mark_allocated(lbn);
    }
    if let Some(name) = inst.vios.get(id).unwrap().chunk_name {
        let zone = inst.vios.get(id).unwrap().hash_zone as usize;
        if inst.vios.get(id).unwrap().is_hash_agent {
            inst.hash_zones[zone].set_state(&name, HashLockState::Writing);
        }
    }

    let result = inst.compressor.compress(&inst.vios.get(id).unwrap().data);
    match result {
        CompressionResult::Compressed(fragment)
            if fragment.len() <= COMPRESSED_BLOCK_DATA_SIZE =>
        {
            let vio = inst.vios.get_mut(id).unwrap();
            vio.fragment = Some(fragment);
            vio.compression = VioCompression::Compressing;
            inst.route(Action::new(id, Op::AttemptPacking));
        }
        _ => {
            inst.vios.get_mut(id).unwrap().compression = VioCompression::Skipped;
            inst.route(Action::new(id, Op::WriteData));
        }
    }
    Ok(())
}

fn attempt_packing(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (fragment, lbn, zone) = {
        let vio = inst.vios.get(id).unwrap();
        debug_assert_eq!(vio.compression, VioCompression::Compressing);
        (
            vio.fragment.clone().unwrap(),
            vio.lbn,
            vio.logical_zone as usize,
        )
    };
    // A write others are queued behind must not sit in a half-full bin.
    if inst.logical_zones[zone].has_waiters(lbn) {
        inst.packer.stats.cancellations += 1;
        let vio = inst.vios.get_mut(id).unwrap();
        vio.compression = VioCompression::Skipped;
        vio.fragment = None;
        inst.route(Action::new(id, Op::WriteData));
        return Ok(());
    }
    match inst.packer.attempt(id, &fragment) {
        PackOutcome::Packed => Ok(()),
        PackOutcome::Sealed(batch) => {
            dispatch_batch(inst, batch);
            Ok(())
        }
        PackOutcome::Rejected => {
            let vio = inst.vios.get_mut(id).unwrap();
            vio.compression = VioCompression::Skipped;
            vio.fragment = None;
            inst.route(Action::new(id, Op::WriteData));
            Ok(())
        }
    }
}

/// Write out a sealed batch: the agent's block receives the compressed
/// block; every member's mapping moves to a compressed slot; clients
/// release their own provisional allocations.
pub(crate) fn dispatch_batch(inst: &mut CondenseInstance, batch: SealedBatch) {
    if batch.is_single() {
        let (member, _, _) = batch.members[0];
        if let Some(vio) = inst.vios.get_mut(member) {
            vio.compression = VioCompression::Skipped;
            vio.fragment = None;
            inst.route(Action::new(member, Op::WriteData));
        }
        return;
    }

    let Some(target) = inst.vios.get(batch.agent).and_then(|v| v.allocation) else {
        // The agent failed underneath the batch; everyone reverts to a
        // plain write.
        for (member, _, _) in batch.members {
            if let Some(vio) = inst.vios.get_mut(member) {
                vio.compression = VioCompression::Skipped;
                inst.route(Action::new(member, Op::WriteData));
            }
        }
        return;
    };

    if let Err(error) = inst.device.write_block(target, &batch.block, false) {
        for (member, _, _) in batch.members {
            fail(inst, member, error);
        }
        return;
    }

    for (member, slot, _) in batch.members {
        let released_allocation = {
            let Some(vio) = inst.vios.get_mut(member) else {
                continue;
            };
            vio.new_location = DataLocation::new(target, MappingState::Compressed(slot));
            vio.compression = VioCompression::Packed;
            vio.fragment = None;
            if member != batch.agent {
                vio.allocation.take()
            } else {
                None
            }
        };
        if let Some(pbn) = released_allocation {
            if let Err(error) = inst.depot.release_provisional(pbn) {
                fail(inst, member, error);
                continue;
            }
        }
        inst.route(Action::new(member, Op::JournalMapping));
    }
}

fn write_data(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (pbn, fua) = {
        let vio = inst.vios.get(id).unwrap();
        let fua = inst.config.write_policy == WritePolicy::Sync
            || vio.flags.contains(VioFlags::FLUSH_AFTER);
        (vio.allocation.expect("write without allocation"), fua)
    };
    let device = inst.device.clone();
    {
        let vio = inst.vios.get(id).unwrap();
        device.write_block(pbn, &vio.data, fua)?;
    }
    let vio = inst.vios.get_mut(id).unwrap();
    vio.new_location = DataLocation::new(pbn, MappingState::Uncompressed);
    inst.route(Action::new(id, Op::JournalMapping));
    Ok(())
}

// ============================================================================
// Journaling and the Post-Commit Tail
// ============================================================================

fn journal_mapping(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (lbn, old, new) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.lbn, vio.old_location, vio.new_location)
    };
    if !old.is_mapped() && !new.is_mapped() {
        // Writing zeros over an unmapped block changes nothing.
        inst.route(Action::new(id, Op::AcknowledgeWrite));
        return Ok(());
    }
    let entry = JournalEntry {
        key: lbn,
        old,
        new,
        inc_ref: new.is_mapped(),
        block_map: false,
    };
    let retry_op = if new.is_mapped() {
        Op::JournalMapping
    } else {
        Op::JournalUnmapping
    };
    match inst.journal.append(
        entry,
        Action::new(id, retry_op),
        Some(Action::new(id, Op::PutMappedBlock)),
    ) {
        AppendOutcome::Parked => Ok(()),
        AppendOutcome::Appended(point) => {
            let vio = inst.vios.get_mut(id).unwrap();
            vio.recovery_point = point;
            vio.holds_entry_lock = true;
            Ok(())
        }
    }
}

fn put_mapped_block(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (leaf, zone, entry_index, new, point) = {
        let vio = inst.vios.get(id).unwrap();
        (
            vio.leaf_pbn,
            vio.logical_zone as usize,
            vio.tree_slot.entry,
            vio.new_location,
            vio.recovery_point,
        )
    };
    let device = inst.device.clone();
    let waiter = Action::new(id, Op::PutMappedBlock);
    let (put, released) =
        inst.block_map[zone].update_entry(&*device, leaf, entry_index, new, point.sequence, waiter)?;
    inst.route_all(released);
    let transfer = match put {
        EntryPut::Applied(transfer) => transfer,
        EntryPut::Parked => return Ok(()),
    };
    if let Some(sequence) = transfer.acquire {
        inst.journal
            .acquire_lock(ZoneType::Logical, zone as u8, sequence);
    }
    if let Some(sequence) = transfer.release {
        let woken = inst
            .journal
            .release_lock(ZoneType::Logical, zone as u8, sequence);
        inst.route_all(woken);
    }

    // The update is in memory; the per-entry journal reference drops.
    let woken = inst
        .journal
        .release_lock(ZoneType::Journal, 0, point.sequence);
    inst.route_all(woken);
    let vio = inst.vios.get_mut(id).unwrap();
    vio.holds_entry_lock = false;

    let next = if vio.new_location.is_mapped() {
        Op::JournalIncrement
    } else {
        Op::JournalDecrement
    };
    inst.route(Action::new(id, next));
    Ok(())
}

fn journal_increment(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (new, point, old) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.new_location, vio.recovery_point, vio.old_location)
    };
    let outcome = inst.depot.modify(
        new.pbn,
        RefOp::DataIncrement,
        point,
        Action::new(id, Op::JournalIncrement),
        &mut inst.journal,
    )?;
    match outcome {
        crate::slab::depot::ModifyOutcome::Parked => Ok(()),
        crate::slab::depot::ModifyOutcome::Applied => {
            inst.vios.get_mut(id).unwrap().increment_done = true;
            let next = if old.is_mapped() {
                Op::JournalDecrement
            } else {
                Op::UpdateDedupeIndex
            };
            inst.route(Action::new(id, next));
            Ok(())
        }
    }
}

fn journal_decrement(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (old, point) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.old_location, vio.recovery_point)
    };
    let outcome = inst.depot.modify(
        old.pbn,
        RefOp::DataDecrement,
        point,
        Action::new(id, Op::JournalDecrement),
        &mut inst.journal,
    )?;
    match outcome {
        crate::slab::depot::ModifyOutcome::Parked => Ok(()),
        crate::slab::depot::ModifyOutcome::Applied => {
            inst.vios.get_mut(id).unwrap().decrement_done = true;
            inst.route(Action::new(id, Op::UpdateDedupeIndex));
            Ok(())
        }
    }
}

fn update_dedupe_index(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (name, new) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.chunk_name, vio.new_location)
    };
    if let Some(name) = name {
        if new.is_mapped() {
            inst.index.update(&name, new);
        }
    }
    inst.route(Action::new(id, Op::AcknowledgeWrite));
    Ok(())
}

// ============================================================================
// Completion
// ============================================================================

/// Common completion point for success and failure: publish and release
/// the hash lock, drop the duplicate lock, return an unconfirmed
/// allocation, release journal and LBN locks, honor flush-after, and
/// acknowledge.
pub(crate) fn finish(inst: &mut CondenseInstance, id: VioId) {
    let Some(vio) = inst.vios.get(id) else {
        return;
    };
    if vio.acked {
        return;
    }
    let lbn = vio.lbn;
    let logical_zone = vio.logical_zone as usize;
    let hash_zone = vio.hash_zone as usize;
    let name = vio.chunk_name;
    let holds_hash_lock = vio.holds_hash_lock;
    let is_agent = vio.is_hash_agent;
    let duplicate = vio.duplicate;
    let duplicate_read_locked = vio.duplicate_read_locked;
    let allocation = vio.allocation;
    let increment_done = vio.increment_done;
    let new_location = vio.new_location;
    let holds_entry_lock = vio.holds_entry_lock;
    let holds_lbn_lock = vio.holds_lbn_lock;
    let point = vio.recovery_point;
    let failed = vio.result.is_some();
    let is_zero = vio.is_zero;
    let compression = vio.compression.clone();
    let flags = vio.flags;

    // Hash lock: the agent publishes where the data landed (or that it
    // failed) so waiters can share or fall back; every holder releases.
    if holds_hash_lock {
        if let Some(name) = name {
            if is_agent {
                let result = (!failed && new_location.is_mapped()
                    && inst.depot.is_shareable(new_location.pbn))
                .then_some(new_location);
                let woken = inst.hash_zones[hash_zone].publish(&name, result);
                inst.route_all(woken);
            }
            inst.hash_zones[hash_zone].release(&name);
        }
    }

    if duplicate_read_locked {
        if let Some(dup) = duplicate {
            let pz = inst.physical_zone_of(dup.pbn) as usize;
            inst.physical_zones[pz].unlock_read(dup.pbn);
        }
    }

    // An allocation that never became the mapping goes back.
    let confirmed = increment_done && new_location.pbn == allocation.unwrap_or(u64::MAX);
    if let Some(pbn) = allocation {
        if !confirmed {
            let _ = inst.depot.release_provisional(pbn);
        }
    }

    if holds_entry_lock {
        let woken = inst
            .journal
            .release_lock(ZoneType::Journal, 0, point.sequence);
        inst.route_all(woken);
    }

    if holds_lbn_lock {
        let woken = inst.logical_zones[logical_zone].unlock(lbn, id);
        inst.route_all(woken);
    }

    if !failed && flags.contains(VioFlags::FLUSH_AFTER) {
        if let Err(error) = inst.device.flush() {
            inst.vios.get_mut(id).unwrap().set_error(error);
        }
    }

    let vio = inst.vios.get_mut(id).unwrap();
    vio.acked = true;
    vio.holds_hash_lock = false;
    vio.duplicate_read_locked = false;
    vio.holds_entry_lock = false;
    vio.holds_lbn_lock = false;
    if !confirmed {
        vio.allocation = None;
    }

    if vio.result.is_some() {
        inst.requests.failed_requests += 1;
    } else {
        inst.requests.writes += 1;
        if is_zero {
            inst.requests.zero_writes += 1;
        }
        if duplicate.is_some() && new_location == duplicate.unwrap_or(DataLocation::UNMAPPED) {
            inst.requests.dedupe_shares += 1;
        }
        if compression == VioCompression::Packed {
            inst.requests.compressed_writes += 1;
        }
    }
}
