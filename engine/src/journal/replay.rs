//! Restart replay of the recovery journal.
//!
//! After an unclean shutdown the slabs have already been scrubbed; this
//! pass walks the journal from the saved head, validating each block's
//! nonce, check byte, and entry bounds, and reapplies every mapping
//! delta: tree-page allocations back into the forest, mapping changes
//! into block-map leaves (through the cache in rebuild mode), and
//! reference-count deltas through the slab journals, where the recovery
//! fence makes already-present entries no-ops.

use alloc::vec;
use alloc::vec::Vec;

use crate::core::{CdsError, CdsResult, JournalPoint, Pbn, SequenceNumber, VioId};
use crate::instance::CondenseInstance;
use crate::journal::{decode_block, decode_tree_page_key, probe_block, JournalBlock};
use crate::pipeline::{Action, Op};
use crate::slab::depot::ModifyOutcome;
use crate::slab::RefOp;
use crate::BLOCK_SIZE;

/// Replay the live journal window. `head_hint` comes from the super
/// block but can be stale once the journal has lapped; the true head is
/// the one recorded in the newest valid block on disk, whose commit
/// implied everything before it was already durable.
pub(crate) fn replay(inst: &mut CondenseInstance, head_hint: SequenceNumber) -> CdsResult<()> {
    for zone in &mut inst.block_map {
        zone.cache.set_rebuild_mode(true);
    }
    let device = inst.device.clone();
    let size = inst.layout.journal_blocks;
    let mut buf = vec![0u8; BLOCK_SIZE];

    // Survey every slot for the newest block we wrote.
    let mut newest: Option<(SequenceNumber, SequenceNumber)> = None;
    for slot in 0..size {
        device.read_block(inst.layout.journal_origin + slot, &mut buf)?;
        if let Some(block) = probe_block(&buf, inst.nonce, size, slot)? {
            if newest.map_or(true, |(sequence, _)| block.sequence > sequence) {
                newest = Some((block.sequence, block.head));
            }
        }
    }
    let head = newest.map_or(head_hint, |(_, head)| head.max(head_hint)).max(1);

    let mut blocks: Vec<JournalBlock> = Vec::new();
    let mut sequence = head;
    loop {
        device.read_block(inst.layout.journal_pbn(sequence), &mut buf)?;
        let Some(block) = decode_block(&buf, inst.nonce, size, sequence)? else {
            break;
        };
        blocks.push(block);
        sequence += 1;
        if sequence - head > size {
            // A journal can never hold more live blocks than slots.
            return Err(CdsError::CorruptJournal);
        }
    }
    let tail = sequence.max(1);
    inst.journal.reset_after_replay(tail);

    let mut entries_replayed = 0u64;
    let mut counters = None;
    for block in &blocks {
        counters = Some((block.logical_blocks_used, block.block_map_data_blocks));
        for (index, entry) in block.entries.iter().enumerate() {
            let point = JournalPoint::new(block.sequence, index as u16);
            if entry.block_map {
                replay_tree_page(inst, entry.key, entry.new.pbn, point)?;
            } else {
                replay_mapping(inst, block.sequence, entry, point)?;
            }
            entries_replayed += 1;
        }
    }

    // Push the rebuilt state out before the journal window is retired.
    for zone in 0..inst.block_map.len() {
        inst.block_map[zone].cache.flush_dirty(&*device)?;
    }
    inst.forest.save(&*device)?;
    device.flush()?;
    if let Some((logical_blocks_used, block_map_data_blocks)) = counters {
        inst.journal
            .set_counters(logical_blocks_used, block_map_data_blocks);
    }
    for zone in &mut inst.block_map {
        zone.cache.set_rebuild_mode(false);
    }
    log::info!(
        "recovery replayed {entries_replayed} entries from journal [{head}, {tail})"
    );
    Ok(())
}

fn replay_tree_page(
    inst: &mut CondenseInstance,
    key: u64,
    pbn: Pbn,
    point: JournalPoint,
) -> CdsResult<()> {
    let Some((root, level, page_index)) = decode_tree_page_key(key) else {
        return Err(CdsError::CorruptJournal);
    };
    if root >= inst.layout.root_count {
        return Err(CdsError::CorruptJournal);
    }
    match inst.forest.page_pbn(root, level, page_index) {
        Some(existing) if existing == pbn => {}
        Some(_) => return Err(CdsError::CorruptJournal),
        None => inst.forest.insert_page(root, level, page_index, pbn),
    }
    modify_with_retry(inst, pbn, RefOp::BlockMapIncrement, point)
}

fn replay_mapping(
    inst: &mut CondenseInstance,
    sequence: SequenceNumber,
    entry: &crate::journal::JournalEntry,
    point: JournalPoint,
) -> CdsResult<()> {
    let slot = crate::block_map::slot_for_lbn(entry.key, inst.layout.root_count);
    let Some(leaf) = inst.forest.leaf_pbn(slot.root, slot.leaf) else {
        // The leaf's allocation entry must precede any mapping into it.
        return Err(CdsError::CorruptJournal);
    };
    let zone = inst.zone_for_lbn(entry.key) as usize;
    let device = inst.device.clone();
    let waiter = Action::new(VioId(u32::MAX), Op::PutMappedBlock);
    // No lock counter wiring during replay; the transfer result is
    // deliberately dropped.
    let (put, _released) = inst.block_map[zone].update_entry(
        &*device,
        leaf,
        slot.entry,
        entry.new,
        sequence,
        waiter,
    )?;
    if put == crate::block_map::zone::EntryPut::Parked {
        return Err(CdsError::Io);
    }

    if entry.new.is_mapped() && entry.inc_ref {
        modify_with_retry(inst, entry.new.pbn, RefOp::DataIncrement, point)?;
    }
    if entry.old.is_mapped() {
        modify_with_retry(inst, entry.old.pbn, RefOp::DataDecrement, point)?;
    }
    Ok(())
}

/// Apply one reference delta, force-flushing the slab journal if it is
/// at its blocking threshold.
fn modify_with_retry(
    inst: &mut CondenseInstance,
    pbn: Pbn,
    op: RefOp,
    point: JournalPoint,
) -> CdsResult<()> {
    let dummy = Action::new(VioId(u32::MAX), Op::JournalIncrement);
    let device = inst.device.clone();
    for _ in 0..2 {
        match inst.depot.modify(pbn, op, point, dummy, &mut inst.journal)? {
            ModifyOutcome::Applied => return Ok(()),
            ModifyOutcome::Parked => {
                let index = inst.depot.slab_for_pbn(pbn)?;
                let woken = inst
                    .depot
                    .force_flush_slab(index, &*device, &mut inst.journal)?;
                drop(woken);
            }
        }
    }
    Err(CdsError::CorruptJournal)
}
