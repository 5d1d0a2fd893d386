//! Read-path state machine.
//!
//! Reads take the LBN lock, resolve the block-map slot (never
//! allocating), fetch the mapping, and read the data: zeros for an
//! unmapped block, a plain block read, or a compressed-fragment decode.
//! A read contending with a write that has already allocated
//! short-circuits by copying the writer's buffer.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_map::zone::EntryGet;
use crate::core::{CdsError, DataLocation, VioId, INVALID_PBN};
use crate::instance::CondenseInstance;
use crate::logical::LbnLockOutcome;
use crate::pipeline::{write, Action, Op};
use crate::BLOCK_SIZE;

/// Dispatch one read-path action.
pub(crate) fn step(inst: &mut CondenseInstance, action: Action) {
    let id = action.vio;
    let failed = inst
        .vios
        .get(id)
        .map_or(true, |vio| vio.result.is_some());
    if failed {
        finish(inst, id);
        return;
    }
    let result = match action.op {
        Op::AttemptLbnLock => attempt_lbn_lock(inst, id),
        Op::FindBlockMapSlot => write::find_block_map_slot(inst, id),
        Op::GetMappedBlockForRead => get_mapped_block_for_read(inst, id),
        Op::ReadData => read_data(inst, id),
        _ => {
            debug_assert!(false, "write op on a read request");
            Ok(())
        }
    };
    if let Err(error) = result {
        if let Some(vio) = inst.vios.get_mut(id) {
            vio.set_error(error);
        }
        finish(inst, id);
    }
}

fn attempt_lbn_lock(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (lbn, zone) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.lbn, vio.logical_zone as usize)
    };
    let outcome = inst.logical_zones[zone].try_lock(
        lbn,
        id,
        false,
        Action::new(id, Op::AttemptLbnLock),
    );
    match outcome {
        LbnLockOutcome::Acquired => {
            inst.vios.get_mut(id).unwrap().holds_lbn_lock = true;
            inst.route(Action::new(id, Op::FindBlockMapSlot));
        }
        LbnLockOutcome::ReadFromWriter(holder) => {
            // The writer's buffer already holds the final data.
            let data = inst.vios.get(holder).map(|writer| writer.data.clone());
            match data {
                Some(data) => {
                    let vio = inst.vios.get_mut(id).unwrap();
                    vio.data = data;
                    finish(inst, id);
                }
                None => {
                    // Holder vanished between lock check and copy.
                    inst.route(Action::new(id, Op::AttemptLbnLock));
                }
            }
        }
        LbnLockOutcome::Parked {
            holder,
            cancel_holder_packing,
        } => {
            if cancel_holder_packing {
                write::cancel_packing(inst, holder);
            }
        }
    }
    Ok(())
}

fn get_mapped_block_for_read(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let (leaf, zone, entry_index) = {
        let vio = inst.vios.get(id).unwrap();
        (vio.leaf_pbn, vio.logical_zone as usize, vio.tree_slot.entry)
    };
    if leaf == INVALID_PBN {
        inst.vios.get_mut(id).unwrap().old_location = DataLocation::UNMAPPED;
        inst.route(Action::new(id, Op::ReadData));
        return Ok(());
    }
    let device = inst.device.clone();
    let waiter = Action::new(id, Op::GetMappedBlockForRead);
    let result = inst.block_map[zone].read_entry(&*device, leaf, entry_index, waiter);
    let (get, released) = match result {
        Ok(parts) => parts,
        Err(error) => {
            if error.is_read_only_trigger() {
                inst.enter_read_only(error, "block map read");
            }
            return Err(error);
        }
    };
    inst.route_all(released);
    let entry = match get {
        EntryGet::Ready(entry) => entry,
        EntryGet::Parked => return Ok(()),
    };
    entry.check(inst.layout.physical_blocks)?;
    inst.vios.get_mut(id).unwrap().old_location = entry;
    inst.route(Action::new(id, Op::ReadData));
    Ok(())
}

fn read_data(inst: &mut CondenseInstance, id: VioId) -> Result<(), CdsError> {
    let location = inst.vios.get(id).unwrap().old_location;
    let mut out = vec![0u8; BLOCK_SIZE];
    write::read_location(inst, location, &mut out)?;
    inst.vios.get_mut(id).unwrap().data = out;
    finish(inst, id);
    Ok(())
}

/// Completion: release the LBN lock and acknowledge.
fn finish(inst: &mut CondenseInstance, id: VioId) {
    let Some(vio) = inst.vios.get(id) else {
        return;
    };
    if vio.acked {
        return;
    }
    let (lbn, zone, holds_lock, failed) = (
        vio.lbn,
        vio.logical_zone as usize,
        vio.holds_lbn_lock,
        vio.result.is_some(),
    );
    if holds_lock {
        let woken = inst.logical_zones[zone].unlock(lbn, id);
        inst.route_all(woken);
    }
    let vio = inst.vios.get_mut(id).unwrap();
    vio.acked = true;
    vio.holds_lbn_lock = false;
    if failed {
        inst.requests.failed_requests += 1;
    } else {
        inst.requests.reads += 1;
    }
}
