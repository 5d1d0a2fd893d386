//! End-to-end pipeline behavior on a RAM-backed instance: writes, reads,
//! deduplication, zero-block elision, compressed packing, journal
//! back-pressure, and admission control.

use std::sync::Arc;

use condense::config::{CondenseConfig, SlabJournalThresholds};
use condense::core::MappingState;
use condense::{BlockDevice, CdsError, CondenseInstance, RamDevice, BLOCK_SIZE};

fn small_config() -> CondenseConfig {
    CondenseConfig {
        logical_blocks: 256,
        slab_bits: 6,
        journal_blocks: 8,
        tail_buffers: 2,
        cache_pages: 8,
        block_map_roots: 2,
        ..CondenseConfig::default()
    }
}

fn fresh_instance() -> (Arc<RamDevice>, CondenseInstance) {
    fresh_instance_with(small_config())
}

fn fresh_instance_with(config: CondenseConfig) -> (Arc<RamDevice>, CondenseInstance) {
    let device = Arc::new(RamDevice::new(2048));
    let instance =
        CondenseInstance::format(device.clone(), config, 0x5EED_CAFE, [9u8; 16]).unwrap();
    (device, instance)
}

fn pattern(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

/// A block whose run-length-coded form is exactly `target` bytes
/// (`target` must be even and small enough to leave runs under 255).
fn block_with_compressed_size(target: usize, seed: u8) -> Vec<u8> {
    assert!(target % 2 == 0);
    let runs = target / 2;
    assert!(runs >= BLOCK_SIZE / 255 && runs <= BLOCK_SIZE);
    let base = BLOCK_SIZE / runs;
    let mut remainder = BLOCK_SIZE - base * runs;
    let mut data = Vec::with_capacity(BLOCK_SIZE);
    for run in 0..runs {
        let mut length = base;
        if remainder > 0 {
            length += 1;
            remainder -= 1;
        }
        let byte = seed.wrapping_add((run % 2) as u8 + 1);
        data.extend(std::iter::repeat(byte).take(length));
    }
    assert_eq!(data.len(), BLOCK_SIZE);
    data
}

#[test]
fn write_then_read_round_trip() {
    let (_device, mut instance) = fresh_instance();
    let data = pattern(0x5A);
    instance.write_sync(12, &data).unwrap();
    assert_eq!(instance.read_sync(12).unwrap(), data);

    let stats = instance.statistics();
    assert_eq!(stats.requests.writes, 1);
    assert_eq!(stats.requests.reads, 1);
    assert_eq!(stats.logical_blocks_used, 1);
}

#[test]
fn duplicate_write_shares_one_physical_block() {
    let (_device, mut instance) = fresh_instance();
    let data = pattern(0xAA);
    instance.write_sync(3, &data).unwrap();
    instance.write_sync(5, &data).unwrap();

    let at3 = instance.probe_mapping(3).unwrap();
    let at5 = instance.probe_mapping(5).unwrap();
    assert!(at3.is_mapped());
    assert_eq!(at3, at5, "both LBNs must share one physical block");
    assert_eq!(instance.reference_count(at3.pbn).unwrap(), 2);

    // Only the first write allocated a data block.
    let stats = instance.statistics();
    assert_eq!(stats.block_allocator.allocations, 1);
    assert_eq!(stats.requests.dedupe_shares, 1);

    assert_eq!(instance.read_sync(3).unwrap(), data);
    assert_eq!(instance.read_sync(5).unwrap(), data);
}

#[test]
fn discard_unmaps_and_drops_one_reference() {
    let (_device, mut instance) = fresh_instance();
    let data = pattern(0xAA);
    instance.write_sync(3, &data).unwrap();
    instance.write_sync(5, &data).unwrap();
    let shared = instance.probe_mapping(3).unwrap();

    // A write of zeros is the discard.
    instance.write_sync(3, &vec![0u8; BLOCK_SIZE]).unwrap();
    assert!(!instance.probe_mapping(3).unwrap().is_mapped());
    assert_eq!(instance.reference_count(shared.pbn).unwrap(), 1);

    // The survivor still reads the pattern; the freed LBN reads zeros.
    assert_eq!(instance.read_sync(5).unwrap(), data);
    assert_eq!(instance.read_sync(3).unwrap(), vec![0u8; BLOCK_SIZE]);
}

#[test]
fn read_of_unmapped_block_returns_zeros() {
    let (_device, mut instance) = fresh_instance();
    assert_eq!(instance.read_sync(200).unwrap(), vec![0u8; BLOCK_SIZE]);
    assert!(!instance.probe_mapping(200).unwrap().is_mapped());
}

#[test]
fn zero_write_to_unmapped_block_is_a_noop() {
    let (_device, mut instance) = fresh_instance();
    instance.write_sync(9, &vec![0u8; BLOCK_SIZE]).unwrap();
    assert!(!instance.probe_mapping(9).unwrap().is_mapped());
    let stats = instance.statistics();
    assert_eq!(stats.block_allocator.allocations, 0);
    assert_eq!(stats.requests.zero_writes, 1);
}

#[test]
fn compressed_fragments_pack_into_one_block() {
    let (_device, mut instance) = fresh_instance();
    let blocks: Vec<Vec<u8>> = [(900, 10), (1100, 40), (1200, 70), (800, 100)]
        .iter()
        .map(|&(size, seed)| block_with_compressed_size(size, seed))
        .collect();

    // Submit all four before pumping so they meet in the packer.
    let ids: Vec<_> = blocks
        .iter()
        .enumerate()
        .map(|(i, data)| instance.write(20 + i as u64, data).unwrap())
        .collect();
    instance.run_until_idle();
    for id in ids {
        instance.take_result(id).unwrap().unwrap();
    }

    let mappings: Vec<_> = (0..4)
        .map(|i| instance.probe_mapping(20 + i).unwrap())
        .collect();
    let target = mappings[0].pbn;
    let mut slots = Vec::new();
    for mapping in &mappings {
        assert_eq!(mapping.pbn, target, "all fragments share one physical block");
        match mapping.state {
            MappingState::Compressed(slot) => slots.push(slot),
            other => panic!("expected a compressed mapping, got {other:?}"),
        }
    }
    slots.sort_unstable();
    assert_eq!(slots, [0, 1, 2, 3]);
    assert_eq!(instance.reference_count(target).unwrap(), 4);

    // Packer equivalence: every slot decompresses to its original data.
    for (i, data) in blocks.iter().enumerate() {
        assert_eq!(&instance.read_sync(20 + i as u64).unwrap(), data);
    }
    let stats = instance.statistics();
    assert_eq!(stats.requests.compressed_writes, 4);
    assert!(stats.packer.batches_sealed >= 1);
}

#[test]
fn concurrent_identical_writes_rendezvous_on_hash_lock() {
    let (_device, mut instance) = fresh_instance();
    // Incompressible so the agent takes the plain write path.
    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let ids: Vec<_> = (0..3)
        .map(|i| instance.write(40 + i, &data).unwrap())
        .collect();
    instance.run_until_idle();
    for id in ids {
        instance.take_result(id).unwrap().unwrap();
    }

    let first = instance.probe_mapping(40).unwrap();
    for lbn in 41..43 {
        assert_eq!(instance.probe_mapping(lbn).unwrap(), first);
    }
    assert_eq!(instance.reference_count(first.pbn).unwrap(), 3);
    let stats = instance.statistics();
    assert_eq!(stats.block_allocator.allocations, 1);
    assert!(stats.hash_locks.concurrent_waits >= 2);
}

#[test]
fn advice_timeout_degrades_to_no_advice() {
    let (_device, mut instance) = fresh_instance();
    let index = condense::dedupe::MemoryDedupeIndex::new();
    index.inject_timeouts(1);
    instance.set_dedupe_index(index);

    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 239) as u8).collect();
    instance.write_sync(1, &data).unwrap();
    let stats = instance.statistics();
    assert_eq!(stats.hash_locks.advice_timeouts, 1);

    // The index recovered; the second identical write dedupes.
    instance.write_sync(2, &data).unwrap();
    assert_eq!(
        instance.probe_mapping(1).unwrap(),
        instance.probe_mapping(2).unwrap()
    );
}

#[test]
fn stale_advice_is_verified_and_rejected() {
    let (_device, mut instance) = fresh_instance();
    let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 241) as u8).collect();
    instance.write_sync(1, &data).unwrap();
    let original = instance.probe_mapping(1).unwrap();

    // Overwrite LBN 1 so the indexed advice for `data` goes stale (its
    // block's reference drops to zero).
    let other: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 199) as u8).collect();
    instance.write_sync(1, &other).unwrap();
    assert_eq!(instance.reference_count(original.pbn).unwrap(), 0);

    // Writing `data` again follows the advice, finds it unusable, and
    // allocates fresh.
    instance.write_sync(2, &data).unwrap();
    assert_eq!(instance.read_sync(2).unwrap(), data);
    let stats = instance.statistics();
    assert!(stats.hash_locks.advice_stale >= 1);
}

#[test]
fn journal_back_pressure_parks_and_recovers() {
    let mut config = small_config();
    config.slab_journal_thresholds = Some(SlabJournalThresholds {
        flushing: 1,
        blocking: 2,
        scrubbing: 1,
    });
    let (_device, mut instance) = fresh_instance_with(config);

    // Sequential writes each seal their own journal block, so thirty-two
    // of them lap the eight-block journal several times and must wait on
    // reaping, which in turn forces block-map write-back.
    for lbn in 0..32u64 {
        let data: Vec<u8> = (0..BLOCK_SIZE)
            .map(|i| ((i as u64 + lbn) % 251) as u8)
            .collect();
        instance.write_sync(lbn, &data).unwrap();
    }
    let stats = instance.statistics();
    assert!(stats.journal.space_waits > 0, "space waiters never parked");
    assert!(stats.page_cache.dirty_writes > 0, "no write-back happened");
    assert!(instance.journal_head() <= instance.journal_tail());

    // Everything is still readable in order.
    for lbn in 0..32u64 {
        let expected: Vec<u8> = (0..BLOCK_SIZE)
            .map(|i| ((i as u64 + lbn) % 251) as u8)
            .collect();
        assert_eq!(instance.read_sync(lbn).unwrap(), expected);
    }
}

#[test]
fn contending_write_cancels_the_holder_out_of_the_packer() {
    let (_device, mut instance) = fresh_instance();
    // A compressible write that will park in the packer, then a second
    // write to the same LBN that must not wait forever behind it.
    let first = pattern(0x21);
    let second = pattern(0x22);
    let id1 = instance.write(8, &first).unwrap();
    let id2 = instance.write(8, &second).unwrap();
    instance.run_until_idle();
    instance.take_result(id1).unwrap().unwrap();
    instance.take_result(id2).unwrap().unwrap();

    // Updates to one LBN are serialized: the second write wins.
    assert_eq!(instance.read_sync(8).unwrap(), second);
    let stats = instance.statistics();
    assert!(stats.logical_zones.contentions >= 1);
    assert!(stats.packer.cancellations >= 1, "holder was never cancelled");
}

#[test]
fn read_contending_with_writer_sees_its_data() {
    let (_device, mut instance) = fresh_instance();
    let data = pattern(0x33);
    let write_id = instance.write(15, &data).unwrap();
    let read_id = instance.read(15).unwrap();
    instance.run_until_idle();
    instance.take_result(write_id).unwrap().unwrap();
    assert_eq!(instance.take_result(read_id).unwrap().unwrap(), data);
}

#[test]
fn suspend_refuses_new_work_until_resume() {
    let (_device, mut instance) = fresh_instance();
    instance.write_sync(1, &pattern(1)).unwrap();
    instance.suspend().unwrap();
    assert_eq!(
        instance.write(2, &pattern(2)).unwrap_err(),
        CdsError::ShuttingDown
    );
    assert_eq!(instance.read(1).unwrap_err(), CdsError::ShuttingDown);

    instance.resume().unwrap();
    instance.write_sync(2, &pattern(2)).unwrap();
    assert_eq!(instance.read_sync(1).unwrap(), pattern(1));
}

#[test]
fn bad_metadata_page_latches_read_only() {
    let (device, mut instance) = fresh_instance();
    // Corrupt the first block-map root in place: not all-zero, not a
    // valid page.
    let mut junk = vec![0u8; BLOCK_SIZE];
    junk[0] = 0xEE;
    device.write_block(2, &junk, true).unwrap();

    // LBN 0 routes to root 0; the load fails validation on a live path.
    let err = instance.write_sync(0, &pattern(7)).unwrap_err();
    assert_eq!(err, CdsError::BadPage);
    assert!(instance.is_read_only());

    // The latch is one-way: new writes are refused outright.
    assert_eq!(instance.write(9, &pattern(7)).unwrap_err(), CdsError::ReadOnly);
    let stats = instance.statistics();
    assert_eq!(stats.errors.read_only_entries, 1);
}

#[test]
fn grow_logical_extends_the_address_space() {
    let (_device, mut instance) = fresh_instance();
    assert_eq!(
        instance.write(300, &pattern(1)).unwrap_err(),
        CdsError::OutOfRange
    );
    instance.grow_logical(512).unwrap();
    instance.write_sync(300, &pattern(3)).unwrap();
    assert_eq!(instance.read_sync(300).unwrap(), pattern(3));
}

#[test]
fn read_modify_write_merges_partial_blocks() {
    let (_device, mut instance) = fresh_instance();
    instance.write_sync(6, &pattern(0x11)).unwrap();
    instance.write_partial(6, 100, &[0xFF; 8]).unwrap();
    let readback = instance.read_sync(6).unwrap();
    assert_eq!(&readback[..100], &pattern(0x11)[..100]);
    assert_eq!(&readback[100..108], &[0xFF; 8]);
    assert_eq!(&readback[108..], &pattern(0x11)[108..]);
}

#[test]
fn flush_after_makes_write_durable() {
    let (device, mut instance) = fresh_instance();
    let data = pattern(0x77);
    let id = instance
        .write_with_flags(4, &data, condense::pipeline::VioFlags::FLUSH_AFTER)
        .unwrap();
    instance.run_until_idle();
    instance.take_result(id).unwrap().unwrap();

    // The data block must already be durable.
    let mapping = instance.probe_mapping(4).unwrap();
    assert!(mapping.is_mapped());
    if mapping.state == MappingState::Uncompressed {
        assert_eq!(device.durable_block(mapping.pbn), data);
    }
}
