//! Property tests for the core invariants: mapping round-trips (with and
//! without a crash in between), reference-count consistency at quiescent
//! points, journal reap safety, and compressed fragment bounds.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use condense::config::CondenseConfig;
use condense::core::MappingState;
use condense::{CondenseInstance, RamDevice, BLOCK_SIZE};

fn small_config() -> CondenseConfig {
    CondenseConfig {
        logical_blocks: 64,
        slab_bits: 6,
        journal_blocks: 8,
        tail_buffers: 2,
        cache_pages: 8,
        block_map_roots: 2,
        ..CondenseConfig::default()
    }
}

fn fresh() -> (Arc<RamDevice>, CondenseInstance) {
    let device = Arc::new(RamDevice::new(2048));
    let instance =
        CondenseInstance::format(device.clone(), small_config(), 0xBEEF, [1u8; 16]).unwrap();
    (device, instance)
}

/// Writes are a pair: target LBN and a fill byte. Byte 0 is a discard,
/// and a small byte range guarantees plenty of duplicates.
fn workload() -> impl Strategy<Value = Vec<(u64, u8)>> {
    prop_vec((0u64..64, 0u8..6), 1..40)
}

fn expected_state(ops: &[(u64, u8)]) -> HashMap<u64, u8> {
    let mut state = HashMap::new();
    for &(lbn, byte) in ops {
        state.insert(lbn, byte);
    }
    state
}

fn check_round_trip(instance: &mut CondenseInstance, state: &HashMap<u64, u8>) {
    for (&lbn, &byte) in state {
        let data = instance.read_sync(lbn).unwrap();
        assert_eq!(data, vec![byte; BLOCK_SIZE], "lbn {lbn}");
    }
}

fn check_refcounts(instance: &mut CondenseInstance) {
    let mut named: HashMap<u64, u64> = HashMap::new();
    for lbn in 0..64 {
        let mapping = instance.probe_mapping(lbn).unwrap();
        if mapping.is_mapped() {
            *named.entry(mapping.pbn).or_insert(0) += 1;
        }
    }
    for (pbn, expected) in named {
        assert_eq!(
            instance.reference_count(pbn).unwrap() as u64,
            expected,
            "pbn {pbn}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn mapping_round_trip(ops in workload()) {
        let (_device, mut instance) = fresh();
        for &(lbn, byte) in &ops {
            instance.write_sync(lbn, &vec![byte; BLOCK_SIZE]).unwrap();
        }
        let state = expected_state(&ops);
        check_round_trip(&mut instance, &state);
        check_refcounts(&mut instance);
        prop_assert!(instance.journal_head() <= instance.journal_tail());
    }

    #[test]
    fn mapping_round_trip_survives_crash(ops in workload()) {
        let (device, mut instance) = fresh();
        for &(lbn, byte) in &ops {
            instance.write_sync(lbn, &vec![byte; BLOCK_SIZE]).unwrap();
        }
        drop(instance);
        device.power_cut();

        let mut recovered =
            CondenseInstance::load(device.clone(), small_config()).unwrap();
        let state = expected_state(&ops);
        check_round_trip(&mut recovered, &state);
        check_refcounts(&mut recovered);
    }

    #[test]
    fn save_reload_is_lossless(ops in workload()) {
        let (device, mut instance) = fresh();
        for &(lbn, byte) in &ops {
            instance.write_sync(lbn, &vec![byte; BLOCK_SIZE]).unwrap();
        }
        instance.save().unwrap();
        // Reap safety at the quiescent point: nothing is left locked.
        prop_assert_eq!(instance.journal_head(), instance.journal_tail());
        drop(instance);

        let mut reloaded =
            CondenseInstance::load(device.clone(), small_config()).unwrap();
        let state = expected_state(&ops);
        check_round_trip(&mut reloaded, &state);
        check_refcounts(&mut reloaded);
    }

    #[test]
    fn compressed_fragment_bounds_hold(fragment in prop_vec(any::<u8>(), 0..BLOCK_SIZE)) {
        // Decoding any slot of an arbitrary block either yields an
        // in-bounds fragment or a clean InvalidFragment error.
        let mut block = vec![0u8; BLOCK_SIZE];
        let len = fragment.len().min(BLOCK_SIZE);
        block[..len].copy_from_slice(&fragment[..len]);
        for slot in 0..14u8 {
            if let Ok(bytes) = condense::packer::fragment(&block, slot) {
                prop_assert!(bytes.len() <= BLOCK_SIZE);
            }
        }
    }
}

#[test]
fn dedupe_heavy_workload_keeps_counts_consistent() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (_device, mut instance) = fresh();
    let mut rng = StdRng::seed_from_u64(0xC0DE);
    for _ in 0..200 {
        let lbn = rng.gen_range(0..64);
        let byte = rng.gen_range(0..4u8);
        instance.write_sync(lbn, &vec![byte; BLOCK_SIZE]).unwrap();
    }
    check_refcounts(&mut instance);
    let stats = instance.statistics();
    assert!(stats.requests.dedupe_shares > 0, "workload must dedupe");
    assert!(instance.journal_head() <= instance.journal_tail());
}
