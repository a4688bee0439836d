//! Property-based tests for allocator and index agreement
//!
//! Uses proptest to drive random store/release sequences and check that the
//! folder bitmaps always match the sector index.

use contract_manager::{
    BitmapAllocator, ContractManager, ContractManagerBuilder, ContractManagerError,
    MemorySectorIo, MemoryStore, SectorId,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SIZE: usize = 512;

#[derive(Debug, Clone)]
enum Op {
    Store(u8),
    Release(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..40).prop_map(Op::Store),
        2 => (0u8..40).prop_map(Op::Release),
    ]
}

fn open(io: Arc<MemorySectorIo>, store: Arc<MemoryStore>) -> ContractManager {
    ContractManagerBuilder::new("memory")
        .sector_size(SIZE as u64)
        .folder_slots(1, 1024)
        .probe_limit(4)
        .sector_io(io)
        .metadata_store(store)
        .open()
        .unwrap()
}

fn sector(key: u8) -> Vec<u8> {
    vec![key; SIZE]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_bitmaps_match_index(ops in prop::collection::vec(op(), 1..120)) {
        let io = Arc::new(MemorySectorIo::new());
        let store = Arc::new(MemoryStore::new());
        let manager = open(io.clone(), store.clone());
        let small = manager.add_folder("small", 16).unwrap();
        let large = manager.add_folder("large", 20).unwrap();

        let mut model: HashMap<u8, u16> = HashMap::new();
        let ids: HashMap<u8, SectorId> =
            (0..40u8).map(|k| (k, manager.sector_id(&sector(k)))).collect();

        for op in &ops {
            match *op {
                Op::Store(key) => match manager.store_sector(ids[&key], &sector(key)) {
                    Ok(outcome) => {
                        let count = model.entry(key).or_insert(0);
                        *count += 1;
                        prop_assert_eq!(outcome.location.count, *count);
                    }
                    Err(ContractManagerError::NoSpace) => {
                        prop_assert!(!model.contains_key(&key));
                        prop_assert_eq!(model.len(), 36);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                },
                Op::Release(key) => match manager.release_sector(&ids[&key]) {
                    Ok(remaining) => {
                        let count = model.get_mut(&key).unwrap();
                        *count -= 1;
                        prop_assert_eq!(remaining, *count);
                        if *count == 0 {
                            model.remove(&key);
                        }
                    }
                    Err(ContractManagerError::SectorNotFound(_)) => {
                        prop_assert!(!model.contains_key(&key));
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                },
            }
        }

        let report = manager.check_consistency();
        prop_assert!(report.is_consistent(), "{:?}", report);
        prop_assert_eq!(manager.sector_count(), model.len());

        let used = manager.folder_usage(small).unwrap().used
            + manager.folder_usage(large).unwrap().used;
        prop_assert_eq!(used, model.len() as u64);

        let mut slots = HashSet::new();
        for (key, count) in &model {
            let location = manager.sector_location(&ids[key]).unwrap();
            prop_assert_eq!(location.count, *count);
            prop_assert!(slots.insert(location.slot()));
        }

        // Replaying the log yields the same state
        drop(manager);
        let reopened = open(io, store);
        prop_assert!(reopened.check_consistency().is_consistent());
        prop_assert_eq!(reopened.sector_count(), model.len());
        for (key, count) in &model {
            prop_assert_eq!(reopened.sector_location(&ids[key]).unwrap().count, *count);
            prop_assert_eq!(reopened.fetch_sector(&ids[key]).unwrap(), sector(*key));
        }
    }

    #[test]
    fn prop_no_double_allocation(
        capacity in 1u32..300,
        steps in prop::collection::vec(any::<bool>(), 1..600),
        seed in any::<u64>(),
    ) {
        let mut allocator = BitmapAllocator::new(capacity);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut held: Vec<u32> = Vec::new();
        let mut held_set = HashSet::new();

        for allocate in steps {
            if allocate || held.is_empty() {
                match allocator.allocate(&mut rng, 8) {
                    Ok(slot) => {
                        prop_assert!(slot < capacity);
                        prop_assert!(held_set.insert(slot), "slot {} allocated twice", slot);
                        held.push(slot);
                    }
                    Err(ContractManagerError::NoSpace) => {
                        prop_assert_eq!(held.len() as u32, capacity);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            } else {
                let slot = held.swap_remove(seed as usize % held.len());
                held_set.remove(&slot);
                allocator.release(slot).unwrap();
            }
            prop_assert_eq!(allocator.used_count() as usize, held.len());
        }

        let used: HashSet<u32> = allocator.used_slots().collect();
        prop_assert_eq!(used, held_set);
    }

    #[test]
    fn prop_shrink_never_strands_used_slots(
        capacity in 64u32..512,
        fill in 0u32..64,
        new_capacity in 1u32..512,
        seed in any::<u64>(),
    ) {
        let mut allocator = BitmapAllocator::new(capacity);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..fill {
            allocator.allocate(&mut rng, 8).unwrap();
        }
        let before: HashSet<u32> = allocator.used_slots().collect();

        match allocator.resize(new_capacity) {
            Ok(()) => {
                prop_assert_eq!(allocator.capacity(), new_capacity);
                prop_assert!(before.iter().all(|&s| s < new_capacity));
            }
            Err(_) => {
                prop_assert!(before.iter().any(|&s| s >= new_capacity));
                prop_assert_eq!(allocator.capacity(), capacity);
            }
        }
        let after: HashSet<u32> = allocator.used_slots().collect();
        prop_assert_eq!(after, before);
    }
}
