#![no_main]
use arbitrary::Arbitrary;
use contract_manager::BitmapAllocator;
use libfuzzer_sys::fuzz_target;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

#[derive(Debug, Arbitrary)]
enum Op {
    Allocate { probes: u8 },
    Release { pick: u16 },
    MarkUsed { slot: u16 },
    Resize { capacity: u16 },
}

#[derive(Debug, Arbitrary)]
struct Input {
    capacity: u16,
    seed: u64,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let mut allocator = BitmapAllocator::new(input.capacity as u32);
    let mut rng = StdRng::seed_from_u64(input.seed);
    let mut held = BTreeSet::new();

    for op in input.ops {
        match op {
            Op::Allocate { probes } => {
                if let Ok(slot) = allocator.allocate(&mut rng, probes as usize) {
                    assert!(slot < allocator.capacity());
                    assert!(held.insert(slot), "slot {} handed out twice", slot);
                } else {
                    assert_eq!(held.len() as u32, allocator.capacity());
                }
            }
            Op::Release { pick } => {
                if held.is_empty() {
                    continue;
                }
                let slot = *held.iter().nth(pick as usize % held.len()).unwrap();
                held.remove(&slot);
                allocator.release(slot).unwrap();
                assert!(allocator.release(slot).is_err());
            }
            Op::MarkUsed { slot } => {
                let slot = slot as u32;
                let result = allocator.mark_used(slot);
                if slot < allocator.capacity() && !held.contains(&slot) {
                    result.unwrap();
                    held.insert(slot);
                } else {
                    assert!(result.is_err());
                }
            }
            Op::Resize { capacity } => {
                let capacity = capacity as u32;
                let blocked = held.iter().next_back().is_some_and(|&s| s >= capacity);
                assert_eq!(allocator.resize(capacity).is_err(), blocked);
            }
        }
        assert_eq!(allocator.used_count() as usize, held.len());
    }

    let used: BTreeSet<u32> = allocator.used_slots().collect();
    assert_eq!(used, held);
});
