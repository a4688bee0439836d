//! Concurrent store/release/fetch stress tests

use contract_manager::{
    ContractManager, ContractManagerBuilder, MemorySectorIo, MemoryStore, SectorId,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const SIZE: usize = 512;

fn open() -> ContractManager {
    ContractManagerBuilder::new("memory")
        .sector_size(SIZE as u64)
        .folder_slots(1, 1 << 20)
        .sector_io(Arc::new(MemorySectorIo::new()))
        .metadata_store(Arc::new(MemoryStore::new()))
        .open()
        .unwrap()
}

fn sector(seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; SIZE];
    data[..8].copy_from_slice(&seed.to_le_bytes());
    data[SIZE - 8..].copy_from_slice(&seed.rotate_left(17).to_le_bytes());
    data
}

#[test]
fn test_10000_concurrent_allocations_are_unique() {
    let manager = Arc::new(open());
    manager.add_folder("disk-a", 6000).unwrap();
    manager.add_folder("disk-b", 6000).unwrap();

    let threads = 16u64;
    let per_thread = 625u64;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let manager = manager.clone();
            thread::spawn(move || {
                let mut slots = Vec::with_capacity(per_thread as usize);
                for n in 0..per_thread {
                    let data = sector(t * per_thread + n);
                    let id = manager.sector_id(&data);
                    let outcome = manager.store_sector(id, &data).unwrap();
                    assert!(!outcome.deduplicated);
                    slots.push(outcome.location.slot());
                }
                slots
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for slot in handle.join().unwrap() {
            assert!(seen.insert(slot), "slot {:?} handed out twice", slot);
        }
    }

    assert_eq!(seen.len(), 10_000);
    assert_eq!(manager.sector_count(), 10_000);
    let used: u64 = manager.folders().iter().map(|f| f.used).sum();
    assert_eq!(used, 10_000);
    assert!(manager.check_consistency().is_consistent());
}

#[test]
fn test_concurrent_duplicate_stores_share_one_slot() {
    let manager = Arc::new(open());
    let folder = manager.add_folder("disk-a", 64).unwrap();

    let data = Arc::new(sector(42));
    let id = manager.sector_id(&data);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let data = data.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    manager.store_sector(id, &data).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manager.sector_location(&id).unwrap().count, 800);
    assert_eq!(manager.folder_usage(folder).unwrap().used, 1);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    manager.release_sector(&id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(manager.sector_location(&id).is_err());
    assert_eq!(manager.folder_usage(folder).unwrap().used, 0);
}

#[test]
fn test_readers_see_complete_sectors_during_churn() {
    let manager = Arc::new(open());
    manager.add_folder("disk-a", 4096).unwrap();

    // Stable set the readers check
    let stable: Arc<Vec<(SectorId, Vec<u8>)>> = Arc::new(
        (0..100)
            .map(|n| {
                let data = sector(n);
                let id = manager.sector_id(&data);
                manager.store_sector(id, &data).unwrap();
                (id, data)
            })
            .collect(),
    );

    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let manager = manager.clone();
            thread::spawn(move || {
                for n in 0..500 {
                    let data = sector(1_000_000 + t * 1000 + n);
                    let id = manager.sector_id(&data);
                    manager.store_sector(id, &data).unwrap();
                    assert_eq!(manager.fetch_sector(&id).unwrap(), data);
                    manager.release_sector(&id).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            let stable = stable.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let (id, data) = &stable[rand::random::<usize>() % stable.len()];
                    assert_eq!(&manager.fetch_sector(id).unwrap(), data);
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(manager.sector_count(), 100);
    assert!(manager.check_consistency().is_consistent());
}

#[test]
fn test_checkpoints_interleaved_with_writes() {
    let dir = TempDir::new().unwrap();
    let io = Arc::new(MemorySectorIo::new());
    let open_with_io = || {
        ContractManagerBuilder::new(dir.path())
            .sector_size(SIZE as u64)
            .folder_slots(1, 1 << 20)
            .sector_io(io.clone())
            .open()
            .unwrap()
    };

    {
        let manager = Arc::new(open_with_io());
        manager.add_folder("disk-a", 2048).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let checkpointer = {
            let manager = manager.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    manager.checkpoint().unwrap();
                    thread::yield_now();
                }
            })
        };

        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for n in 0..250 {
                        let data = sector(t * 1000 + n);
                        manager.store_sector(manager.sector_id(&data), &data).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        checkpointer.join().unwrap();
    }

    let manager = open_with_io();
    assert_eq!(manager.sector_count(), 1000);
    assert!(manager.check_consistency().is_consistent());
}
