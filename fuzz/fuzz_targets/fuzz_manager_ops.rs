#![no_main]
use arbitrary::Arbitrary;
use contract_manager::{ContractManagerBuilder, MemorySectorIo, MemoryStore, SectorId};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum Op {
    Store(u8),
    Release(u8),
    AddFolder(u8),
    RemoveFolder(u8),
    Resize(u8, u8),
    Evacuate(u8),
    Checkpoint,
    Reopen,
}

const SIZE: usize = 512;

fuzz_target!(|ops: Vec<Op>| {
    let io = Arc::new(MemorySectorIo::new());
    let store = Arc::new(MemoryStore::new());
    let open = || {
        ContractManagerBuilder::new("memory")
            .sector_size(SIZE as u64)
            .folder_slots(1, 256)
            .sector_io(io.clone())
            .metadata_store(store.clone())
            .open()
            .unwrap()
    };

    let mut manager = open();
    let id = |key: u8| SectorId::new([key; 12]);
    let mut added = 0u32;

    for op in ops {
        let folders: Vec<u16> = manager.folders().iter().map(|f| f.id).collect();
        let pick = |n: u8| folders.get(n as usize % folders.len().max(1)).copied();

        match op {
            Op::Store(key) => {
                let _ = manager.store_sector(id(key), &[key; SIZE]);
            }
            Op::Release(key) => {
                let _ = manager.release_sector(&id(key));
            }
            Op::AddFolder(capacity) => {
                added += 1;
                let _ = manager.add_folder(format!("folder{}", added), capacity as u32);
            }
            Op::RemoveFolder(n) => {
                if let Some(folder) = pick(n) {
                    let _ = manager.remove_folder(folder);
                }
            }
            Op::Resize(n, capacity) => {
                if let Some(folder) = pick(n) {
                    let _ = manager.resize_folder(folder, capacity as u32);
                }
            }
            Op::Evacuate(n) => {
                if let Some(folder) = pick(n) {
                    let _ = manager.evacuate_folder(folder);
                }
            }
            Op::Checkpoint => manager.checkpoint().unwrap(),
            Op::Reopen => {
                drop(manager);
                manager = open();
            }
        }
        assert!(manager.check_consistency().is_consistent());
    }

    for key in 0..=u8::MAX {
        if let Ok(data) = manager.fetch_sector(&id(key)) {
            assert_eq!(data, vec![key; SIZE]);
        }
    }
});
