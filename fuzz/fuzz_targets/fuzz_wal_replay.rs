#![no_main]
use contract_manager::{ContractManagerBuilder, MemorySectorIo, MetadataStore, WalStore};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

// Arbitrary bytes as the metadata log: recovery may refuse to open, but must
// never panic, and whatever it opens must be a consistent prefix.
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };

    // Valid checkpoint first, then the fuzzed log
    match ContractManagerBuilder::new(dir.path())
        .sector_size(512)
        .folder_slots(1, 1024)
        .sector_io(Arc::new(MemorySectorIo::new()))
        .open()
    {
        Ok(manager) => drop(manager),
        Err(_) => return,
    }
    if std::fs::write(dir.path().join("metadata.wal"), data).is_err() {
        return;
    }

    if let Ok(store) = WalStore::open(dir.path()) {
        let _ = store.load();
    }

    let opened = ContractManagerBuilder::new(dir.path())
        .sector_size(512)
        .folder_slots(1, 1024)
        .sector_io(Arc::new(MemorySectorIo::new()))
        .open();
    if let Ok(manager) = opened {
        let _ = manager.check_consistency();
    }
});
