//! Contract manager
//!
//! Ties the sector index, the storage folders, physical sector I/O and the
//! metadata log together. Every sector mutation runs in the same order:
//!
//! 1. Claim resources in memory (a slot in a folder bitmap)
//! 2. Do the physical I/O
//! 3. Commit the metadata batch to the log
//! 4. Publish the change in the index
//!
//! A failure before step 3 hands back whatever step 1 claimed, so an
//! operation that was never acknowledged leaves no trace, and nothing is
//! visible to lookups before it is durable.
//!
//! ## Locking
//!
//! Locks are always taken in this order: sector stripe, then the folder map.
//! Sector mutations hold the folder map shared for their whole duration.
//! Folder administration, checkpoints and audits take it exclusively, which
//! also guarantees they never observe a claimed slot whose batch has not
//! been committed yet.

use crate::config::ContractManagerConfig;
use crate::context::OpContext;
use crate::error::{ContractManagerError, Result};
use crate::folder::{placement_order, FolderUsage, StorageFolder};
use crate::index::{SectorIndex, SectorLocks};
use crate::io::{FileSectorIo, SectorIo};
use crate::sector::{SectorId, SectorLocation, SALT_LEN};
use crate::wal::{
    Batch, Change, FolderRecord, MetadataStore, Recovered, Snapshot, WalStore, SNAPSHOT_VERSION,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type FolderMap = HashMap<u16, Arc<StorageFolder>>;

/// Result of a successful store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub location: SectorLocation,
    /// The sector was already stored and only gained a reference
    pub deduplicated: bool,
}

/// Differences between the sector index and the folder bitmaps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub folders_checked: usize,
    pub sectors_checked: usize,
    /// Index entries whose slot bit is clear
    pub missing_bits: Vec<(u16, u32)>,
    /// Set bits that no index entry points at
    pub orphaned_bits: Vec<(u16, u32)>,
    /// Slots claimed by more than one index entry
    pub shared_slots: Vec<(u16, u32)>,
    /// Entries pointing at an unknown folder or past the end of one
    pub dangling: Vec<SectorId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_bits.is_empty()
            && self.orphaned_bits.is_empty()
            && self.shared_slots.is_empty()
            && self.dangling.is_empty()
    }

    /// Folders with at least one mismatch
    pub fn affected_folders(&self) -> BTreeSet<u16> {
        self.missing_bits
            .iter()
            .chain(&self.orphaned_bits)
            .chain(&self.shared_slots)
            .map(|(folder, _)| *folder)
            .collect()
    }

    /// Pretty JSON for operator tooling
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Compare the index against the bitmaps
///
/// Also returns the slots each folder's entries claim, which is what
/// `repair` rebuilds the bitmaps from.
fn inspect(
    folders: &FolderMap,
    entries: &[(SectorId, SectorLocation)],
) -> (ConsistencyReport, HashMap<u16, HashSet<u32>>) {
    let mut report = ConsistencyReport {
        folders_checked: folders.len(),
        sectors_checked: entries.len(),
        ..Default::default()
    };
    let mut claimed: HashMap<u16, HashSet<u32>> =
        folders.keys().map(|&id| (id, HashSet::new())).collect();

    for (id, location) in entries {
        let folder = match folders.get(&location.storage_folder) {
            Some(folder) if location.index < folder.capacity() => folder,
            _ => {
                report.dangling.push(*id);
                continue;
            }
        };
        if !claimed
            .entry(location.storage_folder)
            .or_default()
            .insert(location.index)
        {
            report.shared_slots.push(location.slot());
        }
        if !folder.is_used(location.index) {
            report.missing_bits.push(location.slot());
        }
    }

    for (&folder_id, folder) in folders {
        let slots = claimed.get(&folder_id);
        for slot in folder.used_slots() {
            if !slots.is_some_and(|s| s.contains(&slot)) {
                report.orphaned_bits.push((folder_id, slot));
            }
        }
    }

    report.missing_bits.sort_unstable();
    report.orphaned_bits.sort_unstable();
    report.shared_slots.sort_unstable();
    report.shared_slots.dedup();
    report.dangling.sort_unstable();
    (report, claimed)
}

/// Sector storage for a host
///
/// Thread-safe: share it behind an `Arc` and call it from any number of
/// threads.
pub struct ContractManager {
    config: ContractManagerConfig,

    /// Per-host salt mixed into sector ids
    salt: [u8; SALT_LEN],

    /// Sector id -> location
    index: SectorIndex,

    /// Per-sector check-then-act serialization
    locks: SectorLocks,

    /// Attached storage folders
    ///
    /// Shared by every sector mutation for its whole duration; exclusive for
    /// folder administration, checkpoints and audits.
    folders: RwLock<FolderMap>,

    /// Physical sector storage
    io: Arc<dyn SectorIo>,

    /// Durable metadata
    store: Arc<dyn MetadataStore>,

    /// Serializes folder administration, evacuation and repair
    admin: Mutex<()>,

    /// Set while an automatic checkpoint runs
    checkpointing: AtomicBool,
}

impl ContractManager {
    /// Open the manager rooted at `config.data_dir` with file-backed storage
    ///
    /// Creates the metadata directory on first use; otherwise recovers the
    /// last checkpoint and replays the metadata log.
    pub fn open(config: ContractManagerConfig) -> Result<Self> {
        config.check()?;
        let io = Arc::new(FileSectorIo::new(config.sector_size, config.sync_writes));
        let store = Arc::new(WalStore::open(&config.data_dir)?);
        Self::open_with(config, io, store)
    }

    /// Open with explicit sector I/O and metadata backends
    pub fn open_with(
        config: ContractManagerConfig,
        io: Arc<dyn SectorIo>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        config.check()?;
        let Recovered { snapshot, batches } = store.load()?;

        let index = SectorIndex::new(config.index_shards);
        let mut folders = FolderMap::new();
        let fresh = snapshot.is_none();

        let salt = match snapshot {
            Some(snapshot) => {
                if snapshot.sector_size != config.sector_size {
                    return Err(ContractManagerError::InvalidConfig(format!(
                        "sector size {} does not match the stored sector size {}",
                        config.sector_size, snapshot.sector_size
                    )));
                }
                for record in &snapshot.folders {
                    folders.insert(record.id, Arc::new(StorageFolder::from_record(record)?));
                }
                for (id, location) in snapshot.sectors {
                    index.upsert(id, location);
                }
                snapshot.salt
            }
            None => {
                if !batches.is_empty() {
                    return Err(ContractManagerError::Corruption(
                        "metadata log has batches but no checkpoint".to_string(),
                    ));
                }
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill(&mut salt);
                salt
            }
        };

        for batch in &batches {
            Self::replay(&mut folders, &index, batch)?;
        }
        for folder in folders.values() {
            io.open_folder(folder.id(), folder.path())?;
        }

        let manager = ContractManager {
            locks: SectorLocks::new(config.lock_stripes),
            config,
            salt,
            index,
            folders: RwLock::new(folders),
            io,
            store,
            admin: Mutex::new(()),
            checkpointing: AtomicBool::new(false),
        };

        let report = manager.check_consistency();
        if !report.is_consistent() {
            error!(
                "Metadata inconsistent after recovery: {} missing bits, {} orphaned bits, {} shared slots, {} dangling entries",
                report.missing_bits.len(),
                report.orphaned_bits.len(),
                report.shared_slots.len(),
                report.dangling.len()
            );
            let folders = manager.folders.read();
            for folder_id in report.affected_folders() {
                if let Some(folder) = folders.get(&folder_id) {
                    folder.halt("index and bitmap disagree after recovery");
                }
            }
        }

        // Persist the salt on first open; fold the replayed log into a checkpoint
        if fresh || !batches.is_empty() {
            manager.checkpoint()?;
        }

        info!(
            "Contract manager opened: {} folders, {} sectors, {} batches replayed",
            manager.folders.read().len(),
            manager.index.len(),
            batches.len()
        );
        Ok(manager)
    }

    fn replay(folders: &mut FolderMap, index: &SectorIndex, batch: &Batch) -> Result<()> {
        let corrupt = |e: ContractManagerError| {
            ContractManagerError::Corruption(format!("replay of batch {}: {}", batch.seq, e))
        };

        for change in &batch.changes {
            match change {
                Change::SectorUpsert { id, location } => index.upsert(*id, *location),
                Change::SectorRemove { id } => {
                    index.remove(id);
                }
                Change::SlotSet { folder, slot } => Self::replay_folder(folders, *folder)
                    .and_then(|f| f.mark_used(*slot))
                    .map_err(corrupt)?,
                Change::SlotClear { folder, slot } => Self::replay_folder(folders, *folder)
                    .and_then(|f| f.remove_sector(*slot))
                    .map_err(corrupt)?,
                Change::FolderAdd { folder } => {
                    let added = StorageFolder::from_record(folder).map_err(corrupt)?;
                    folders.insert(folder.id, Arc::new(added));
                }
                Change::FolderRemove { id } => {
                    folders.remove(id);
                }
                Change::FolderResize { id, capacity } => Self::replay_folder(folders, *id)
                    .and_then(|f| f.resize(*capacity))
                    .map_err(corrupt)?,
            }
        }
        Ok(())
    }

    fn replay_folder(folders: &FolderMap, id: u16) -> Result<&Arc<StorageFolder>> {
        folders
            .get(&id)
            .ok_or(ContractManagerError::FolderNotFound(id))
    }

    pub fn config(&self) -> &ContractManagerConfig {
        &self.config
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Id this host assigns to a sector with the given content
    pub fn sector_id(&self, data: &[u8]) -> SectorId {
        SectorId::from_data(&self.salt, data)
    }

    // ========== Sector operations ==========

    /// Store a sector, or add a reference if it is already stored
    pub fn store_sector(&self, id: SectorId, data: &[u8]) -> Result<StoreOutcome> {
        self.store_sector_with(id, data, &OpContext::background())
    }

    /// Store a sector under a cancellation/deadline context
    ///
    /// The context is checked before the slot is claimed and again after the
    /// physical write. A store stopped at either point releases its slot and
    /// leaves no metadata behind.
    pub fn store_sector_with(
        &self,
        id: SectorId,
        data: &[u8],
        ctx: &OpContext,
    ) -> Result<StoreOutcome> {
        let sector_size = self.config.sector_size as usize;
        if data.len() != sector_size {
            return Err(ContractManagerError::InvalidSectorSize {
                expected: sector_size,
                actual: data.len(),
            });
        }
        let ctx = ctx.clone().bounded_by(self.config.io_timeout());

        let outcome = {
            let _sector = self.locks.write(&id);
            let folders = self.folders.read();
            match self.index.lookup(&id) {
                Ok(location) => self.add_reference(&folders, id, location)?,
                Err(_) => self.store_new(&folders, id, data, &ctx)?,
            }
        };

        self.maybe_checkpoint();
        Ok(outcome)
    }

    fn add_reference(
        &self,
        folders: &FolderMap,
        id: SectorId,
        location: SectorLocation,
    ) -> Result<StoreOutcome> {
        let folder = Self::holding_folder(folders, &id, &location)?;
        if folder.is_halted() {
            return Err(ContractManagerError::FolderHalted(folder.id()));
        }

        let count = location
            .count
            .checked_add(1)
            .ok_or(ContractManagerError::ReferenceOverflow(id))?;
        let location = SectorLocation { count, ..location };

        self.store
            .commit(Batch::new(vec![Change::SectorUpsert { id, location }]))?;
        self.index.add_reference(&id)?;

        debug!("Sector {} gained a reference ({} total)", id, count);
        Ok(StoreOutcome {
            location,
            deduplicated: true,
        })
    }

    fn store_new(
        &self,
        folders: &FolderMap,
        id: SectorId,
        data: &[u8],
        ctx: &OpContext,
    ) -> Result<StoreOutcome> {
        ctx.check()?;
        let (folder, slot) = self.allocate_slot(folders)?;

        match self.write_and_commit(&folder, slot, id, data, ctx) {
            Ok(location) => {
                // The stripe lock kept the id absent since the lookup
                self.index.insert_new(id, location)?;
                debug!("Stored sector {} in folder {} slot {}", id, folder.id(), slot);
                Ok(StoreOutcome {
                    location,
                    deduplicated: false,
                })
            }
            Err(e) => {
                warn!(
                    "Store of sector {} failed, releasing slot {} of folder {}: {}",
                    id,
                    slot,
                    folder.id(),
                    e
                );
                self.release_slot(&folder, slot);
                Err(e)
            }
        }
    }

    fn write_and_commit(
        &self,
        folder: &StorageFolder,
        slot: u32,
        id: SectorId,
        data: &[u8],
        ctx: &OpContext,
    ) -> Result<SectorLocation> {
        let written = self.io.write_sector(folder.id(), slot, data);
        folder.record_write(written.is_ok());
        written?;
        ctx.check()?;

        let location = SectorLocation::new(folder.id(), slot);
        self.store.commit(Batch::new(vec![
            Change::SlotSet {
                folder: folder.id(),
                slot,
            },
            Change::SectorUpsert { id, location },
        ]))?;
        Ok(location)
    }

    /// Claim a slot in the first folder of a weighted random order
    fn allocate_slot(&self, folders: &FolderMap) -> Result<(Arc<StorageFolder>, u32)> {
        let candidates: Vec<Arc<StorageFolder>> = folders.values().cloned().collect();
        let mut rng = rand::thread_rng();

        for folder in placement_order(&candidates, &mut rng) {
            match folder.add_sector(&mut rng, self.config.probe_limit) {
                Ok(slot) => return Ok((folder, slot)),
                Err(e) => debug!("Folder {} rejected allocation: {}", folder.id(), e),
            }
        }
        Err(ContractManagerError::NoSpace)
    }

    /// Hand back a slot claimed by an operation that did not commit
    fn release_slot(&self, folder: &StorageFolder, slot: u32) {
        if let Err(e) = folder.remove_sector(slot) {
            error!(
                "Failed to release slot {} of folder {}: {}",
                slot,
                folder.id(),
                e
            );
        }
    }

    /// Drop one reference; frees the slot when none are left
    ///
    /// Returns the references remaining.
    pub fn release_sector(&self, id: &SectorId) -> Result<u16> {
        let remaining = {
            let _sector = self.locks.write(id);
            let folders = self.folders.read();

            let location = self.index.lookup(id)?;
            let folder = Self::holding_folder(&folders, id, &location)?;
            if folder.is_halted() {
                return Err(ContractManagerError::FolderHalted(folder.id()));
            }

            let changes = if location.count > 1 {
                vec![Change::SectorUpsert {
                    id: *id,
                    location: SectorLocation {
                        count: location.count - 1,
                        ..location
                    },
                }]
            } else {
                if !folder.is_used(location.index) {
                    let reason = format!("sector {} maps to free slot {}", id, location.index);
                    folder.halt(&reason);
                    return Err(ContractManagerError::Corruption(reason));
                }
                vec![
                    Change::SectorRemove { id: *id },
                    Change::SlotClear {
                        folder: location.storage_folder,
                        slot: location.index,
                    },
                ]
            };

            self.store.commit(Batch::new(changes))?;
            let removed = self.index.remove_reference(id)?;
            if let Some(freed) = removed.freed {
                folder.remove_sector(freed.index)?;
                debug!(
                    "Released sector {}, freed slot {} of folder {}",
                    id, freed.index, freed.storage_folder
                );
            }
            removed.count
        };

        self.maybe_checkpoint();
        Ok(remaining)
    }

    fn holding_folder<'a>(
        folders: &'a FolderMap,
        id: &SectorId,
        location: &SectorLocation,
    ) -> Result<&'a Arc<StorageFolder>> {
        folders.get(&location.storage_folder).ok_or_else(|| {
            ContractManagerError::Corruption(format!(
                "sector {} points at unknown folder {}",
                id, location.storage_folder
            ))
        })
    }

    /// Read a sector's data
    pub fn fetch_sector(&self, id: &SectorId) -> Result<Vec<u8>> {
        let _sector = self.locks.read(id);
        let location = self.index.lookup(id)?;
        let folder = self.folder(location.storage_folder)?;

        let data = self.io.read_sector(location.storage_folder, location.index);
        folder.record_read(data.is_ok());
        let data = data?;

        if data.len() != self.config.sector_size as usize {
            return Err(ContractManagerError::Corruption(format!(
                "sector {} read back {} bytes",
                id,
                data.len()
            )));
        }
        Ok(data)
    }

    // ========== Folder administration ==========

    fn folder(&self, id: u16) -> Result<Arc<StorageFolder>> {
        self.folders
            .read()
            .get(&id)
            .cloned()
            .ok_or(ContractManagerError::FolderNotFound(id))
    }

    fn check_capacity(&self, capacity: u32) -> Result<()> {
        let (min, max) = (self.config.min_folder_slots, self.config.max_folder_slots);
        if capacity < min || capacity > max {
            return Err(ContractManagerError::InvalidCapacity(format!(
                "{} slots is outside the allowed range {}..={}",
                capacity, min, max
            )));
        }
        Ok(())
    }

    fn total_slots(folders: &FolderMap) -> u64 {
        folders.values().map(|f| f.capacity() as u64).sum()
    }

    fn unused_folder_id(folders: &FolderMap) -> Result<u16> {
        if folders.len() > u16::MAX as usize {
            return Err(ContractManagerError::InvalidCapacity(
                "every storage folder id is in use".to_string(),
            ));
        }
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            if !folders.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Attach a new storage folder of `capacity` slots, returning its id
    pub fn add_folder<P: AsRef<Path>>(&self, path: P, capacity: u32) -> Result<u16> {
        let path = path.as_ref().to_path_buf();
        self.check_capacity(capacity)?;

        let _admin = self.admin.lock();
        let mut folders = self.folders.write();

        if folders.values().any(|f| f.path() == path.as_path()) {
            return Err(ContractManagerError::FolderPathInUse(path));
        }
        let total = Self::total_slots(&folders) + capacity as u64;
        if total > self.config.max_total_slots {
            return Err(ContractManagerError::CapacityExceeded {
                requested: total,
                limit: self.config.max_total_slots,
            });
        }

        let id = Self::unused_folder_id(&folders)?;
        self.io.create_folder(id, &path, capacity)?;

        let record = FolderRecord {
            id,
            path: path.clone(),
            capacity,
            words: Vec::new(),
        };
        if let Err(e) = self
            .store
            .commit(Batch::new(vec![Change::FolderAdd { folder: record }]))
        {
            if let Err(cleanup) = self.io.remove_folder(id) {
                warn!("Failed to clean up storage for folder {}: {}", id, cleanup);
            }
            return Err(e);
        }

        folders.insert(id, Arc::new(StorageFolder::new(id, &path, capacity)));
        info!(
            "Added storage folder {} at {:?} with {} slots",
            id, path, capacity
        );
        Ok(id)
    }

    /// Detach an empty storage folder
    pub fn remove_folder(&self, id: u16) -> Result<()> {
        let _admin = self.admin.lock();
        {
            let mut folders = self.folders.write();
            let folder = folders
                .get(&id)
                .ok_or(ContractManagerError::FolderNotFound(id))?;
            if folder.is_halted() {
                return Err(ContractManagerError::FolderHalted(id));
            }
            let used = folder.used_count();
            if used > 0 {
                return Err(ContractManagerError::FolderNotEmpty {
                    folder: id,
                    used: used as u64,
                });
            }

            self.store
                .commit(Batch::new(vec![Change::FolderRemove { id }]))?;
            folders.remove(&id);
        }

        if let Err(e) = self.io.remove_folder(id) {
            warn!(
                "Storage folder {} was detached but its storage could not be removed: {}",
                id, e
            );
        }
        info!("Removed storage folder {}", id);
        Ok(())
    }

    /// Change a folder's capacity
    ///
    /// Shrinking fails with `CapacityViolation` if any used slot lies at or
    /// beyond the new capacity; evacuate first.
    pub fn resize_folder(&self, id: u16, capacity: u32) -> Result<()> {
        self.check_capacity(capacity)?;

        let _admin = self.admin.lock();
        let folders = self.folders.write();
        let folder = folders
            .get(&id)
            .ok_or(ContractManagerError::FolderNotFound(id))?;
        if folder.is_halted() {
            return Err(ContractManagerError::FolderHalted(id));
        }

        let current = folder.capacity();
        if capacity == current {
            return Ok(());
        }
        folder.check_resize(capacity)?;

        let resize = Batch::new(vec![Change::FolderResize { id, capacity }]);
        if capacity > current {
            let total = Self::total_slots(&folders) - current as u64 + capacity as u64;
            if total > self.config.max_total_slots {
                return Err(ContractManagerError::CapacityExceeded {
                    requested: total,
                    limit: self.config.max_total_slots,
                });
            }
            // Storage must exist before the metadata points into it
            self.io.resize_folder(id, capacity)?;
            self.store.commit(resize)?;
        } else {
            self.store.commit(resize)?;
            if let Err(e) = self.io.resize_folder(id, capacity) {
                warn!("Folder {} shrunk but its storage was not truncated: {}", id, e);
            }
        }
        folder.resize(capacity)?;

        info!("Resized storage folder {}: {} -> {} slots", id, current, capacity);
        Ok(())
    }

    /// Move every sector out of a folder, returning how many moved
    ///
    /// Each sector move is committed on its own, so an interrupted evacuation
    /// leaves every sector in exactly one place. New sectors never land in a
    /// folder while it is being evacuated.
    pub fn evacuate_folder(&self, id: u16) -> Result<u64> {
        let _admin = self.admin.lock();
        let source = self.folder(id)?;

        source.set_draining(true);
        // Wait out stores that picked this folder before it started draining
        drop(self.folders.write());

        let result = self.drain(&source);
        source.set_draining(false);
        let moved = result?;

        info!("Evacuated {} sectors from storage folder {}", moved, id);
        self.maybe_checkpoint();
        Ok(moved)
    }

    fn drain(&self, source: &StorageFolder) -> Result<u64> {
        let mut moved = 0;
        for (id, _) in self.index.entries_in_folder(source.id()) {
            if self.relocate(&id, source)? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Move one sector out of `source`; false if it left on its own meanwhile
    fn relocate(&self, id: &SectorId, source: &StorageFolder) -> Result<bool> {
        let _sector = self.locks.write(id);
        let folders = self.folders.read();

        let location = match self.index.lookup(id) {
            Ok(location) if location.storage_folder == source.id() => location,
            _ => return Ok(false),
        };

        let data = self.io.read_sector(source.id(), location.index);
        source.record_read(data.is_ok());
        let data = data?;

        let (target, slot) = self.allocate_slot(&folders)?;
        let written = self.io.write_sector(target.id(), slot, &data);
        target.record_write(written.is_ok());
        if let Err(e) = written {
            self.release_slot(&target, slot);
            return Err(e);
        }

        let relocated = SectorLocation {
            storage_folder: target.id(),
            index: slot,
            ..location
        };
        let committed = self.store.commit(Batch::new(vec![
            Change::SlotSet {
                folder: target.id(),
                slot,
            },
            Change::SectorUpsert {
                id: *id,
                location: relocated,
            },
            Change::SlotClear {
                folder: source.id(),
                slot: location.index,
            },
        ]));
        if let Err(e) = committed {
            self.release_slot(&target, slot);
            return Err(e);
        }

        self.index.relocate(id, target.id(), slot)?;
        source.remove_sector(location.index)?;
        debug!(
            "Moved sector {} from folder {} slot {} to folder {} slot {}",
            id,
            source.id(),
            location.index,
            target.id(),
            slot
        );
        Ok(true)
    }

    // ========== Introspection ==========

    pub fn folder_usage(&self, id: u16) -> Result<FolderUsage> {
        Ok(self.folder(id)?.usage())
    }

    /// Usage of every attached folder, ordered by id
    pub fn folders(&self) -> Vec<FolderUsage> {
        let mut usage: Vec<FolderUsage> = self.folders.read().values().map(|f| f.usage()).collect();
        usage.sort_by_key(|u| u.id);
        usage
    }

    pub fn sector_count(&self) -> usize {
        self.index.len()
    }

    pub fn sector_location(&self, id: &SectorId) -> Result<SectorLocation> {
        self.index.lookup(id)
    }

    /// Audit the index against the folder bitmaps
    pub fn check_consistency(&self) -> ConsistencyReport {
        let folders = self.folders.write();
        let entries = self.index.snapshot();
        inspect(&folders, &entries).0
    }

    // ========== Maintenance ==========

    /// Rebuild folder bitmaps from the index and resume halted folders
    ///
    /// The index is authoritative. Entries pointing outside every folder are
    /// dropped, since their data cannot be reached. Folders with slots shared
    /// by several sectors stay halted. The repaired state is checkpointed
    /// first and only then applied in memory, so a failed checkpoint leaves
    /// the manager exactly as it was. Returns what was found before repairing.
    pub fn repair(&self) -> Result<ConsistencyReport> {
        let _admin = self.admin.lock();
        let folders = self.folders.write();

        let entries = self.index.snapshot();
        let (report, claimed) = inspect(&folders, &entries);

        let dangling: HashSet<SectorId> = report.dangling.iter().copied().collect();
        let sectors: Vec<(SectorId, SectorLocation)> = entries
            .into_iter()
            .filter(|(id, _)| !dangling.contains(id))
            .collect();

        let mut bitmaps = Vec::with_capacity(folders.len());
        let mut records = Vec::with_capacity(folders.len());
        for (folder_id, folder) in folders.iter() {
            let mut slots: Vec<u32> = claimed
                .get(folder_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            slots.sort_unstable();
            let bitmap = folder.rebuilt_bitmap(&slots)?;
            records.push(folder.record_with(&bitmap));
            bitmaps.push((folder.clone(), bitmap));
        }

        if let Err(e) = self.write_snapshot(records, sectors) {
            error!("Repair could not be persisted, nothing was changed: {}", e);
            return Err(e);
        }

        for id in &report.dangling {
            error!(
                "Dropped index entry for sector {}: it points outside every storage folder",
                id
            );
            self.index.remove(id);
        }

        let shared: HashSet<u16> = report.shared_slots.iter().map(|(f, _)| *f).collect();
        for (folder, bitmap) in bitmaps {
            folder.install(bitmap);
            if shared.contains(&folder.id()) {
                folder.halt("slots shared by several sectors");
            } else if folder.is_halted() {
                folder.clear_halt();
                info!("Storage folder {} resumed after repair", folder.id());
            }
        }

        if report.is_consistent() {
            info!("Repair found no inconsistencies");
        } else {
            warn!(
                "Repair fixed {} missing bits, {} orphaned bits, dropped {} dangling entries; {} shared slots remain",
                report.missing_bits.len(),
                report.orphaned_bits.len(),
                report.dangling.len(),
                report.shared_slots.len()
            );
        }
        Ok(report)
    }

    /// Write a full checkpoint and truncate the metadata log
    pub fn checkpoint(&self) -> Result<()> {
        let folders = self.folders.write();
        self.write_checkpoint(&folders)
    }

    fn write_checkpoint(&self, folders: &FolderMap) -> Result<()> {
        let records = folders.values().map(|f| f.to_record()).collect();
        self.write_snapshot(records, self.index.snapshot())
    }

    fn write_snapshot(
        &self,
        mut records: Vec<FolderRecord>,
        mut sectors: Vec<(SectorId, SectorLocation)>,
    ) -> Result<()> {
        records.sort_by_key(|r| r.id);
        sectors.sort_unstable_by_key(|(id, _)| *id);

        self.store.checkpoint(Snapshot {
            version: SNAPSHOT_VERSION,
            last_seq: 0,
            salt: self.salt,
            sector_size: self.config.sector_size,
            folders: records,
            sectors,
        })
    }

    /// Checkpoint once the log outgrows `checkpoint_bytes`
    fn maybe_checkpoint(&self) {
        if self.store.log_size() < self.config.checkpoint_bytes {
            return;
        }
        if self.checkpointing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.checkpoint() {
            error!("Automatic checkpoint failed: {}", e);
        }
        self.checkpointing.store(false, Ordering::Release);
    }

    /// Checkpoint and shut down
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        info!("Contract manager closed with {} sectors", self.index.len());
        Ok(())
    }
}
