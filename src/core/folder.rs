//! Storage folders
//!
//! A storage folder is one physical storage area divided into fixed-size
//! sector slots. Each folder owns its bitmap behind its own lock, so
//! allocations in different folders never wait on each other.

use crate::core::allocator::BitmapAllocator;
use crate::core::wal::FolderRecord;
use crate::error::{ContractManagerError, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Usage summary for one folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderUsage {
    pub id: u16,
    pub path: PathBuf,
    pub used: u64,
    pub capacity: u64,
    pub halted: bool,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
}

impl FolderUsage {
    pub fn free(&self) -> u64 {
        self.capacity - self.used
    }
}

#[derive(Debug, Default)]
struct FolderStats {
    successful_reads: AtomicU64,
    failed_reads: AtomicU64,
    successful_writes: AtomicU64,
    failed_writes: AtomicU64,
}

/// One storage folder and its slot bitmap
#[derive(Debug)]
pub struct StorageFolder {
    id: u16,
    path: PathBuf,
    allocator: Mutex<BitmapAllocator>,
    halted: AtomicBool,
    /// Set while the folder is being evacuated; no new sectors land here
    draining: AtomicBool,
    stats: FolderStats,
}

impl StorageFolder {
    /// Create an empty folder
    pub fn new<P: AsRef<Path>>(id: u16, path: P, capacity: u32) -> Self {
        Self::with_allocator(id, path.as_ref().to_path_buf(), BitmapAllocator::new(capacity))
    }

    fn with_allocator(id: u16, path: PathBuf, allocator: BitmapAllocator) -> Self {
        StorageFolder {
            id,
            path,
            allocator: Mutex::new(allocator),
            halted: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            stats: FolderStats::default(),
        }
    }

    /// Rebuild a folder from persisted metadata
    pub fn from_record(record: &FolderRecord) -> Result<Self> {
        let allocator = if record.words.is_empty() {
            BitmapAllocator::new(record.capacity)
        } else {
            BitmapAllocator::from_words(record.words.clone(), record.capacity)?
        };
        Ok(Self::with_allocator(record.id, record.path.clone(), allocator))
    }

    pub fn to_record(&self) -> FolderRecord {
        let allocator = self.allocator.lock();
        FolderRecord {
            id: self.id,
            path: self.path.clone(),
            capacity: allocator.capacity(),
            words: allocator.words().to_vec(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a slot for a new sector
    pub fn add_sector<R: Rng + ?Sized>(&self, rng: &mut R, probe_limit: usize) -> Result<u32> {
        if self.is_halted() {
            return Err(ContractManagerError::FolderHalted(self.id));
        }
        if self.is_draining() {
            return Err(ContractManagerError::NoSpace);
        }
        let result = self.allocator.lock().allocate(rng, probe_limit);
        self.check(result)
    }

    /// Free the slot of a sector that has no references left
    pub fn remove_sector(&self, slot: u32) -> Result<()> {
        let result = self.allocator.lock().release(slot);
        self.check(result)
    }

    /// Claim a specific slot (replay, relocation)
    pub fn mark_used(&self, slot: u32) -> Result<()> {
        let result = self.allocator.lock().mark_used(slot);
        self.check(result)
    }

    /// Halt the folder if `result` reports corruption
    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ContractManagerError::Corruption(reason)) = &result {
            self.halt(reason);
        }
        result
    }

    pub fn is_used(&self, slot: u32) -> bool {
        self.allocator.lock().is_allocated(slot)
    }

    pub fn capacity(&self) -> u32 {
        self.allocator.lock().capacity()
    }

    pub fn used_count(&self) -> u32 {
        self.allocator.lock().used_count()
    }

    pub fn free_count(&self) -> u32 {
        self.allocator.lock().free_count()
    }

    pub fn used_slots(&self) -> Vec<u32> {
        self.allocator.lock().used_slots().collect()
    }

    /// Fail with `CapacityViolation` if shrinking to `new_capacity` would
    /// strand a used slot
    pub fn check_resize(&self, new_capacity: u32) -> Result<()> {
        match self.allocator.lock().shrink_blocker(new_capacity) {
            Some(highest_used) => Err(ContractManagerError::CapacityViolation {
                folder: self.id,
                requested: new_capacity,
                highest_used,
            }),
            None => Ok(()),
        }
    }

    /// Grow or shrink the bitmap
    pub fn resize(&self, new_capacity: u32) -> Result<()> {
        let mut allocator = self.allocator.lock();
        if let Some(highest_used) = allocator.shrink_blocker(new_capacity) {
            return Err(ContractManagerError::CapacityViolation {
                folder: self.id,
                requested: new_capacity,
                highest_used,
            });
        }
        allocator.resize(new_capacity)
    }

    /// A bitmap of the current capacity with exactly `slots` marked used
    ///
    /// The live bitmap is left alone; see [`StorageFolder::install`].
    pub fn rebuilt_bitmap(&self, slots: &[u32]) -> Result<BitmapAllocator> {
        let mut rebuilt = BitmapAllocator::new(self.capacity());
        for &slot in slots {
            rebuilt.mark_used(slot)?;
        }
        Ok(rebuilt)
    }

    /// This folder's record, carrying `bitmap` in place of the live one
    pub fn record_with(&self, bitmap: &BitmapAllocator) -> FolderRecord {
        FolderRecord {
            id: self.id,
            path: self.path.clone(),
            capacity: bitmap.capacity(),
            words: bitmap.words().to_vec(),
        }
    }

    /// Replace the live bitmap
    pub(crate) fn install(&self, bitmap: BitmapAllocator) {
        *self.allocator.lock() = bitmap;
    }

    pub fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!("Storage folder {} halted: {}", self.id, reason);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn clear_halt(&self) {
        self.halted.store(false, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    pub fn record_read(&self, ok: bool) {
        let counter = if ok {
            &self.stats.successful_reads
        } else {
            &self.stats.failed_reads
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, ok: bool) {
        let counter = if ok {
            &self.stats.successful_writes
        } else {
            &self.stats.failed_writes
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn usage(&self) -> FolderUsage {
        let (used, capacity) = {
            let allocator = self.allocator.lock();
            (allocator.used_count() as u64, allocator.capacity() as u64)
        };
        FolderUsage {
            id: self.id,
            path: self.path.clone(),
            used,
            capacity,
            halted: self.is_halted(),
            successful_reads: self.stats.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.stats.failed_reads.load(Ordering::Relaxed),
            successful_writes: self.stats.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.stats.failed_writes.load(Ordering::Relaxed),
        }
    }
}

/// Order folders for a new sector
///
/// Halted, draining and full folders are skipped. The rest come back in a random order
/// weighted by free slots (weighted sampling without replacement), so bigger
/// and emptier disks take proportionally more new sectors and no single disk
/// becomes a hot spot. Callers try the folders in order until one allocates.
pub fn placement_order<R: Rng + ?Sized>(
    folders: &[Arc<StorageFolder>],
    rng: &mut R,
) -> Vec<Arc<StorageFolder>> {
    let mut keyed: Vec<(f64, Arc<StorageFolder>)> = folders
        .iter()
        .filter(|f| !f.is_halted() && !f.is_draining())
        .filter_map(|f| {
            let free = f.free_count();
            if free == 0 {
                return None;
            }
            let key = rng.gen::<f64>().powf(1.0 / free as f64);
            Some((key, Arc::clone(f)))
        })
        .collect();

    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(CmpOrdering::Equal));
    keyed.into_iter().map(|(_, f)| f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::DEFAULT_PROBE_LIMIT;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_add_and_remove_sector() {
        let folder = StorageFolder::new(1, "/data/a", 128);
        let mut rng = StdRng::seed_from_u64(1);

        let slot = folder.add_sector(&mut rng, DEFAULT_PROBE_LIMIT).unwrap();
        assert!(folder.is_used(slot));
        assert_eq!(folder.usage().used, 1);

        folder.remove_sector(slot).unwrap();
        assert_eq!(folder.usage().used, 0);
    }

    #[test]
    fn test_corruption_halts_folder() {
        let folder = StorageFolder::new(4, "/data/b", 128);
        let mut rng = StdRng::seed_from_u64(2);

        assert!(matches!(
            folder.remove_sector(3),
            Err(ContractManagerError::Corruption(_))
        ));
        assert!(folder.is_halted());
        assert!(matches!(
            folder.add_sector(&mut rng, DEFAULT_PROBE_LIMIT),
            Err(ContractManagerError::FolderHalted(4))
        ));

        folder.clear_halt();
        assert!(folder.add_sector(&mut rng, DEFAULT_PROBE_LIMIT).is_ok());
    }

    #[test]
    fn test_draining_folder_takes_no_sectors() {
        let folder = Arc::new(StorageFolder::new(5, "/data/f", 64));
        let mut rng = StdRng::seed_from_u64(5);
        folder.set_draining(true);

        assert!(matches!(
            folder.add_sector(&mut rng, DEFAULT_PROBE_LIMIT),
            Err(ContractManagerError::NoSpace)
        ));
        assert!(placement_order(&[folder.clone()], &mut rng).is_empty());

        folder.set_draining(false);
        assert_eq!(placement_order(&[folder], &mut rng).len(), 1);
    }

    #[test]
    fn test_resize_violation() {
        let folder = StorageFolder::new(2, "/data/c", 256);
        folder.mark_used(200).unwrap();

        match folder.resize(128) {
            Err(ContractManagerError::CapacityViolation {
                folder,
                requested,
                highest_used,
            }) => {
                assert_eq!(folder, 2);
                assert_eq!(requested, 128);
                assert_eq!(highest_used, 200);
            }
            other => panic!("expected capacity violation, got {:?}", other),
        }

        folder.resize(201).unwrap();
        assert_eq!(folder.capacity(), 201);
        folder.resize(1024).unwrap();
        assert!(folder.is_used(200));
    }

    #[test]
    fn test_record_round_trip() {
        let folder = StorageFolder::new(9, "/data/d", 100);
        folder.mark_used(5).unwrap();
        folder.mark_used(99).unwrap();

        let restored = StorageFolder::from_record(&folder.to_record()).unwrap();
        assert_eq!(restored.id(), 9);
        assert_eq!(restored.used_slots(), vec![5, 99]);
    }

    #[test]
    fn test_rebuild_then_install() {
        let folder = StorageFolder::new(1, "/data/e", 64);
        folder.mark_used(1).unwrap();

        let bitmap = folder.rebuilt_bitmap(&[10, 20]).unwrap();
        let record = folder.record_with(&bitmap);
        assert_eq!(record.capacity, 64);
        assert_eq!(folder.used_slots(), vec![1]);

        folder.install(bitmap);
        assert_eq!(folder.used_slots(), vec![10, 20]);
        assert_eq!(StorageFolder::from_record(&record).unwrap().used_slots(), vec![10, 20]);
        assert!(folder.rebuilt_bitmap(&[64]).is_err());
    }

    #[test]
    fn test_placement_skips_full_and_halted() {
        let full = Arc::new(StorageFolder::new(1, "/a", 64));
        for slot in 0..64 {
            full.mark_used(slot).unwrap();
        }
        let halted = Arc::new(StorageFolder::new(2, "/b", 64));
        halted.halt("test");
        let open = Arc::new(StorageFolder::new(3, "/c", 64));

        let mut rng = StdRng::seed_from_u64(3);
        let order = placement_order(&[full, halted, open], &mut rng);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].id(), 3);
    }

    #[test]
    fn test_placement_favours_free_space() {
        let big = Arc::new(StorageFolder::new(1, "/big", 64 * 100));
        let small = Arc::new(StorageFolder::new(2, "/small", 64));
        let folders = vec![big, small];

        let mut rng = StdRng::seed_from_u64(4);
        let big_first = (0..1000)
            .filter(|_| placement_order(&folders, &mut rng)[0].id() == 1)
            .count();
        assert!(big_first > 900, "big folder first only {} times", big_first);
    }
}
