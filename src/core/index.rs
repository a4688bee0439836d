//! Sector location index
//!
//! Maps every stored [`SectorId`] to its [`SectorLocation`]. A host with
//! ~100 TiB of storage tracks tens of millions of sectors, and at that scale
//! lock contention costs far more than the map itself, so the index is split
//! into independently locked shards:
//!
//! - Lookups take one shard's read lock
//! - Mutations take one shard's write lock for a single key update
//! - Shards are cache-line padded so neighbouring locks don't false-share
//!
//! Ids are hash-derived, so the low bits of the id spread evenly over shards.

use crate::core::sector::{SectorId, SectorLocation};
use crate::error::{ContractManagerError, Result};
use ahash::RandomState;
use crossbeam::utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

type Shard = RwLock<HashMap<SectorId, SectorLocation, RandomState>>;

/// Result of dropping one reference to a sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedReference {
    /// References left after the decrement
    pub count: u16,
    /// Set when the last reference went away and the entry was deleted
    pub freed: Option<SectorLocation>,
}

/// Sharded map from sector id to location
pub struct SectorIndex {
    shards: Box<[CachePadded<Shard>]>,
    mask: u64,
    len: AtomicUsize,
}

impl SectorIndex {
    /// Create an index with `shards` shards (rounded up to a power of two)
    pub fn new(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| CachePadded::new(RwLock::new(HashMap::with_hasher(RandomState::new()))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        SectorIndex {
            shards,
            mask: count as u64 - 1,
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, id: &SectorId) -> &Shard {
        &self.shards[(id.spread() & self.mask) as usize]
    }

    pub fn lookup(&self, id: &SectorId) -> Result<SectorLocation> {
        self.shard(id)
            .read()
            .get(id)
            .copied()
            .ok_or(ContractManagerError::SectorNotFound(*id))
    }

    /// Insert an entry for a sector that is not stored yet
    pub fn insert_new(&self, id: SectorId, location: SectorLocation) -> Result<()> {
        let mut shard = self.shard(&id).write();
        if shard.contains_key(&id) {
            return Err(ContractManagerError::AlreadyExists(id));
        }
        shard.insert(id, location);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Add a logical reference to an existing sector, returning the new count
    pub fn add_reference(&self, id: &SectorId) -> Result<u16> {
        let mut shard = self.shard(id).write();
        let location = shard
            .get_mut(id)
            .ok_or(ContractManagerError::SectorNotFound(*id))?;
        location.count = location
            .count
            .checked_add(1)
            .ok_or(ContractManagerError::ReferenceOverflow(*id))?;
        Ok(location.count)
    }

    /// Drop one logical reference
    ///
    /// When the count reaches zero the entry is deleted and its location is
    /// handed back so the caller can release the slot in the same commit.
    pub fn remove_reference(&self, id: &SectorId) -> Result<RemovedReference> {
        let mut shard = self.shard(id).write();
        let location = shard
            .get_mut(id)
            .ok_or(ContractManagerError::SectorNotFound(*id))?;

        if location.count > 1 {
            location.count -= 1;
            return Ok(RemovedReference {
                count: location.count,
                freed: None,
            });
        }

        let freed = *location;
        shard.remove(id);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(RemovedReference {
            count: 0,
            freed: Some(freed),
        })
    }

    /// Point an existing entry at a new slot, keeping its reference count
    pub fn relocate(&self, id: &SectorId, storage_folder: u16, index: u32) -> Result<SectorLocation> {
        let mut shard = self.shard(id).write();
        let location = shard
            .get_mut(id)
            .ok_or(ContractManagerError::SectorNotFound(*id))?;
        location.storage_folder = storage_folder;
        location.index = index;
        Ok(*location)
    }

    /// Insert or overwrite an entry (log replay)
    pub(crate) fn upsert(&self, id: SectorId, location: SectorLocation) {
        if self.shard(&id).write().insert(id, location).is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete an entry regardless of its count (log replay)
    pub(crate) fn remove(&self, id: &SectorId) -> Option<SectorLocation> {
        let removed = self.shard(id).write().remove(id);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All sectors stored in one folder
    pub fn entries_in_folder(&self, folder: u16) -> Vec<(SectorId, SectorLocation)> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            entries.extend(
                shard
                    .read()
                    .iter()
                    .filter(|(_, loc)| loc.storage_folder == folder)
                    .map(|(id, loc)| (*id, *loc)),
            );
        }
        entries
    }

    /// Copy of every entry
    ///
    /// Shards are visited one at a time, so the copy is only a consistent
    /// cut when the caller has stopped mutations.
    pub fn snapshot(&self) -> Vec<(SectorId, SectorLocation)> {
        let mut entries = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            entries.extend(shard.read().iter().map(|(id, loc)| (*id, *loc)));
        }
        entries
    }
}

/// Striped per-sector locks
///
/// Serializes the check-then-act sequence of a store or release for one id
/// while unrelated ids proceed in parallel. Fetches take the shared side, so
/// a slot cannot be freed and reused underneath a read. Two ids may share a
/// stripe.
pub struct SectorLocks {
    stripes: Box<[CachePadded<RwLock<()>>]>,
    mask: u64,
}

impl SectorLocks {
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        SectorLocks {
            stripes: (0..count)
                .map(|_| CachePadded::new(RwLock::new(())))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            mask: count as u64 - 1,
        }
    }

    fn stripe(&self, id: &SectorId) -> &RwLock<()> {
        // Use the high bytes so stripes and index shards don't line up
        let key = id.spread().rotate_right(32);
        &self.stripes[(key & self.mask) as usize]
    }

    pub fn read(&self, id: &SectorId) -> RwLockReadGuard<'_, ()> {
        self.stripe(id).read()
    }

    pub fn write(&self, id: &SectorId) -> RwLockWriteGuard<'_, ()> {
        self.stripe(id).write()
    }
}
