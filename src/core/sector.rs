//! Sector identifiers and location records
//!
//! A sector is the fixed-size unit of data a host stores. Sectors are
//! addressed by a 12-byte [`SectorId`] derived from their content, and the
//! index maps each id to a [`SectorLocation`]: which folder, which slot, and
//! how many logical references share the physical copy.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Default sector size (4 MiB)
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Width of a sector identifier in bytes
pub const SECTOR_ID_LEN: usize = 12;

/// Width of the per-host salt mixed into sector ids
pub const SALT_LEN: usize = 32;

/// Fixed-width, content-derived sector identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId([u8; SECTOR_ID_LEN]);

impl SectorId {
    pub const fn new(bytes: [u8; SECTOR_ID_LEN]) -> Self {
        SectorId(bytes)
    }

    /// Derive an id from a sector's content root and the host salt
    ///
    /// The id is the first 12 bytes of `SHA-256(salt || root)`. Salting keeps
    /// ids unpredictable to anyone who does not know the host's salt.
    pub fn derive(salt: &[u8; SALT_LEN], root: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(root);
        let digest = hasher.finalize();

        let mut bytes = [0u8; SECTOR_ID_LEN];
        bytes.copy_from_slice(&digest[..SECTOR_ID_LEN]);
        SectorId(bytes)
    }

    /// Derive an id by hashing the raw sector bytes as the content root
    pub fn from_data(salt: &[u8; SALT_LEN], data: &[u8]) -> Self {
        let root = Sha256::digest(data);
        Self::derive(salt, &root)
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_ID_LEN] {
        &self.0
    }

    /// Stable 64-bit key used to spread ids over index shards and lock stripes
    pub(crate) fn spread(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(word)
    }
}

impl From<[u8; SECTOR_ID_LEN]> for SectorId {
    fn from(bytes: [u8; SECTOR_ID_LEN]) -> Self {
        SectorId(bytes)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorId({})", self)
    }
}

/// Physical location of a stored sector (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorLocation {
    /// Slot offset within the owning storage folder
    pub index: u32,
    /// Owning storage folder
    pub storage_folder: u16,
    /// Number of logical references sharing this physical copy (always >= 1)
    pub count: u16,
}

impl SectorLocation {
    /// A freshly stored sector with a single reference
    pub fn new(storage_folder: u16, index: u32) -> Self {
        SectorLocation {
            index,
            storage_folder,
            count: 1,
        }
    }

    /// The `(folder, slot)` pair this location occupies
    pub fn slot(&self) -> (u16, u32) {
        (self.storage_folder, self.index)
    }
}
