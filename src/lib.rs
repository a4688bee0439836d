//! # Contract Manager - Sector Storage for Hosts
//!
//! `contract-manager` keeps track of where every stored sector lives on a
//! host's disks. It combines three pieces:
//!
//! - **Sector location index**: sharded map from a 12-byte sector id to its
//!   folder, slot and reference count
//! - **Storage folders**: fixed-size slot areas with a bitmap allocator each
//! - **Metadata log**: write-ahead log plus checkpoints, so every
//!   acknowledged operation survives a crash and nothing else does
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contract_manager::{ContractManagerBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let manager = ContractManagerBuilder::new("/var/lib/host/metadata").open()?;
//!
//! // Attach a disk with room for 1024 sectors
//! let folder = manager.add_folder("/mnt/disk1/sectors", 1024)?;
//!
//! // Store, fetch and release a sector
//! let data = vec![7u8; manager.config().sector_size as usize];
//! let id = manager.sector_id(&data);
//! manager.store_sector(id, &data)?;
//! assert_eq!(manager.fetch_sector(&id)?, data);
//! manager.release_sector(&id)?;
//!
//! println!("{:?}", manager.folder_usage(folder)?);
//! manager.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Backends
//!
//! ```rust,no_run
//! use contract_manager::{ContractManagerBuilder, MemorySectorIo, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let manager = ContractManagerBuilder::new("/tmp/cm-metadata")
//!     .sector_size(4096)
//!     .folder_slots(1, 1 << 20)
//!     .sector_io(Arc::new(MemorySectorIo::new()))
//!     .open()?;
//! # Ok(())
//! # }
//! ```

// Core implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    allocator, config, context, error, folder, index, io, manager, sector, wal,
};

// Re-export core types that users need
pub use crate::core::{
    allocator::BitmapAllocator,
    config::ContractManagerConfig,
    context::{CancelToken, OpContext},
    error::{ContractManagerError, Result},
    folder::{FolderUsage, StorageFolder},
    index::{SectorIndex, SectorLocks},
    io::{FileSectorIo, MemorySectorIo, SectorIo},
    manager::{ConsistencyReport, ContractManager, StoreOutcome},
    sector::{SectorId, SectorLocation, SALT_LEN, SECTOR_ID_LEN, SECTOR_SIZE},
    wal::{
        Batch, Change, FolderRecord, MemoryStore, MetadataStore, Recovered, Snapshot, WalStore,
    },
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Builder for opening a [`ContractManager`]
///
/// # Examples
///
/// ```rust,no_run
/// use contract_manager::ContractManagerBuilder;
///
/// # fn main() -> contract_manager::Result<()> {
/// let manager = ContractManagerBuilder::new("/var/lib/host/metadata")
///     .sync_writes(false)
///     .checkpoint_bytes(16 * 1024 * 1024)
///     .open()?;
/// # Ok(())
/// # }
/// ```
pub struct ContractManagerBuilder {
    config: ContractManagerConfig,
    sector_io: Option<Arc<dyn SectorIo>>,
    metadata_store: Option<Arc<dyn MetadataStore>>,
}

impl ContractManagerBuilder {
    /// Start from the default configuration rooted at `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self::from_config(ContractManagerConfig::new(data_dir))
    }

    /// Start from an existing configuration (e.g. loaded from TOML)
    pub fn from_config(config: ContractManagerConfig) -> Self {
        ContractManagerBuilder {
            config,
            sector_io: None,
            metadata_store: None,
        }
    }

    /// Set the directory holding the metadata log and checkpoints
    pub fn data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.config.data_dir = data_dir.into();
        self
    }

    /// Set the sector size in bytes
    pub fn sector_size(mut self, sector_size: u64) -> Self {
        self.config.sector_size = sector_size;
        self
    }

    /// Set the accepted folder capacity range, in slots
    pub fn folder_slots(mut self, min: u32, max: u32) -> Self {
        self.config.min_folder_slots = min;
        self.config.max_folder_slots = max;
        self
    }

    /// Set the host-wide slot limit
    pub fn max_total_slots(mut self, max_total_slots: u64) -> Self {
        self.config.max_total_slots = max_total_slots;
        self
    }

    pub fn probe_limit(mut self, probe_limit: usize) -> Self {
        self.config.probe_limit = probe_limit;
        self
    }

    pub fn index_shards(mut self, shards: usize) -> Self {
        self.config.index_shards = shards;
        self
    }

    pub fn lock_stripes(mut self, stripes: usize) -> Self {
        self.config.lock_stripes = stripes;
        self
    }

    /// Log size that triggers an automatic checkpoint
    pub fn checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.config.checkpoint_bytes = bytes;
        self
    }

    /// Sync sector data before committing metadata (default: true)
    pub fn sync_writes(mut self, sync_writes: bool) -> Self {
        self.config.sync_writes = sync_writes;
        self
    }

    /// Deadline applied to every sector store
    pub fn io_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.io_timeout_ms = Some(timeout_ms);
        self
    }

    /// Use a custom sector I/O backend instead of one data file per folder
    pub fn sector_io(mut self, io: Arc<dyn SectorIo>) -> Self {
        self.sector_io = Some(io);
        self
    }

    /// Use a custom metadata store instead of the write-ahead log
    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata_store = Some(store);
        self
    }

    /// Validate the configuration and open the manager
    pub fn open(self) -> Result<ContractManager> {
        let config = self.config;
        config.check()?;

        info!(
            "Opening contract manager in {:?} (sector size {})",
            config.data_dir, config.sector_size
        );

        let io: Arc<dyn SectorIo> = match self.sector_io {
            Some(io) => io,
            None => Arc::new(FileSectorIo::new(config.sector_size, config.sync_writes)),
        };
        let store: Arc<dyn MetadataStore> = match self.metadata_store {
            Some(store) => store,
            None => Arc::new(WalStore::open(&config.data_dir)?),
        };

        ContractManager::open_with(config, io, store)
    }
}
