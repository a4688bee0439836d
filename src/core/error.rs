use crate::core::sector::SectorId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractManagerError {
    #[error("Sector not found: {0}")]
    SectorNotFound(SectorId),

    #[error("Storage folder not found: {0}")]
    FolderNotFound(u16),

    #[error("Storage folder path already in use: {0}")]
    FolderPathInUse(std::path::PathBuf),

    #[error("Sector already exists: {0}")]
    AlreadyExists(SectorId),

    #[error("No space: no storage folder has a free sector slot")]
    NoSpace,

    #[error("Storage folder {folder} is not empty: {used} slots still in use")]
    FolderNotEmpty { folder: u16, used: u64 },

    #[error(
        "Capacity violation on folder {folder}: cannot shrink to {requested} slots, slot {highest_used} is in use"
    )]
    CapacityViolation {
        folder: u16,
        requested: u32,
        highest_used: u32,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Storage folder {0} is halted after a consistency fault; run repair")]
    FolderHalted(u16),

    #[error("Reference count overflow for sector {0}")]
    ReferenceOverflow(SectorId),

    #[error("Invalid sector size: expected {expected} bytes, got {actual}")]
    InvalidSectorSize { expected: usize, actual: usize },

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Host capacity exceeded: {requested} slots requested, limit is {limit}")]
    CapacityExceeded { requested: u64, limit: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ContractManagerError {
    /// Expected outcomes that callers handle as part of normal operation
    /// (retry elsewhere, report insufficient space, and so on).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContractManagerError::SectorNotFound(_)
                | ContractManagerError::FolderNotFound(_)
                | ContractManagerError::AlreadyExists(_)
                | ContractManagerError::FolderPathInUse(_)
                | ContractManagerError::NoSpace
                | ContractManagerError::FolderNotEmpty { .. }
                | ContractManagerError::CapacityViolation { .. }
                | ContractManagerError::Cancelled
                | ContractManagerError::TimedOut
        )
    }

    /// Faults that need operator attention.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ContractManagerError::Corruption(_)
                | ContractManagerError::PersistenceFailure(_)
                | ContractManagerError::FolderHalted(_)
        )
    }
}

impl From<bincode::Error> for ContractManagerError {
    fn from(err: bincode::Error) -> Self {
        ContractManagerError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ContractManagerError {
    fn from(err: serde_json::Error) -> Self {
        ContractManagerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ContractManagerError {
    fn from(err: toml::de::Error) -> Self {
        ContractManagerError::InvalidConfig(err.to_string())
    }
}

impl From<toml::ser::Error> for ContractManagerError {
    fn from(err: toml::ser::Error) -> Self {
        ContractManagerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContractManagerError>;
