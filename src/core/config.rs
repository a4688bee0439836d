//! Contract manager configuration
//!
//! Configuration is plain serde data so hosts can keep it in a TOML file next
//! to their other settings. Every value is validated before a manager opens.

use crate::core::allocator::DEFAULT_PROBE_LIMIT;
use crate::core::sector::SECTOR_SIZE;
use crate::error::{ContractManagerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Smallest folder a host may attach, in slots
pub const DEFAULT_MIN_FOLDER_SLOTS: u32 = 64;

/// Default host-wide limit: 2^25 sectors, 128 TiB at 4 MiB per sector
pub const DEFAULT_MAX_TOTAL_SLOTS: u64 = 1 << 25;

/// Log size that triggers an automatic checkpoint (64 MiB)
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_config"))]
pub struct ContractManagerConfig {
    /// Directory holding the metadata log and checkpoint
    pub data_dir: PathBuf,

    /// Size of one sector in bytes
    #[validate(range(min = 512))]
    pub sector_size: u64,

    /// Smallest capacity accepted by `add_folder` / `resize_folder`
    #[validate(range(min = 1))]
    pub min_folder_slots: u32,

    /// Largest capacity accepted by `add_folder` / `resize_folder`
    #[validate(range(min = 1))]
    pub max_folder_slots: u32,

    /// Upper bound on slots across every attached folder
    #[validate(range(min = 1))]
    pub max_total_slots: u64,

    /// Random word probes before the allocator falls back to a sweep
    pub probe_limit: usize,

    /// Number of index shards (power of two)
    #[validate(range(min = 1, max = 65536))]
    pub index_shards: usize,

    /// Number of per-sector lock stripes (power of two)
    #[validate(range(min = 1, max = 65536))]
    pub lock_stripes: usize,

    /// Log size in bytes that triggers an automatic checkpoint
    #[validate(range(min = 4096))]
    pub checkpoint_bytes: u64,

    /// Sync sector data to disk before committing its metadata
    pub sync_writes: bool,

    /// Deadline applied to each sector store, in milliseconds
    pub io_timeout_ms: Option<u64>,
}

impl Default for ContractManagerConfig {
    fn default() -> Self {
        ContractManagerConfig {
            data_dir: PathBuf::from("contract-manager"),
            sector_size: SECTOR_SIZE,
            min_folder_slots: DEFAULT_MIN_FOLDER_SLOTS,
            max_folder_slots: u32::MAX,
            max_total_slots: DEFAULT_MAX_TOTAL_SLOTS,
            probe_limit: DEFAULT_PROBE_LIMIT,
            index_shards: 256,
            lock_stripes: 1024,
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            sync_writes: true,
            io_timeout_ms: None,
        }
    }
}

fn validate_config(config: &ContractManagerConfig) -> std::result::Result<(), ValidationError> {
    if config.min_folder_slots > config.max_folder_slots {
        return Err(ValidationError::new("min_folder_slots_above_max"));
    }
    if !config.index_shards.is_power_of_two() {
        return Err(ValidationError::new("index_shards_not_power_of_two"));
    }
    if !config.lock_stripes.is_power_of_two() {
        return Err(ValidationError::new("lock_stripes_not_power_of_two"));
    }
    if config.sector_size % 64 != 0 {
        return Err(ValidationError::new("sector_size_not_multiple_of_64"));
    }
    Ok(())
}

impl ContractManagerConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        ContractManagerConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Check every field, mapping failures to `InvalidConfig`
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ContractManagerError::InvalidConfig(e.to_string()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ContractManagerConfig = toml::from_str(s)?;
        config.check()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ContractManagerConfig::default().check().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ContractManagerConfig::new("/var/lib/host");
        config.sector_size = 4096;
        config.io_timeout_ms = Some(250);

        let text = config.to_toml_string().unwrap();
        let parsed = ContractManagerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ContractManagerConfig::from_toml_str(
            r#"
            data_dir = "/srv/host"
            sector_size = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.sector_size, 8192);
        assert_eq!(config.index_shards, 256);
        assert_eq!(config.min_folder_slots, DEFAULT_MIN_FOLDER_SLOTS);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = ContractManagerConfig::default();
        config.index_shards = 100;
        assert!(matches!(
            config.check(),
            Err(ContractManagerError::InvalidConfig(_))
        ));

        let mut config = ContractManagerConfig::default();
        config.sector_size = 128;
        assert!(config.check().is_err());

        let mut config = ContractManagerConfig::default();
        config.min_folder_slots = 1000;
        config.max_folder_slots = 10;
        assert!(config.check().is_err());
    }
}
