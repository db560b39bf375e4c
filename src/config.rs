#![forbid(unsafe_code)]

//! Engine settings loaded from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::wal::{Synchronous, WalOptions};
use crate::types::{Result, StrataError};

const MIN_PAGE_SIZE: u32 = 512;
const MAX_PAGE_SIZE: u32 = 32 * 1024;
const MIN_WAL_SEGMENT_BYTES: u64 = 4096;

/// Storage engine settings. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Page size in bytes; a power of two between 512 and 32768.
    pub page_size: u32,
    /// Page capacity of the default region.
    pub region_pages: usize,
    /// Copy-on-write buffer of the default region, in pages.
    pub checkpoint_buffer_pages: usize,
    pub checkpoint_frequency_ms: u64,
    pub checkpoint_threads: usize,
    /// Page images a checkpoint holds in memory at once while writing stores.
    pub checkpoint_write_batch_pages: usize,
    pub synchronous: Synchronous,
    /// Longest gap between WAL syncs in `normal` mode.
    pub wal_sync_interval_ms: u64,
    /// Size at which the active WAL segment is sealed.
    pub wal_segment_bytes: u64,
    /// Finished transactions remembered in each checkpoint record.
    pub wal_tx_retention: usize,
    pub throttle_enabled: bool,
    /// Page capacity of each temporary defragmentation region.
    pub defrag_region_pages: usize,
    /// Longest checkpoint read lock hold while defragmenting.
    pub defrag_lock_hold_ms: u64,
    pub verify_checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            region_pages: 16 * 1024,
            checkpoint_buffer_pages: 4096,
            checkpoint_frequency_ms: 180_000,
            checkpoint_threads: 4,
            checkpoint_write_batch_pages: 1024,
            synchronous: Synchronous::Full,
            wal_sync_interval_ms: 10,
            wal_segment_bytes: 64 << 20,
            wal_tx_retention: 4096,
            throttle_enabled: true,
            defrag_region_pages: 4096,
            defrag_lock_hold_ms: 150,
            verify_checksums: true,
        }
    }
}

impl StorageConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| StrataError::Config(format!("failed to read {}: {err}", path.display())))?;
        let config = Self::parse(&raw)
            .map_err(|err| StrataError::Config(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), "config.loaded");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|err| StrataError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| StrataError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(StrataError::Config(format!(
                "page_size {} is not a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.region_pages < 16 {
            return Err(StrataError::Config("region_pages must be at least 16".into()));
        }
        if self.checkpoint_buffer_pages == 0 || self.checkpoint_buffer_pages > self.region_pages {
            return Err(StrataError::Config(
                "checkpoint_buffer_pages must be in 1..=region_pages".into(),
            ));
        }
        if self.checkpoint_threads == 0 {
            return Err(StrataError::Config("checkpoint_threads must be positive".into()));
        }
        if self.checkpoint_frequency_ms == 0 {
            return Err(StrataError::Config("checkpoint_frequency_ms must be positive".into()));
        }
        if self.checkpoint_write_batch_pages == 0 {
            return Err(StrataError::Config("checkpoint_write_batch_pages must be positive".into()));
        }
        if self.wal_segment_bytes < MIN_WAL_SEGMENT_BYTES {
            return Err(StrataError::Config(format!(
                "wal_segment_bytes must be at least {MIN_WAL_SEGMENT_BYTES}"
            )));
        }
        if self.defrag_region_pages < 16 {
            return Err(StrataError::Config("defrag_region_pages must be at least 16".into()));
        }
        Ok(())
    }

    pub fn checkpoint_frequency(&self) -> Duration {
        Duration::from_millis(self.checkpoint_frequency_ms)
    }

    pub fn wal_sync_interval(&self) -> Duration {
        Duration::from_millis(self.wal_sync_interval_ms)
    }

    pub fn wal_options(&self) -> WalOptions {
        WalOptions {
            segment_bytes: self.wal_segment_bytes,
            tx_retention: self.wal_tx_retention,
        }
    }

    pub fn defrag_lock_hold(&self) -> Duration {
        Duration::from_millis(self.defrag_lock_hold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() -> Result<()> {
        let config = StorageConfig::parse("page_size = 8192\nsynchronous = \"normal\"\n")?;
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.synchronous, Synchronous::Normal);
        assert_eq!(config.region_pages, StorageConfig::default().region_pages);
        assert_eq!(StorageConfig::parse(&config.to_toml()?)?, config);
        Ok(())
    }

    #[test]
    fn bad_values_are_config_errors() {
        for raw in [
            "page_size = 3000",
            "page_size = 65536",
            "checkpoint_threads = 0",
            "checkpoint_write_batch_pages = 0",
            "wal_segment_bytes = 100",
            "synchronous = \"sometimes\"",
            "no_such_field = 1",
        ] {
            let err = StorageConfig::parse(raw).expect_err(raw);
            assert!(matches!(err, StrataError::Config(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn load_names_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("strata.toml");
        fs::write(&path, "page_size = 100")?;
        let err = StorageConfig::load(&path).expect_err("invalid");
        assert!(err.to_string().contains("strata.toml"));
        Ok(())
    }
}
