//! Configuration types for CypreStore
//!
//! Plain structured values handed to the engine at construction. The
//! ExtentServer binary fills them from a TOML file; every section has
//! defaults so partial files are accepted.

use crate::error::{Error, Result};
use crate::types::{DeviceType, EsInstance, ReplicationMode, KIB, GIB, MIB};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for an ExtentServer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub replication: ReplicationConfig,
    pub pools: PoolConfig,
    pub metadata: MetadataConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints the engine relies on
    pub fn validate(&self) -> Result<()> {
        let s = &self.storage;
        if !s.align_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "align_size {} is not a power of two",
                s.align_size
            )));
        }
        if s.extent_size == 0 || s.extent_size % s.align_size != 0 {
            return Err(Error::Configuration(format!(
                "extent_size {} must be a non-zero multiple of align_size {}",
                s.extent_size, s.align_size
            )));
        }
        if s.block_size == 0 || s.block_size % s.align_size != 0 {
            return Err(Error::Configuration(format!(
                "block_size {} must be a non-zero multiple of align_size {}",
                s.block_size, s.align_size
            )));
        }
        if s.extent_size > s.block_size.saturating_mul(s.blocks_per_chunk) {
            return Err(Error::Configuration(format!(
                "extent_size {} does not fit in one allocator chunk of {} x {}",
                s.extent_size, s.block_size, s.blocks_per_chunk
            )));
        }
        if s.io_workers == 0 {
            return Err(Error::Configuration("io_workers must be at least 1".into()));
        }
        if !self.pools.request_pool_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "request_pool_size {} is not a power of two",
                self.pools.request_pool_size
            )));
        }
        if !self.pools.mem_ring_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "mem_ring_size {} is not a power of two",
                self.pools.mem_ring_size
            )));
        }
        if self.pools.mem_classes == 0 {
            return Err(Error::Configuration("mem_classes must be at least 1".into()));
        }
        Ok(())
    }
}

/// Identity of this ExtentServer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub es_id: u32,
    /// Address peers use to reach this instance
    pub address: String,
    /// Requests slower than this are logged
    pub slow_request_ms: u64,
    /// Interval between device admin ticks
    pub admin_interval_ms: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn instance(&self) -> EsInstance {
        EsInstance::new(self.es_id, self.address.clone())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            es_id: 0,
            address: "127.0.0.1:9500".to_string(),
            slow_request_ms: 500,
            admin_interval_ms: 10_000,
        }
    }
}

/// Block device and layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub device_type: DeviceType,
    /// Path to the device or backing file
    pub device_path: PathBuf,
    /// Size used when the backing file has to be created
    pub device_size: u64,
    /// Use direct I/O (O_DIRECT on Linux)
    pub direct_io: bool,
    /// I/O alignment for offsets and sizes (default: 4 KiB)
    pub align_size: u64,
    /// Logical extent size (default: 1 GiB)
    pub extent_size: u64,
    /// Allocator block granularity (default: 1 MiB)
    pub block_size: u64,
    /// Blocks per bitmap chunk, capped at 2^20
    pub blocks_per_chunk: u64,
    /// Device worker threads
    pub io_workers: usize,
    /// Requests a worker drains from the queue per batch
    pub io_batch: usize,
    /// Device submission queue size (power of two)
    pub io_queue_size: u32,
    /// Route local I/O through the log engine instead of the bare engine
    pub log_engine: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::File,
            device_path: PathBuf::from("./es-data/device.img"),
            device_size: 16 * GIB,
            direct_io: true,
            align_size: 4 * KIB,
            extent_size: GIB,
            block_size: MIB,
            blocks_per_chunk: 1 << 20,
            io_workers: 4,
            io_batch: 32,
            io_queue_size: 4096,
            log_engine: false,
        }
    }
}

/// Replication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
}

/// Request and I/O memory pool sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooled request contexts (power of two)
    pub request_pool_size: u32,
    /// Number of I/O memory classes: 4 KiB * 2^n for n in 0..classes
    pub mem_classes: u32,
    /// Ring size per memory class (power of two)
    pub mem_ring_size: u32,
    /// First arena block size per class
    pub arena_initial_block: usize,
    /// Largest arena block
    pub arena_max_block: usize,
    /// Back arena blocks with huge pages when available
    pub huge_page: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_pool_size: 4096,
            mem_classes: 9, // 4 KiB .. 1 MiB
            mem_ring_size: 1024,
            arena_initial_block: 2 * MIB as usize,
            arena_max_block: 64 * MIB as usize,
            huge_page: false,
        }
    }
}

/// Extent location store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./es-data/extent_meta.redb"),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.align_size, 4096);
        assert_eq!(config.storage.extent_size, GIB);
        assert_eq!(config.replication.mode, ReplicationMode::Standard);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_misaligned_extent() {
        let mut config = Config::default();
        config.storage.extent_size = 4097;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_extent_larger_than_chunk() {
        let mut config = Config::default();
        config.storage.blocks_per_chunk = 16;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            es_id = 3

            [storage]
            device_path = "/dev/nvme0n1"
            direct_io = false

            [replication]
            mode = "star"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.es_id, 3);
        assert_eq!(config.server.slow_request_ms, 500);
        assert_eq!(config.storage.device_path, PathBuf::from("/dev/nvme0n1"));
        assert!(!config.storage.direct_io);
        assert_eq!(config.storage.extent_size, GIB);
        assert_eq!(config.replication.mode, ReplicationMode::Star);
        assert_eq!(config.pools.request_pool_size, 4096);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_pool_size() {
        let mut config = Config::default();
        config.pools.request_pool_size = 1000;
        assert!(config.validate().is_err());
    }
}
