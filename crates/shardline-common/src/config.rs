//! Configuration types for Shardline
//!
//! Loaded from TOML by the CLI; every section falls back to its defaults so a
//! partial (or missing) file is valid.

use crate::checksum::BitrotAlgorithm;
use crate::types::HealScanMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default erasure block size (10 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 10 * 1024 * 1024;

/// Root configuration for Shardline
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,
    /// Healing configuration
    pub heal: HealConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Ordered disk directories forming the erasure set
    pub disks: Vec<PathBuf>,
    /// Erasure block size in bytes
    pub block_size: usize,
    /// Parity shards per object (None = half the disks)
    pub parity_blocks: Option<usize>,
    /// Bitrot protection for newly written shards
    pub bitrot_algorithm: BitrotAlgorithm,
    /// Shard buffers kept per disk
    pub buffer_pool_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disks: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            parity_blocks: None,
            bitrot_algorithm: BitrotAlgorithm::default(),
            buffer_pool_capacity: 4,
        }
    }
}

impl StorageConfig {
    /// Parity count for a set of `disk_count` disks
    #[must_use]
    pub fn parity_for(&self, disk_count: usize) -> usize {
        self.parity_blocks.unwrap_or(disk_count / 2)
    }
}

/// Healing configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Default scan depth for object heals
    pub scan_mode: HealScanMode,
    /// Delete dangling objects and buckets found while healing
    pub remove_dangling: bool,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
