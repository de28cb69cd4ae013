//! Engine configuration surface (§6 "Config surface").
//!
//! Loaded from a TOML file via `serde` + `toml`, the same way the rest of
//! the ambient stack favors declarative config over hand-parsed flags.
//! Every field has a production-sane default so a missing config file opens
//! an engine that behaves exactly like `EngineConfig::default()`.

use docdb_core::error::{Error, Result};
use docdb_core::limits::{DEFAULT_PARTITION_COUNT, DEFAULT_SHARD_COUNT};
use docdb_durability::FsyncMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durability knobs: everything that shapes the WAL writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DurabilityConfig {
    /// `Always` | `Group` | `Interval` | `None`.
    pub fsync_mode: FsyncModeConfig,
    /// Records per batch before `Group` mode's fast-path sync.
    pub group_batch_size: usize,
    /// Timer period for `Group`/`Interval` modes, in milliseconds.
    pub group_interval_ms: u64,
    /// Rotate a partition's active WAL segment once it reaches this size.
    pub wal_rotation_size_bytes: u64,
    /// Force a checkpoint once this many bytes have been written since the
    /// last one, bounding recovery replay time.
    pub checkpoint_interval_bytes: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        DurabilityConfig {
            fsync_mode: FsyncModeConfig::Group,
            group_batch_size: 64,
            group_interval_ms: 5,
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            checkpoint_interval_bytes: 16 * 1024 * 1024,
        }
    }
}

impl DurabilityConfig {
    /// Resolve the declarative config into the [`FsyncMode`] the writer
    /// actually consumes.
    pub fn resolve_fsync_mode(&self) -> FsyncMode {
        match self.fsync_mode {
            FsyncModeConfig::Always => FsyncMode::Always,
            FsyncModeConfig::None => FsyncMode::None,
            FsyncModeConfig::Group => FsyncMode::Group {
                batch_size: self.group_batch_size,
                interval_ms: self.group_interval_ms,
            },
            FsyncModeConfig::Interval => FsyncMode::Interval {
                interval_ms: self.group_interval_ms,
            },
        }
    }
}

/// The serializable tag for an [`FsyncMode`]; kept separate from the enum
/// itself so `docdb-durability` doesn't need a `serde` dependency for a
/// config-layer concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncModeConfig {
    Always,
    Group,
    Interval,
    None,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    pub durability: DurabilityConfig,
    /// Partitions assigned to a database at creation time; fixed for the
    /// life of the database.
    pub partition_count: u16,
    /// Index shard count per database; must be a power of two.
    pub shard_count: usize,
    /// Bounded depth of each database's scheduler queue.
    pub scheduler_queue_depth: usize,
    /// Worker threads in the shared pool.
    pub worker_count: usize,
    /// Per-database memory cap, in bytes of encoded JSON payload.
    pub per_db_memory_cap_bytes: u64,
    /// Cap shared across every open database.
    pub global_memory_cap_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            durability: DurabilityConfig::default(),
            partition_count: DEFAULT_PARTITION_COUNT,
            shard_count: DEFAULT_SHARD_COUNT,
            scheduler_queue_depth: 1024,
            worker_count: num_cpus_fallback(),
            per_db_memory_cap_bytes: 512 * 1024 * 1024,
            global_memory_cap_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidPayload(format!("bad config: {e}")))
    }

    /// Load a config file, falling back to defaults if it doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::from(e)),
        }
    }
}
