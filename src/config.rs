use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::wal::SyncPolicy;

/// Server configuration. Every field has a default, so a TOML file only
/// needs to name what it changes, and a missing file is the same as an
/// empty one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // Network
    pub listen_addr: String,
    pub max_clients: usize,

    // Limits
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,

    // Persistence
    pub data_dir: PathBuf,
    pub wal_max_bytes: u64,
    pub sync_policy: SyncPolicy,
    pub batch_fsync_ms: u64,
    pub batch_fsync_bytes: u64,

    // Snapshot
    pub enable_snapshot: bool,
    pub snapshot_pause_max_ms: u64,
    pub busy_warn_ms: u64,

    // Expiry
    pub sweep_interval_ms: u64,
    pub sweep_batch: usize,

    // Logging
    pub log_level: String,
    pub log_file: String,
    pub slowlog_threshold_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7070".to_string(),
            max_clients: 10_000,
            max_key_bytes: 256,
            max_value_bytes: 16 * 1024 * 1024,
            data_dir: PathBuf::from("./data"),
            wal_max_bytes: 256 * 1024 * 1024,
            sync_policy: SyncPolicy::Batch,
            batch_fsync_ms: 100,
            batch_fsync_bytes: 1024 * 1024,
            enable_snapshot: true,
            snapshot_pause_max_ms: 500,
            busy_warn_ms: 50,
            sweep_interval_ms: 200,
            sweep_batch: 1000,
            log_level: "info".to_string(),
            log_file: String::new(),
            slowlog_threshold_ms: 50,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn slowlog_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slowlog_threshold_ms)
    }

    pub fn busy_warn(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_warn_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
