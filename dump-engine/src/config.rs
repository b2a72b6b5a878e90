//! Configuration management for the dump engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root; finished archives live under `<root>/backups`
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Parent directory of per-job work directories
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Archive file extension, without the dot
    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Age after which a lock file is considered abandoned
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// Packing estimator tick interval
    #[serde(default = "default_pack_tick_ms")]
    pub pack_tick_ms: u64,

    /// Assumed worst-case packing duration for the time-based estimate
    #[serde(default = "default_pack_worst_case_secs")]
    pub pack_worst_case_secs: u64,

    /// Maximum dumps running at once in one process
    #[serde(default = "default_max_concurrent_dumps")]
    pub max_concurrent_dumps: usize,

    /// Application version recorded in the manifest
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Push gateway endpoint. Progress is not pushed when unset.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("tego-dump")
}

fn default_file_extension() -> String {
    "tego".to_string()
}

fn default_lock_stale_secs() -> u64 {
    2 * 60 * 60
}

fn default_pack_tick_ms() -> u64 {
    300
}

fn default_pack_worst_case_secs() -> u64 {
    600
}

fn default_max_concurrent_dumps() -> usize {
    1
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            file_extension: default_file_extension(),
            lock_stale_secs: default_lock_stale_secs(),
            pack_tick_ms: default_pack_tick_ms(),
            pack_worst_case_secs: default_pack_worst_case_secs(),
            max_concurrent_dumps: default_max_concurrent_dumps(),
            app_version: default_app_version(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            dump: DumpConfig::default(),
            notify: NotifyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Directory holding finished archives and their side files
    pub fn backups_dir(&self) -> PathBuf {
        self.storage.root.join("backups")
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.dump.lock_stale_secs)
    }
}
