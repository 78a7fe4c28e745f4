//! # 配置中心
//!
//! One TOML document, one section per concern:
//!
//! | Section          | Type                   | Used by                          |
//! |------------------|------------------------|----------------------------------|
//! | `[sync]`         | [`SyncConfig`]         | queue, backoff, manager          |
//! | `[storage]`      | [`StorageConfig`]      | SQLite task and record databases |
//! | `[remote]`       | [`RemoteConfig`]       | HTTP backend and object storage  |
//! | `[media]`        | [`MediaConfig`]        | image re-encoding before upload  |
//! | `[connectivity]` | [`ConnectivityConfig`] | reachability probe               |
//!
//! Every key has a default, so an empty file is valid. See [`ConfigLoader`] for
//! the file and environment layering.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod connectivity;
mod loader;
mod media;
mod remote;
mod storage;
mod sync;

pub use connectivity::ConnectivityConfig;
pub use loader::ConfigLoader;
pub use media::MediaConfig;
pub use remote::RemoteConfig;
pub use storage::StorageConfig;
pub use sync::{
    SyncConfig, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_MAX_PARALLEL_TASKS,
};

use crate::error::{Result, SyncError};

/// Everything the engine and the CLI read at startup
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Sync engine run parameters
    #[serde(default)]
    pub sync: SyncConfig,

    /// Local database locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote backend and object storage
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Upload media pipeline
    #[serde(default)]
    pub media: MediaConfig,

    /// Reachability probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
}

impl Config {
    /// Discovered file plus `MINDLOG_*` overrides
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// A named file plus `MINDLOG_*` overrides
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        ConfigLoader::with_path(path).load()
    }

    /// Every section must pass before the engine is built
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.storage.validate()?;
        self.remote.validate()?;
        self.media.validate()?;
        self.connectivity.validate()?;
        Ok(())
    }
}

/// Implemented by each config section
pub trait ValidateConfig {
    /// Reject values the engine cannot run with
    fn validate(&self) -> Result<()>;
}

fn validation_error(msg: impl Into<String>) -> SyncError {
    SyncError::configuration(format!("Validation error: {}", msg.into()))
}

fn require_path(path: &Path, name: &str) -> Result<()> {
    match path.as_os_str().is_empty() {
        true => Err(validation_error(format!("{} must not be empty", name))),
        false => Ok(()),
    }
}

fn require_nonzero(value: u64, name: &str) -> Result<()> {
    match value {
        0 => Err(validation_error(format!("{} must be greater than zero", name))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_require_helpers() {
        assert!(require_path(Path::new("/var/lib/mindlog"), "data_dir").is_ok());
        assert!(require_path(Path::new(""), "data_dir").is_err());
        assert!(require_nonzero(1, "interval").is_ok());
        assert!(require_nonzero(0, "interval").is_err());
    }

    #[test]
    fn test_default_survives_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.sync, config.sync);
        assert_eq!(parsed.remote.records_table, config.remote.records_table);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            max_parallel_tasks = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.max_parallel_tasks, 8);
        assert_eq!(config.sync.backoff_base_ms, DEFAULT_BACKOFF_BASE_MS);
        assert_eq!(config.media.jpeg_quality, MediaConfig::default().jpeg_quality);
    }
}
