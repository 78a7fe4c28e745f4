//! # 本地存储配置
//!
//! Locations and SQLite settings of the local databases.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{require_path, validation_error, ValidateConfig};
use crate::error::Result;

/// How long SQLite waits on a locked database, in milliseconds
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Where the queue and record databases live
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding both databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sync queue database file name
    #[serde(default = "default_queue_db")]
    pub queue_db: String,

    /// Journal records database file name
    #[serde(default = "default_records_db")]
    pub records_db: String,

    /// Open both databases in write-ahead-log mode
    #[serde(default = "default_wal_enabled")]
    pub wal_enabled: bool,

    /// How long to wait when the database is locked
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue_db: default_queue_db(),
            records_db: default_records_db(),
            wal_enabled: default_wal_enabled(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Full path of the sync queue database
    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.queue_db)
    }

    /// Full path of the journal records database
    pub fn records_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.records_db)
    }
}

impl ValidateConfig for StorageConfig {
    fn validate(&self) -> Result<()> {
        require_path(&self.data_dir, "data_dir")?;

        if self.queue_db.trim().is_empty() {
            return Err(validation_error("queue_db cannot be empty"));
        }
        if self.records_db.trim().is_empty() {
            return Err(validation_error("records_db cannot be empty"));
        }
        if self.queue_db == self.records_db {
            return Err(validation_error(
                "queue_db and records_db must be different files",
            ));
        }

        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mindlog"))
        .unwrap_or_else(|| PathBuf::from(".mindlog"))
}

fn default_queue_db() -> String {
    "sync_queue.db".to_string()
}

fn default_records_db() -> String {
    "journal.db".to_string()
}

fn default_wal_enabled() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
