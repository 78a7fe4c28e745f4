//! # Sync Configuration
//!
//! Run parameters of the sync engine. Created once at process start and never
//! mutated afterwards; the manager only keeps a shared immutable copy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{require_nonzero, validation_error, ValidateConfig};
use crate::error::Result;

/// Default number of concurrently executing tasks
pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 3;

/// Default first retry delay
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;

/// Default retry delay cap (10 minutes)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 600_000;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Admission limit: tasks in flight at once
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,

    /// Delay after the first failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the (pre-jitter) retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Re-encode images before upload
    #[serde(default = "default_true")]
    pub upload_compression: bool,

    /// Enqueue a full refresh when the engine starts
    #[serde(default = "default_true")]
    pub pull_on_startup: bool,

    /// Retry failed tasks over metered connections
    #[serde(default = "default_true")]
    pub retry_on_metered: bool,

    /// Move a task to FAILED after this many attempts (unset: retry forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Safety-net tick while online
    #[serde(default = "default_online_poll_interval_ms")]
    pub online_poll_interval_ms: u64,

    /// Safety-net tick while offline
    #[serde(default = "default_offline_poll_interval_ms")]
    pub offline_poll_interval_ms: u64,

    /// How long COMPLETED/CANCELLED rows are kept
    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: u64,

    /// How often the cleanup runs
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Idle entity locks kept before eviction
    #[serde(default = "default_lock_cache_capacity")]
    pub lock_cache_capacity: usize,

    /// Event bus buffer per subscriber
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Period requested from the platform scheduler
    #[serde(default = "default_wake_interval_secs")]
    pub wake_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            upload_compression: true,
            pull_on_startup: true,
            retry_on_metered: true,
            max_attempts: None,
            online_poll_interval_ms: default_online_poll_interval_ms(),
            offline_poll_interval_ms: default_offline_poll_interval_ms(),
            completed_retention_hours: default_completed_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            lock_cache_capacity: default_lock_cache_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
            wake_interval_secs: default_wake_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn online_poll_interval(&self) -> Duration {
        Duration::from_millis(self.online_poll_interval_ms)
    }

    pub fn offline_poll_interval(&self) -> Duration {
        Duration::from_millis(self.offline_poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs)
    }

    /// Retention window in milliseconds
    pub fn completed_retention_ms(&self) -> i64 {
        (self.completed_retention_hours as i64).saturating_mul(3_600_000)
    }
}

impl ValidateConfig for SyncConfig {
    fn validate(&self) -> Result<()> {
        require_nonzero(self.max_parallel_tasks as u64, "max_parallel_tasks")?;
        require_nonzero(self.backoff_base_ms, "backoff_base_ms")?;

        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(validation_error(format!(
                "backoff_max_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }

        if self.max_attempts == Some(0) {
            return Err(validation_error("max_attempts must be at least 1 when set"));
        }

        require_nonzero(self.online_poll_interval_ms, "online_poll_interval_ms")?;
        require_nonzero(self.offline_poll_interval_ms, "offline_poll_interval_ms")?;
        require_nonzero(self.cleanup_interval_secs, "cleanup_interval_secs")?;
        require_nonzero(self.lock_cache_capacity as u64, "lock_cache_capacity")?;
        require_nonzero(self.event_channel_capacity as u64, "event_channel_capacity")?;
        require_nonzero(self.wake_interval_secs, "wake_interval_secs")?;

        Ok(())
    }
}

fn default_max_parallel_tasks() -> usize {
    DEFAULT_MAX_PARALLEL_TASKS
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_true() -> bool {
    true
}

fn default_online_poll_interval_ms() -> u64 {
    1_000
}

fn default_offline_poll_interval_ms() -> u64 {
    5_000
}

fn default_completed_retention_hours() -> u64 {
    24 * 7
}

fn default_cleanup_interval_secs() -> u64 {
    3_600
}

fn default_lock_cache_capacity() -> usize {
    1_024
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_wake_interval_secs() -> u64 {
    15 * 60
}
