//! # Storage Module
//!
//! Local persistence behind the sync engine.
//!
//! ## 模块结构
//!
//! - `task_db`: durable sync queue rows (`sync_tasks` table)
//! - `record_db`: journal records as seen by the device (`journal_records` table)
//!
//! Both databases are plain SQLite files opened in WAL mode, so a process killed
//! mid-write never leaves a half-applied transition behind.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::types::{JournalRecord, RemoteRecord, SyncTaskEntity, TaskKind, TaskState};

pub mod record_db;
pub mod task_db;

pub use record_db::RecordDb;
pub use task_db::TaskDb;

/// Row written by [`TaskStore::upsert_pending`]
#[derive(Debug, Clone)]
pub struct NewTaskRow<'a> {
    pub id: &'a str,
    pub task_type: TaskKind,
    pub payload: &'a str,
    pub local_id: Option<i64>,
    pub now: i64,
}

/// Which due rows [`TaskStore::due`] returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueFilter {
    /// Skip rows that already failed at least once
    pub first_attempt_only: bool,
    /// Skip rows of a record that still has an older PENDING or RUNNING row
    pub entity_heads_only: bool,
}

/// Outcome of a failed attempt, written by [`TaskStore::record_attempt`]
#[derive(Debug, Clone)]
pub struct AttemptUpdate<'a> {
    pub attempt_count: u32,
    /// Lower bound for the new due time; the stored value never decreases
    pub next_run_at: i64,
    /// `Pending` to retry, `Failed` when the attempt budget is spent
    pub state: TaskState,
    pub error: Option<&'a str>,
    pub now: i64,
}

/// Persistence of sync task rows
///
/// Every state transition is a single conditional `UPDATE`; the returned `bool`
/// tells whether the guard matched.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace the row keyed by `row.id`, resetting it to PENDING
    async fn upsert_pending(&self, row: NewTaskRow<'_>) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SyncTaskEntity>>;

    /// PENDING rows due at `now`, oldest due time first, then insertion order
    async fn due(&self, now: i64, limit: usize, filter: DueFilter) -> Result<Vec<SyncTaskEntity>>;

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<SyncTaskEntity>>;

    /// Move `id` to `to` when its state is one of `from` (and its revision matches, if given)
    async fn transition(
        &self,
        id: &str,
        from: &[TaskState],
        to: TaskState,
        revision: Option<i64>,
        now: i64,
    ) -> Result<bool>;

    /// Record a failed attempt when the state is one of `from`
    async fn record_attempt(
        &self,
        id: &str,
        from: &[TaskState],
        revision: Option<i64>,
        update: AttemptUpdate<'_>,
    ) -> Result<bool>;

    /// Cancel all non-terminal rows of one record
    async fn cancel_for_local_id(&self, local_id: i64, now: i64) -> Result<usize>;

    async fn count(&self, state: TaskState) -> Result<u64>;

    /// RUNNING → PENDING for every row
    async fn reset_running(&self, now: i64) -> Result<usize>;

    /// Delete COMPLETED and CANCELLED rows last touched before `cutoff`
    async fn delete_finished_before(&self, cutoff: i64) -> Result<usize>;
}

/// Result of merging the remote record set into the local store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

/// The device's journal records, as far as the sync engine needs them
#[async_trait]
pub trait LocalRecordStore: Send + Sync {
    async fn get_record(&self, local_id: i64) -> Result<Option<JournalRecord>>;

    async fn remote_id_for(&self, local_id: i64) -> Result<Option<String>>;

    /// Store the remote id and media URLs assigned to a local record
    async fn apply_remote_state(
        &self,
        local_id: i64,
        remote_id: &str,
        image_urls: &[String],
        audio_url: Option<&str>,
    ) -> Result<()>;

    /// Make the local set match `remote` (remote is authoritative)
    async fn reconcile(&self, remote: &[RemoteRecord]) -> Result<ReconcileReport>;
}

/// Open a SQLite file, creating its directory, and apply the connection pragmas
pub(crate) fn open_connection(path: &Path, wal: bool, busy_timeout_ms: u64) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::storage(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let conn = Connection::open(path).map_err(|e| {
        SyncError::storage(format!("Failed to open database {}: {}", path.display(), e))
    })?;

    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

    if wal {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA temp_store = memory;",
        )
        .map_err(|e| SyncError::storage(format!("Failed to configure WAL: {}", e)))?;
    }

    Ok(conn)
}

/// `state IN (...)` clause for a fixed set of states
pub(crate) fn state_in(states: &[TaskState]) -> String {
    let list = states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("state IN ({})", list)
}
