//! 同步任务数据库
//!
//! Durable rows of the sync queue. One row per task id; the `revision` column
//! is bumped every time the same id is enqueued again so that an orchestrator
//! holding a stale copy can never overwrite the newer row. `seq` is assigned on
//! first insert and breaks ties between rows due at the same millisecond, so due
//! order follows submission order.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{open_connection, state_in, AttemptUpdate, DueFilter, NewTaskRow, TaskStore};
use crate::config::StorageConfig;
use crate::error::{Result, SyncError};
use crate::types::{SyncTaskEntity, TaskKind, TaskState};

const COLUMNS: &str = "id, task_type, payload, state, attempt_count, next_run_at, \
                       created_at, updated_at, local_id, revision, last_error";

/// 同步任务数据库
pub struct TaskDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for TaskDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TaskDb {
    /// 打开任务数据库 (WAL)
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, true, StorageConfig::default().busy_timeout_ms)
    }

    /// Open the queue database described by the storage configuration
    pub fn open_from_config(config: &StorageConfig) -> Result<Self> {
        Self::open_with(&config.queue_db_path(), config.wal_enabled, config.busy_timeout_ms)
    }

    fn open_with(path: &Path, wal: bool, busy_timeout_ms: u64) -> Result<Self> {
        let conn = open_connection(path, wal, busy_timeout_ms)?;
        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::storage("task database mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_run_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                local_id INTEGER,
                revision INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                seq INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_due ON sync_tasks(state, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_local_id ON sync_tasks(local_id);",
        )
        .map_err(|e| SyncError::storage(format!("Failed to create sync_tasks table: {}", e)))?;

        // 迁移：旧库没有 seq 列，补上并按插入顺序回填
        let _ = conn.execute("ALTER TABLE sync_tasks ADD COLUMN seq INTEGER", []);
        conn.execute("UPDATE sync_tasks SET seq = rowid WHERE seq IS NULL", [])
            .map_err(|e| SyncError::storage(format!("Failed to backfill task order: {}", e)))?;
        Ok(())
    }

    fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<SyncTaskEntity> {
        Ok(SyncTaskEntity {
            id: row.get(0)?,
            task_type: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempt_count: row.get(4)?,
            next_run_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            local_id: row.get(8)?,
            revision: row.get(9)?,
            last_error: row.get(10)?,
        })
    }
}

#[async_trait]
impl TaskStore for TaskDb {
    async fn upsert_pending(&self, row: NewTaskRow<'_>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_tasks
                (id, task_type, payload, state, attempt_count, next_run_at,
                 created_at, updated_at, local_id, revision, last_error, seq)
             VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?4, ?4, ?5, 1, NULL,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_tasks))
             ON CONFLICT(id) DO UPDATE SET
                task_type = excluded.task_type,
                payload = excluded.payload,
                state = 'PENDING',
                attempt_count = 0,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at,
                local_id = excluded.local_id,
                revision = sync_tasks.revision + 1,
                last_error = NULL",
            params![row.id, row.task_type, row.payload, row.now, row.local_id],
        )
        .map_err(|e| SyncError::storage(format!("Failed to enqueue task {}: {}", row.id, e)))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncTaskEntity>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM sync_tasks WHERE id = ?1", COLUMNS);
        let entity = conn
            .query_row(&sql, params![id], Self::row_to_entity)
            .optional()
            .map_err(|e| SyncError::storage(format!("Failed to load task {}: {}", id, e)))?;
        Ok(entity)
    }

    async fn due(&self, now: i64, limit: usize, filter: DueFilter) -> Result<Vec<SyncTaskEntity>> {
        let conn = self.conn()?;
        let mut sql = format!(
            "SELECT {} FROM sync_tasks AS t
             WHERE t.state = 'PENDING' AND t.next_run_at <= ?1",
            COLUMNS
        );
        if filter.first_attempt_only {
            sql.push_str(" AND t.attempt_count = 0");
        }
        if filter.entity_heads_only {
            sql.push_str(
                " AND (t.local_id IS NULL OR NOT EXISTS (
                    SELECT 1 FROM sync_tasks AS e
                    WHERE e.local_id = t.local_id
                      AND e.state IN ('PENDING', 'RUNNING')
                      AND e.seq < t.seq))",
            );
        }
        sql.push_str(" ORDER BY t.next_run_at ASC, t.created_at ASC, t.seq ASC LIMIT ?2");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now, limit as i64], Self::row_to_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SyncError::storage(format!("Failed to read due tasks: {}", e)))?;
        Ok(rows)
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<SyncTaskEntity>> {
        let conn = self.conn()?;
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {} FROM sync_tasks WHERE state = ?1
                     ORDER BY next_run_at ASC, created_at ASC, seq ASC LIMIT ?2",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![state, limit as i64], Self::row_to_entity)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM sync_tasks ORDER BY next_run_at ASC, created_at ASC, seq ASC LIMIT ?1",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit as i64], Self::row_to_entity)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    async fn transition(
        &self,
        id: &str,
        from: &[TaskState],
        to: TaskState,
        revision: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE sync_tasks SET state = ?1, updated_at = ?2
             WHERE id = ?3 AND {} AND (?4 IS NULL OR revision = ?4)",
            state_in(from)
        );
        let changed = conn
            .execute(&sql, params![to, now, id, revision])
            .map_err(|e| {
                SyncError::storage(format!("Failed to move task {} to {}: {}", id, to, e))
            })?;
        Ok(changed > 0)
    }

    async fn record_attempt(
        &self,
        id: &str,
        from: &[TaskState],
        revision: Option<i64>,
        update: AttemptUpdate<'_>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE sync_tasks SET
                state = ?1,
                attempt_count = ?2,
                next_run_at = MAX(next_run_at, ?3),
                last_error = ?4,
                updated_at = ?5
             WHERE id = ?6 AND {} AND (?7 IS NULL OR revision = ?7)",
            state_in(from)
        );
        let changed = conn
            .execute(
                &sql,
                params![
                    update.state,
                    update.attempt_count,
                    update.next_run_at,
                    update.error,
                    update.now,
                    id,
                    revision
                ],
            )
            .map_err(|e| SyncError::storage(format!("Failed to reschedule task {}: {}", id, e)))?;
        Ok(changed > 0)
    }

    async fn cancel_for_local_id(&self, local_id: i64, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE sync_tasks SET state = 'CANCELLED', updated_at = ?1
                 WHERE local_id = ?2 AND state IN ('PENDING', 'RUNNING')",
                params![now, local_id],
            )
            .map_err(|e| {
                SyncError::storage(format!("Failed to cancel tasks of record {}: {}", local_id, e))
            })?;
        Ok(changed)
    }

    async fn count(&self, state: TaskState) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_tasks WHERE state = ?1",
            params![state],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn reset_running(&self, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_tasks SET state = 'PENDING', updated_at = ?1 WHERE state = 'RUNNING'",
            params![now],
        )?;
        Ok(changed)
    }

    async fn delete_finished_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM sync_tasks
                 WHERE state IN ('COMPLETED', 'CANCELLED') AND updated_at < ?1",
                params![cutoff],
            )
            .map_err(|e| SyncError::storage(format!("Failed to clean up tasks: {}", e)))?;
        Ok(deleted)
    }
}

impl ToSql for TaskState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: SyncError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for TaskKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: SyncError| FromSqlError::Other(Box::new(e)))
    }
}
