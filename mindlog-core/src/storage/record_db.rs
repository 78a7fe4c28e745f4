//! 日记记录数据库
//!
//! The device-side copy of journal records. The UI writes here first; the sync
//! engine only writes back what the remote assigned (ids, media URLs) and the
//! result of a full refresh.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{open_connection, LocalRecordStore, ReconcileReport};
use crate::config::StorageConfig;
use crate::error::{Result, SyncError};
use crate::types::{JournalRecord, RemoteRecord};

const COLUMNS: &str = "local_id, remote_id, title, content, mood, tags, image_paths, \
                       image_urls, audio_path, audio_url, is_favorite, created_at, updated_at";

/// 日记记录数据库
pub struct RecordDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for RecordDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RecordDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, true, StorageConfig::default().busy_timeout_ms)
    }

    pub fn open_from_config(config: &StorageConfig) -> Result<Self> {
        Self::open_with(&config.records_db_path(), config.wal_enabled, config.busy_timeout_ms)
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

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::storage("record database mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS journal_records (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id TEXT UNIQUE,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                mood INTEGER,
                tags TEXT NOT NULL DEFAULT '[]',
                image_paths TEXT NOT NULL DEFAULT '[]',
                image_urls TEXT NOT NULL DEFAULT '[]',
                audio_path TEXT,
                audio_url TEXT,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_records_updated ON journal_records(updated_at);",
        )
        .map_err(|e| SyncError::storage(format!("Failed to create journal_records table: {}", e)))?;
        Ok(())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JournalRecord> {
        Ok(JournalRecord {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            mood: row.get(4)?,
            tags: json_list(row, 5)?,
            image_paths: json_list(row, 6)?,
            image_urls: json_list(row, 7)?,
            audio_path: row.get(8)?,
            audio_url: row.get(9)?,
            is_favorite: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    /// Insert or overwrite a record (UI write path)
    pub fn upsert_record(&self, record: &JournalRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO journal_records
                (local_id, remote_id, title, content, mood, tags, image_paths, image_urls,
                 audio_path, audio_url, is_favorite, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                title = excluded.title,
                content = excluded.content,
                mood = excluded.mood,
                tags = excluded.tags,
                image_paths = excluded.image_paths,
                image_urls = excluded.image_urls,
                audio_path = excluded.audio_path,
                audio_url = excluded.audio_url,
                is_favorite = excluded.is_favorite,
                updated_at = excluded.updated_at",
            params![
                record.local_id,
                record.remote_id,
                record.title,
                record.content,
                record.mood,
                serde_json::to_string(&record.tags)?,
                serde_json::to_string(&record.image_paths)?,
                serde_json::to_string(&record.image_urls)?,
                record.audio_path,
                record.audio_url,
                record.is_favorite,
                record.created_at,
                record.updated_at,
            ],
        )
        .map_err(|e| {
            SyncError::storage(format!("Failed to save record {}: {}", record.local_id, e))
        })?;
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn delete_record(&self, local_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM journal_records WHERE local_id = ?1",
            params![local_id],
        )?;
        Ok(deleted > 0)
    }

    /// All records, newest first
    pub fn list_records(&self) -> Result<Vec<JournalRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM journal_records ORDER BY created_at DESC, local_id DESC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load(conn: &Connection, local_id: i64) -> Result<Option<JournalRecord>> {
        let sql = format!("SELECT {} FROM journal_records WHERE local_id = ?1", COLUMNS);
        Ok(conn
            .query_row(&sql, params![local_id], Self::row_to_record)
            .optional()?)
    }
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl LocalRecordStore for RecordDb {
    async fn get_record(&self, local_id: i64) -> Result<Option<JournalRecord>> {
        let conn = self.conn()?;
        Self::load(&conn, local_id)
    }

    async fn remote_id_for(&self, local_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let remote_id: Option<Option<String>> = conn
            .query_row(
                "SELECT remote_id FROM journal_records WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remote_id.flatten())
    }

    async fn apply_remote_state(
        &self,
        local_id: i64,
        remote_id: &str,
        image_urls: &[String],
        audio_url: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE journal_records SET remote_id = ?1, image_urls = ?2, audio_url = ?3
                 WHERE local_id = ?4",
                params![remote_id, serde_json::to_string(image_urls)?, audio_url, local_id],
            )
            .map_err(|e| {
                SyncError::storage(format!(
                    "Failed to store remote state of record {}: {}",
                    local_id, e
                ))
            })?;
        if changed == 0 {
            // deleted locally while the upload was in flight
            debug!("Record {} no longer exists locally, remote id {} not stored", local_id, remote_id);
        }
        Ok(())
    }

    async fn reconcile(&self, remote: &[RemoteRecord]) -> Result<ReconcileReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(remote.len());

        for record in remote {
            let Some(remote_id) = record.id.as_deref() else {
                continue;
            };
            seen.insert(remote_id.to_string());

            let tags = serde_json::to_string(&record.tags)?;
            let image_urls = serde_json::to_string(&record.image_urls)?;

            let updated = tx.execute(
                "UPDATE journal_records SET
                    title = ?1, content = ?2, mood = ?3, tags = ?4, image_urls = ?5,
                    audio_url = ?6, is_favorite = ?7, created_at = ?8, updated_at = ?9
                 WHERE remote_id = ?10",
                params![
                    record.title,
                    record.content,
                    record.mood,
                    tags,
                    image_urls,
                    record.audio_url,
                    record.is_favorite,
                    record.created_at,
                    record.updated_at,
                    remote_id,
                ],
            )?;
            if updated > 0 {
                report.updated += 1;
                continue;
            }

            // created here but the remote id was never written back
            let linked = tx.execute(
                "UPDATE journal_records SET
                    remote_id = ?1, title = ?2, content = ?3, mood = ?4, tags = ?5,
                    image_urls = ?6, audio_url = ?7, is_favorite = ?8, updated_at = ?9
                 WHERE local_id = ?10 AND remote_id IS NULL AND created_at = ?11",
                params![
                    remote_id,
                    record.title,
                    record.content,
                    record.mood,
                    tags,
                    image_urls,
                    record.audio_url,
                    record.is_favorite,
                    record.updated_at,
                    record.local_id,
                    record.created_at,
                ],
            )?;
            if linked > 0 {
                report.updated += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO journal_records
                    (remote_id, title, content, mood, tags, image_paths, image_urls,
                     audio_path, audio_url, is_favorite, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, NULL, ?7, ?8, ?9, ?10)",
                params![
                    remote_id,
                    record.title,
                    record.content,
                    record.mood,
                    tags,
                    image_urls,
                    record.audio_url,
                    record.is_favorite,
                    record.created_at,
                    record.updated_at,
                ],
            )?;
            report.inserted += 1;
        }

        let stale: Vec<(i64, String)> = {
            let mut stmt =
                tx.prepare("SELECT local_id, remote_id FROM journal_records WHERE remote_id IS NOT NULL")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|(_, remote_id)| !seen.contains(remote_id))
                .collect()
        };
        for (local_id, _) in &stale {
            tx.execute("DELETE FROM journal_records WHERE local_id = ?1", params![local_id])?;
        }
        report.removed = stale.len();

        tx.commit()?;
        Ok(report)
    }
}
