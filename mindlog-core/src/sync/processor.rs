//! # Sync Processor
//!
//! Executes one [`SyncTask`] against the remote backend and object storage.
//!
//! The processor is stateless between calls. Every failure, including a missing
//! session, comes back as `Err`; the orchestrator only distinguishes success
//! from failure and schedules the retry.
//!
//! ## Object keys
//!
//! Attachments are stored under `<user_id>/<local_id>/<sha256 prefix>.<ext>`.
//! Re-uploading the same bytes after a retry overwrites the same object, and a
//! record delete removes everything below `<user_id>/<local_id>/`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{RemoteConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::media::{MediaPipeline, PreparedMedia};
use crate::remote::{ObjectStorage, RemoteBackend, Session, SessionProvider};
use crate::storage::LocalRecordStore;
use crate::types::{JournalRecord, RemoteRecord, SyncTask};

const KEY_HASH_LEN: usize = 16;

/// Executes a single task
#[async_trait]
pub trait SyncProcessor: Send + Sync {
    async fn run(&self, task: &SyncTask) -> Result<()>;
}

/// Settings of [`RecordSyncProcessor`]
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub bucket: String,
    /// Link uploaded objects by public URL instead of a signed one
    pub public_media: bool,
    pub signed_url_ttl: Duration,
    /// Re-encode images before upload
    pub upload_compression: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default(), &RemoteConfig::default())
    }
}

impl ProcessorOptions {
    pub fn from_config(sync: &SyncConfig, remote: &RemoteConfig) -> Self {
        Self {
            bucket: remote.media_bucket.clone(),
            public_media: remote.public_media,
            signed_url_ttl: remote.signed_url_ttl(),
            upload_compression: sync.upload_compression,
        }
    }
}

/// Default processor for journal record tasks
pub struct RecordSyncProcessor {
    backend: Arc<dyn RemoteBackend>,
    storage: Arc<dyn ObjectStorage>,
    sessions: Arc<dyn SessionProvider>,
    records: Arc<dyn LocalRecordStore>,
    media: Arc<dyn MediaPipeline>,
    options: ProcessorOptions,
}

impl std::fmt::Debug for RecordSyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSyncProcessor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Remote URLs of a record's attachments after upload
#[derive(Debug, Default)]
struct UploadedMedia {
    image_urls: Vec<String>,
    audio_url: Option<String>,
}

impl RecordSyncProcessor {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        storage: Arc<dyn ObjectStorage>,
        sessions: Arc<dyn SessionProvider>,
        records: Arc<dyn LocalRecordStore>,
        media: Arc<dyn MediaPipeline>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            backend,
            storage,
            sessions,
            records,
            media,
            options,
        }
    }

    async fn session(&self) -> Result<Session> {
        self.sessions
            .current_session()
            .await?
            .ok_or_else(|| SyncError::unauthenticated("no signed-in user"))
    }

    async fn create(&self, session: &Session, record: &JournalRecord) -> Result<()> {
        let media = self.upload_media(session, record).await?;
        let remote = RemoteRecord::from_journal(record, &session.user_id, media.image_urls, media.audio_url);

        // a retried create finds the row written by the attempt that timed out
        let stored = match self.backend.find_by_local_id(session, record.local_id).await? {
            Some(RemoteRecord { id: Some(remote_id), .. }) => {
                debug!("Record {} already exists remotely as {}", record.local_id, remote_id);
                self.backend.update_record(session, &remote_id, &remote).await?
            }
            _ => self.backend.create_record(session, &remote).await?,
        };

        self.write_back(record.local_id, &stored).await
    }

    async fn update(&self, session: &Session, record: &JournalRecord) -> Result<()> {
        let remote_id = match record.remote_id.clone() {
            Some(id) => Some(id),
            None => self.resolve_remote_id(session, record.local_id).await?,
        };
        let Some(remote_id) = remote_id else {
            debug!("Record {} has no remote row yet, creating", record.local_id);
            return self.create(session, record).await;
        };

        let media = self.upload_media(session, record).await?;
        let remote = RemoteRecord::from_journal(record, &session.user_id, media.image_urls, media.audio_url);

        let stored = match self.backend.update_record(session, &remote_id, &remote).await {
            Ok(stored) => stored,
            Err(SyncError::NotFound(_)) => {
                warn!(
                    "Remote row {} of record {} is gone, creating it again",
                    remote_id, record.local_id
                );
                let mut fresh = remote;
                fresh.id = None;
                self.backend.create_record(session, &fresh).await?
            }
            Err(e) => return Err(e),
        };

        self.write_back(record.local_id, &stored).await
    }

    async fn toggle_favorite(
        &self,
        session: &Session,
        local_id: i64,
        remote_id: Option<&str>,
        is_favorite: bool,
    ) -> Result<()> {
        let remote_id = match remote_id {
            Some(id) => Some(id.to_string()),
            None => self.resolve_remote_id(session, local_id).await?,
        };
        let remote_id = remote_id.ok_or_else(|| {
            SyncError::not_found(format!("remote row of record {} (create not synced yet)", local_id))
        })?;

        if !self.backend.set_favorite(session, &remote_id, is_favorite).await? {
            return Err(SyncError::not_found(format!("remote row {}", remote_id)));
        }
        debug!("Record {} favorite={}", local_id, is_favorite);
        Ok(())
    }

    async fn delete(&self, session: &Session, local_id: i64, remote_id: Option<&str>) -> Result<()> {
        let prefix = media_prefix(&session.user_id, local_id);
        let keys = self
            .storage
            .list(session, &self.options.bucket, &prefix)
            .await?;
        if !keys.is_empty() {
            self.storage
                .delete(session, &self.options.bucket, &keys)
                .await?;
            debug!("Deleted {} media object(s) of record {}", keys.len(), local_id);
        }

        let remote_id = match remote_id {
            Some(id) => Some(id.to_string()),
            None => self.resolve_remote_id(session, local_id).await?,
        };
        match remote_id {
            Some(remote_id) => {
                if !self.backend.delete_record(session, &remote_id).await? {
                    debug!("Remote row {} was already deleted", remote_id);
                }
            }
            None => debug!("Record {} never reached the backend", local_id),
        }
        Ok(())
    }

    async fn pull_all(&self, session: &Session) -> Result<()> {
        let remote = self.backend.fetch_all(session).await?;
        let report = self.records.reconcile(&remote).await?;
        info!(
            "Pulled {} remote record(s): {} inserted, {} updated, {} removed",
            remote.len(),
            report.inserted,
            report.updated,
            report.removed
        );
        Ok(())
    }

    /// Local store first, then the backend's row for this device's local id
    async fn resolve_remote_id(&self, session: &Session, local_id: i64) -> Result<Option<String>> {
        if let Some(id) = self.records.remote_id_for(local_id).await? {
            return Ok(Some(id));
        }
        Ok(self
            .backend
            .find_by_local_id(session, local_id)
            .await?
            .and_then(|row| row.id))
    }

    async fn write_back(&self, local_id: i64, stored: &RemoteRecord) -> Result<()> {
        let remote_id = stored
            .id
            .as_deref()
            .ok_or_else(|| SyncError::remote("backend returned a row without id"))?;
        self.records
            .apply_remote_state(
                local_id,
                remote_id,
                &stored.image_urls,
                stored.audio_url.as_deref(),
            )
            .await
    }

    async fn upload_media(&self, session: &Session, record: &JournalRecord) -> Result<UploadedMedia> {
        let mut uploaded = UploadedMedia::default();

        if record.image_paths.is_empty() {
            uploaded.image_urls = record.image_urls.clone();
        }
        for path in &record.image_paths {
            if is_remote_url(path) {
                uploaded.image_urls.push(path.clone());
                continue;
            }
            let prepared = self
                .media
                .prepare_image(Path::new(path), self.options.upload_compression)
                .await;
            if let Some(url) = self.upload_prepared(session, record.local_id, path, prepared).await? {
                uploaded.image_urls.push(url);
            }
        }

        uploaded.audio_url = match &record.audio_path {
            Some(path) if is_remote_url(path) => Some(path.clone()),
            Some(path) => {
                let prepared = self.media.read_file(Path::new(path)).await;
                self.upload_prepared(session, record.local_id, path, prepared)
                    .await?
                    .or_else(|| record.audio_url.clone())
            }
            None => record.audio_url.clone(),
        };

        Ok(uploaded)
    }

    /// Upload one attachment; `None` when its file no longer exists
    async fn upload_prepared(
        &self,
        session: &Session,
        local_id: i64,
        path: &str,
        prepared: Result<PreparedMedia>,
    ) -> Result<Option<String>> {
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(SyncError::NotFound(_)) => {
                warn!("Attachment {} of record {} is missing, skipping", path, local_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let key = object_key(&session.user_id, local_id, &prepared.bytes, &prepared.extension);
        self.storage
            .upload(
                session,
                &self.options.bucket,
                &key,
                prepared.bytes,
                &prepared.content_type,
                true,
            )
            .await?;

        let url = if self.options.public_media {
            self.storage.public_url(&self.options.bucket, &key)
        } else {
            self.storage
                .signed_url(session, &self.options.bucket, &key, self.options.signed_url_ttl)
                .await?
        };
        Ok(Some(url))
    }
}

#[async_trait]
impl SyncProcessor for RecordSyncProcessor {
    async fn run(&self, task: &SyncTask) -> Result<()> {
        let session = self.session().await?;
        match task {
            SyncTask::CreateRecord { record, .. } => self.create(&session, record).await,
            SyncTask::UpdateRecord { record, .. } => self.update(&session, record).await,
            SyncTask::ToggleFavorite {
                local_id,
                remote_id,
                is_favorite,
                ..
            } => {
                self.toggle_favorite(&session, *local_id, remote_id.as_deref(), *is_favorite)
                    .await
            }
            SyncTask::DeleteRecord {
                local_id, remote_id, ..
            } => self.delete(&session, *local_id, remote_id.as_deref()).await,
            SyncTask::PullAll { .. } => self.pull_all(&session).await,
        }
    }
}

fn is_remote_url(path: &str) -> bool {
    path.starts_with("https://") || path.starts_with("http://")
}

/// Folder holding every object of one record
pub fn media_prefix(user_id: &str, local_id: i64) -> String {
    format!("{}/{}/", user_id, local_id)
}

/// Content-addressed key of an attachment
pub fn object_key(user_id: &str, local_id: i64, bytes: &[u8], extension: &str) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!(
        "{}{}.{}",
        media_prefix(user_id, local_id),
        &digest[..KEY_HASH_LEN],
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StaticSession;
    use crate::storage::RecordDb;
    use crate::test::mocks::{MockMediaPipeline, MockObjectStorage, MockRemoteBackend};

    struct Fixture {
        backend: Arc<MockRemoteBackend>,
        storage: Arc<MockObjectStorage>,
        records: Arc<RecordDb>,
        processor: RecordSyncProcessor,
    }

    fn fixture_with(session: StaticSession, options: ProcessorOptions) -> Fixture {
        let backend = Arc::new(MockRemoteBackend::new());
        let storage = Arc::new(MockObjectStorage::new());
        let records = Arc::new(RecordDb::open_in_memory().unwrap());
        let processor = RecordSyncProcessor::new(
            backend.clone(),
            storage.clone(),
            Arc::new(session),
            records.clone(),
            Arc::new(MockMediaPipeline::new()),
            options,
        );
        Fixture {
            backend,
            storage,
            records,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            StaticSession::new(Session::new("user-1", "token")),
            ProcessorOptions {
                public_media: true,
                ..Default::default()
            },
        )
    }

    fn stored_record(records: &RecordDb, local_id: i64, title: &str) -> JournalRecord {
        let record = JournalRecord::new(local_id, title, "body");
        records.upsert_record(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_missing_session_fails() {
        let f = fixture_with(StaticSession::signed_out(), ProcessorOptions::default());
        let err = f.processor.run(&SyncTask::pull_all()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthenticated(_)));
        f.backend.tracker().assert_not_called("fetch_all");
    }

    #[tokio::test]
    async fn test_create_uploads_media_and_writes_back() {
        let f = fixture();
        let record = stored_record(&f.records, 1, "Walk")
            .with_image("/photos/river.jpg")
            .with_image("/photos/missing.jpg")
            .with_audio("/audio/note.m4a");

        f.processor
            .run(&SyncTask::create_record(record.clone()))
            .await
            .unwrap();

        // the missing file is skipped
        assert_eq!(f.storage.keys().len(), 2);
        let rows = f.backend.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].image_urls.len(), 1);
        assert!(rows[0].image_urls[0].contains(&format!("user-1/{}/", record.local_id)));
        assert!(rows[0].audio_url.is_some());

        let local = f.records.get_record(record.local_id).await.unwrap().unwrap();
        assert_eq!(local.remote_id, rows[0].id);
        assert_eq!(local.image_urls, rows[0].image_urls);
    }

    #[tokio::test]
    async fn test_retried_create_is_idempotent() {
        let f = fixture();
        let record = stored_record(&f.records, 2, "Once");
        let task = SyncTask::create_record(record);

        f.processor.run(&task).await.unwrap();
        f.processor.run(&task).await.unwrap();

        assert_eq!(f.backend.rows().len(), 1);
        f.backend.tracker().assert_call_count("create_record", 1);
        f.backend.tracker().assert_call_count("update_record", 1);
    }

    #[tokio::test]
    async fn test_update_without_remote_row_creates() {
        let f = fixture();
        let record = stored_record(&f.records, 3, "Draft");

        f.processor
            .run(&SyncTask::update_record(record.clone()))
            .await
            .unwrap();
        f.backend.tracker().assert_call_count("create_record", 1);

        let mut edited = f.records.get_record(record.local_id).await.unwrap().unwrap();
        edited.title = "Final".to_string();
        f.processor
            .run(&SyncTask::update_record(edited))
            .await
            .unwrap();

        let rows = f.backend.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Final");
    }

    #[tokio::test]
    async fn test_favorite_before_create_fails() {
        let f = fixture();
        let record = stored_record(&f.records, 4, "Soon");
        let task = SyncTask::toggle_favorite(record.local_id, None, true);

        assert!(matches!(
            f.processor.run(&task).await,
            Err(SyncError::NotFound(_))
        ));

        f.processor
            .run(&SyncTask::create_record(record))
            .await
            .unwrap();
        f.processor.run(&task).await.unwrap();
        assert!(f.backend.rows()[0].is_favorite);
    }

    #[tokio::test]
    async fn test_delete_removes_media_then_row() {
        let f = fixture();
        let record = stored_record(&f.records, 5, "Gone").with_image("/photos/a.jpg");
        f.processor
            .run(&SyncTask::create_record(record.clone()))
            .await
            .unwrap();
        assert_eq!(f.storage.keys().len(), 1);

        let remote_id = f.backend.rows()[0].id.clone();
        f.processor
            .run(&SyncTask::delete_record(record.local_id, remote_id))
            .await
            .unwrap();
        assert!(f.storage.keys().is_empty());
        assert!(f.backend.rows().is_empty());

        // already gone
        f.processor
            .run(&SyncTask::delete_record(record.local_id, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pull_all_reconciles() {
        let f = fixture();
        f.backend.insert_row(RemoteRecord {
            id: Some("remote-1".to_string()),
            user_id: "user-1".to_string(),
            local_id: 500,
            title: "From tablet".to_string(),
            content: String::new(),
            mood: None,
            tags: vec![],
            image_urls: vec![],
            audio_url: None,
            is_favorite: false,
            created_at: 1,
            updated_at: 1,
        });

        f.processor.run(&SyncTask::pull_all()).await.unwrap();
        let local = f.records.list_records().unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].remote_id.as_deref(), Some("remote-1"));
    }

    #[tokio::test]
    async fn test_remote_failure_is_error() {
        let f = fixture();
        f.backend.fail_next("503 Service Unavailable");
        let record = stored_record(&f.records, 6, "Flaky");
        assert!(matches!(
            f.processor.run(&SyncTask::create_record(record)).await,
            Err(SyncError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_urls_when_media_is_private() {
        let f = fixture_with(
            StaticSession::new(Session::new("user-1", "token")),
            ProcessorOptions {
                public_media: false,
                ..Default::default()
            },
        );
        let record = stored_record(&f.records, 7, "Private").with_image("/photos/a.jpg");
        f.processor
            .run(&SyncTask::create_record(record))
            .await
            .unwrap();
        assert!(f.backend.rows()[0].image_urls[0].contains("token="));
    }

    #[test]
    fn test_object_key_is_content_addressed() {
        let a = object_key("u", 3, b"same bytes", "jpg");
        let b = object_key("u", 3, b"same bytes", "jpg");
        let c = object_key("u", 3, b"other bytes", "jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("u/3/"));
        assert!(a.ends_with(".jpg"));
        assert_eq!(a.len(), "u/3/".len() + KEY_HASH_LEN + ".jpg".len());
    }
}
