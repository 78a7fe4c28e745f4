//! # Mock Remote Backend and Object Storage

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::MockCallTracker;
use crate::error::{Result, SyncError};
use crate::remote::{ObjectStorage, RemoteBackend, Session};
use crate::types::RemoteRecord;

/// In-memory record table
#[derive(Debug, Clone, Default)]
pub struct MockRemoteBackend {
    rows: Arc<Mutex<Vec<RemoteRecord>>>,
    next_id: Arc<AtomicU64>,
    fail_next: Arc<Mutex<Option<String>>>,
    tracker: MockCallTracker,
}

impl MockRemoteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    /// Snapshot of all rows
    pub fn rows(&self) -> Vec<RemoteRecord> {
        self.rows.lock().unwrap().clone()
    }

    /// Seed a row as if another device had written it
    pub fn insert_row(&self, row: RemoteRecord) {
        self.rows.lock().unwrap().push(row);
    }

    /// 设置下次调用失败
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap() = Some(message.into());
    }

    fn enter(&self, method: &str, args: Vec<String>) -> Result<()> {
        self.tracker.record(method, args);
        match self.fail_next.lock().unwrap().take() {
            Some(message) => Err(SyncError::remote(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for MockRemoteBackend {
    async fn create_record(&self, session: &Session, record: &RemoteRecord) -> Result<RemoteRecord> {
        self.enter("create_record", vec![record.local_id.to_string()])?;
        let mut row = record.clone();
        row.user_id = session.user_id.clone();
        row.id = Some(format!("remote-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update_record(
        &self,
        _session: &Session,
        remote_id: &str,
        record: &RemoteRecord,
    ) -> Result<RemoteRecord> {
        self.enter("update_record", vec![remote_id.to_string()])?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id.as_deref() == Some(remote_id))
            .ok_or_else(|| SyncError::not_found(format!("remote record {}", remote_id)))?;
        let id = row.id.clone();
        *row = record.clone();
        row.id = id;
        Ok(row.clone())
    }

    async fn set_favorite(&self, _session: &Session, remote_id: &str, is_favorite: bool) -> Result<bool> {
        self.enter("set_favorite", vec![remote_id.to_string(), is_favorite.to_string()])?;
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|r| r.id.as_deref() == Some(remote_id)) {
            Some(row) => {
                row.is_favorite = is_favorite;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_record(&self, _session: &Session, remote_id: &str) -> Result<bool> {
        self.enter("delete_record", vec![remote_id.to_string()])?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| r.id.as_deref() != Some(remote_id));
        Ok(rows.len() != before)
    }

    async fn find_by_local_id(&self, session: &Session, local_id: i64) -> Result<Option<RemoteRecord>> {
        self.enter("find_by_local_id", vec![local_id.to_string()])?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == session.user_id && r.local_id == local_id)
            .cloned())
    }

    async fn fetch_all(&self, session: &Session) -> Result<Vec<RemoteRecord>> {
        self.enter("fetch_all", vec![])?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == session.user_id)
            .cloned()
            .collect())
    }
}

/// In-memory buckets, keyed by `bucket/key`
#[derive(Debug, Clone, Default)]
pub struct MockObjectStorage {
    objects: Arc<Mutex<BTreeMap<(String, String), Vec<u8>>>>,
    tracker: MockCallTracker,
}

impl MockObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    /// Keys of every stored object, any bucket
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn upload(
        &self,
        _session: &Session,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        self.tracker
            .record("upload", vec![key.to_string(), content_type.to_string()]);
        let mut objects = self.objects.lock().unwrap();
        let slot = (bucket.to_string(), key.to_string());
        if !upsert && objects.contains_key(&slot) {
            return Err(SyncError::remote(format!("object {} already exists", key)));
        }
        objects.insert(slot, bytes);
        Ok(())
    }

    async fn delete(&self, _session: &Session, bucket: &str, keys: &[String]) -> Result<()> {
        self.tracker.record("delete", keys.to_vec());
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(())
    }

    async fn list(&self, _session: &Session, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.tracker.record("list", vec![prefix.to_string()]);
        let folder = format!("{}/", prefix.trim_matches('/'));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(&folder))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn signed_url(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String> {
        self.tracker.record("signed_url", vec![key.to_string()]);
        Ok(format!(
            "https://storage.mock/sign/{}/{}?token={}&expires={}",
            bucket,
            key,
            session.user_id,
            ttl.as_secs()
        ))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("https://storage.mock/public/{}/{}", bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("user-1", "token")
    }

    #[tokio::test]
    async fn test_backend_failure_is_one_shot() {
        let backend = MockRemoteBackend::new();
        backend.fail_next("boom");
        assert!(backend.fetch_all(&session()).await.is_err());
        assert!(backend.fetch_all(&session()).await.is_ok());
        backend.tracker().assert_call_count("fetch_all", 2);
    }

    #[tokio::test]
    async fn test_storage_list_is_scoped_to_folder() {
        let storage = MockObjectStorage::new();
        for key in ["user-1/1/a.jpg", "user-1/10/b.jpg", "user-1/1/c.m4a"] {
            storage
                .upload(&session(), "media", key, vec![1], "image/jpeg", true)
                .await
                .unwrap();
        }
        let mut listed = storage.list(&session(), "media", "user-1/1/").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["user-1/1/a.jpg", "user-1/1/c.m4a"]);
    }
}
