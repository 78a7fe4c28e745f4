//! # Remote Backend
//!
//! Seams between the sync processor and the hosted backend.
//!
//! - [`RemoteBackend`]: journal record rows (system of record)
//! - [`ObjectStorage`]: uploaded images and voice notes
//! - [`SessionProvider`]: the signed-in user, if any
//!
//! `http` and `storage` hold the default PostgREST-style implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::types::RemoteRecord;

pub mod http;
pub mod storage;

pub use http::{ApiClient, HttpRemoteBackend};
pub use storage::HttpObjectStorage;

/// Authenticated session used for every remote call
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

/// Source of the current session
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// `None` when nobody is signed in
    async fn current_session(&self) -> Result<Option<Session>>;
}

/// Fixed session, e.g. from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    session: Option<Session>,
}

impl StaticSession {
    pub fn new(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        match (&config.user_id, &config.access_token) {
            (Some(user_id), Some(token)) => Self::new(Session::new(user_id, token)),
            _ => Self::signed_out(),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_session(&self) -> Result<Option<Session>> {
        Ok(self.session.clone())
    }
}

/// Journal record rows on the backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a row; returns it with its assigned id
    async fn create_record(&self, session: &Session, record: &RemoteRecord) -> Result<RemoteRecord>;

    async fn update_record(
        &self,
        session: &Session,
        remote_id: &str,
        record: &RemoteRecord,
    ) -> Result<RemoteRecord>;

    /// Returns `false` when no row has `remote_id`
    async fn set_favorite(&self, session: &Session, remote_id: &str, is_favorite: bool)
        -> Result<bool>;

    /// Returns `false` when the row was already gone
    async fn delete_record(&self, session: &Session, remote_id: &str) -> Result<bool>;

    /// Row created from this device's `local_id`, if any
    async fn find_by_local_id(&self, session: &Session, local_id: i64)
        -> Result<Option<RemoteRecord>>;

    /// Every row of the session's user
    async fn fetch_all(&self, session: &Session) -> Result<Vec<RemoteRecord>>;
}

/// Blob storage for record attachments
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;

    /// Delete `keys`; missing objects are ignored
    async fn delete(&self, session: &Session, bucket: &str, keys: &[String]) -> Result<()>;

    /// Full keys of the objects below `prefix`
    async fn list(&self, session: &Session, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn signed_url(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String>;

    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Record backend and object storage over one shared HTTP client
pub fn http_clients(
    config: &RemoteConfig,
) -> Result<(Arc<dyn RemoteBackend>, Arc<dyn ObjectStorage>)> {
    let client = ApiClient::from_config(config)?;
    let backend = HttpRemoteBackend::new(client.clone(), config.records_table.clone());
    let storage = HttpObjectStorage::new(client);
    Ok((Arc::new(backend), Arc::new(storage)))
}
