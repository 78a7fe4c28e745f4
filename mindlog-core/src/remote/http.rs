//! PostgREST-style record API over reqwest.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{RemoteBackend, Session};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::types::RemoteRecord;

/// Shared HTTP client carrying the backend base URL and API key
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(SyncError::configuration("remote.base_url is not set"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::new(config.base(), config.api_key.clone(), client))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request with `apikey` and bearer authorization set
    pub fn request(&self, method: Method, url: &str, session: &Session) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
    }
}

/// Turn a non-success response into an error
pub(crate) async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(status, what, &body))
}

pub(crate) fn status_error(status: StatusCode, what: &str, body: &str) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::unauthenticated(format!("{} rejected ({}): {}", what, status, body))
        }
        _ => SyncError::remote(format!("{} failed ({}): {}", what, status, body)),
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::remote(format!("Failed to parse {} response: {}", what, e)))
}

/// Journal rows in `{base_url}/rest/v1/{table}`
#[derive(Debug, Clone)]
pub struct HttpRemoteBackend {
    api: ApiClient,
    table: String,
}

impl HttpRemoteBackend {
    pub fn new(api: ApiClient, table: impl Into<String>) -> Self {
        Self {
            api,
            table: table.into(),
        }
    }

    fn table_url(&self) -> String {
        table_url(self.api.base_url(), &self.table)
    }

    /// Write returning the affected rows
    async fn write(
        &self,
        method: Method,
        session: &Session,
        filter: Option<(&str, String)>,
        body: &serde_json::Value,
        what: &str,
    ) -> Result<Vec<RemoteRecord>> {
        let mut request = self
            .api
            .request(method, &self.table_url(), session)
            .header("Prefer", "return=representation")
            .json(body);
        if let Some((column, value)) = filter {
            request = request.query(&[(column, eq(&value))]);
        }
        let response = check_status(request.send().await?, what).await?;
        read_json(response, what).await
    }
}

fn table_url(base: &str, table: &str) -> String {
    format!("{}/rest/v1/{}", base, table)
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn create_record(&self, session: &Session, record: &RemoteRecord) -> Result<RemoteRecord> {
        let mut body = serde_json::to_value(record)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("id");
        }
        let rows = self
            .write(Method::POST, session, None, &body, "create record")
            .await?;
        let created = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::remote("create record returned no row"))?;
        debug!("Created remote record {:?} for local {}", created.id, created.local_id);
        Ok(created)
    }

    async fn update_record(
        &self,
        session: &Session,
        remote_id: &str,
        record: &RemoteRecord,
    ) -> Result<RemoteRecord> {
        let mut body = serde_json::to_value(record)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("id");
        }
        let rows = self
            .write(
                Method::PATCH,
                session,
                Some(("id", remote_id.to_string())),
                &body,
                "update record",
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::not_found(format!("remote record {}", remote_id)))
    }

    async fn set_favorite(
        &self,
        session: &Session,
        remote_id: &str,
        is_favorite: bool,
    ) -> Result<bool> {
        let rows = self
            .write(
                Method::PATCH,
                session,
                Some(("id", remote_id.to_string())),
                &serde_json::json!({ "is_favorite": is_favorite }),
                "set favorite",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn delete_record(&self, session: &Session, remote_id: &str) -> Result<bool> {
        let response = self
            .api
            .request(Method::DELETE, &self.table_url(), session)
            .header("Prefer", "return=representation")
            .query(&[("id", eq(remote_id))])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = check_status(response, "delete record").await?;
        let rows: Vec<RemoteRecord> = read_json(response, "delete record").await?;
        Ok(!rows.is_empty())
    }

    async fn find_by_local_id(
        &self,
        session: &Session,
        local_id: i64,
    ) -> Result<Option<RemoteRecord>> {
        let response = self
            .api
            .request(Method::GET, &self.table_url(), session)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", eq(&session.user_id)),
                ("local_id", eq(&local_id.to_string())),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let response = check_status(response, "find record").await?;
        let rows: Vec<RemoteRecord> = read_json(response, "find record").await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_all(&self, session: &Session) -> Result<Vec<RemoteRecord>> {
        let response = self
            .api
            .request(Method::GET, &self.table_url(), session)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", eq(&session.user_id)),
                ("order", "created_at.desc".to_string()),
            ])
            .send()
            .await?;
        let response = check_status(response, "fetch records").await?;
        read_json(response, "fetch records").await
    }
}
