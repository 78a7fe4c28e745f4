//! Object storage over `{base_url}/storage/v1`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::http::{check_status, read_json, ApiClient};
use super::{ObjectStorage, Session};
use crate::error::{Result, SyncError};

const LIST_PAGE_SIZE: usize = 1000;

/// Bucket storage speaking the storage REST dialect
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    /// `null` for folders
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl HttpObjectStorage {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.api.base_url(), path)
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("object/{}/{}", bucket, key.trim_start_matches('/'))
}

fn folder(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        let size = bytes.len();
        let response = self
            .api
            .request(Method::POST, &self.url(&object_path(bucket, key)), session)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        check_status(response, "upload object").await?;
        debug!("Uploaded {} bytes to {}/{}", size, bucket, key);
        Ok(())
    }

    async fn delete(&self, session: &Session, bucket: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let response = self
            .api
            .request(Method::DELETE, &self.url(&format!("object/{}", bucket)), session)
            .json(&serde_json::json!({ "prefixes": keys }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete objects").await?;
        debug!("Deleted {} object(s) from {}", keys.len(), bucket);
        Ok(())
    }

    async fn list(&self, session: &Session, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let folder = folder(prefix);
        let mut keys = Vec::new();
        let mut offset = 0;
        loop {
            let response = self
                .api
                .request(Method::POST, &self.url(&format!("object/list/{}", bucket)), session)
                .json(&serde_json::json!({
                    "prefix": folder,
                    "limit": LIST_PAGE_SIZE,
                    "offset": offset,
                }))
                .send()
                .await?;
            let response = check_status(response, "list objects").await?;
            let page: Vec<ListedObject> = read_json(response, "list objects").await?;
            let page_len = page.len();

            keys.extend(
                page.into_iter()
                    .filter(|object| object.id.is_some())
                    .map(|object| format!("{}/{}", folder, object.name)),
            );

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }
        Ok(keys)
    }

    async fn signed_url(
        &self,
        session: &Session,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String> {
        let path = format!("object/sign/{}/{}", bucket, key.trim_start_matches('/'));
        let response = self
            .api
            .request(Method::POST, &self.url(&path), session)
            .json(&serde_json::json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await?;
        let response = check_status(response, "sign object url").await?;
        let signed: SignedUrlResponse = read_json(response, "sign object url").await?;
        if signed.signed_url.is_empty() {
            return Err(SyncError::remote("sign object url returned an empty url"));
        }
        Ok(format!(
            "{}/storage/v1/{}",
            self.api.base_url(),
            signed.signed_url.trim_start_matches('/')
        ))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        self.url(&format!("object/public/{}/{}", bucket, key.trim_start_matches('/')))
    }
}
