//! # Remote Configuration
//!
//! Record API and object storage endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{require_nonzero, validation_error, ValidateConfig};
use crate::error::Result;

/// Default request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remote backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Backend base URL, e.g. `https://project.example.co`. Empty disables remote sync.
    #[serde(default)]
    pub base_url: String,

    /// Public API key sent as `apikey`
    #[serde(default)]
    pub api_key: String,

    /// Table holding journal records
    #[serde(default = "default_records_table")]
    pub records_table: String,

    /// Bucket holding uploaded images and voice notes
    #[serde(default = "default_media_bucket")]
    pub media_bucket: String,

    /// Store public URLs instead of signed URLs
    #[serde(default)]
    pub public_media: bool,

    /// Lifetime of signed media URLs
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Session user id (normally supplied by the app's session manager)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Session access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            records_table: default_records_table(),
            media_bucket: default_media_bucket(),
            public_media: false,
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_id: None,
            access_token: None,
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    /// Base URL without trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

impl ValidateConfig for RemoteConfig {
    fn validate(&self) -> Result<()> {
        if self.is_configured()
            && !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://"))
        {
            return Err(validation_error(format!(
                "base_url must start with http:// or https:// (got {})",
                self.base_url
            )));
        }

        if self.records_table.trim().is_empty() {
            return Err(validation_error("records_table cannot be empty"));
        }
        if self.media_bucket.trim().is_empty() {
            return Err(validation_error("media_bucket cannot be empty"));
        }

        require_nonzero(self.signed_url_ttl_secs, "signed_url_ttl_secs")?;
        require_nonzero(self.request_timeout_secs, "request_timeout_secs")?;

        Ok(())
    }
}

fn default_records_table() -> String {
    "journal_entries".to_string()
}

fn default_media_bucket() -> String {
    "journal-media".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
