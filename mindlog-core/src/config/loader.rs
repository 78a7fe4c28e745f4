//! # 配置加载
//!
//! Layers, later wins:
//!
//! 1. built-in defaults
//! 2. the TOML file (`MINDLOG_CONFIG`, `./mindlog.toml`, `<config_dir>/mindlog/config.toml`)
//! 3. `<PREFIX>_<SECTION>_<KEY>` environment variables
//!
//! The merged result is validated before it is returned.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::Config;
use crate::error::{Result, SyncError};

const DEFAULT_ENV_PREFIX: &str = "MINDLOG";
const CONFIG_PATH_VAR: &str = "MINDLOG_CONFIG";

/// Resolves a [`Config`] from file and environment
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::with_path(discover_config_path())
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of searching for one
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Search for the file as usual, but read overrides under `prefix`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::new().env_prefix(prefix)
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Defaults, then the file if it exists, then the environment
    pub fn load(&self) -> Result<Config> {
        let mut config = match self.read_file()? {
            Some(config) => config,
            None => Config::default(),
        };
        EnvOverrides::new(&self.env_prefix).apply(&mut config)?;

        config.validate().map_err(|e| {
            SyncError::configuration(format!(
                "{} is not a usable configuration: {}",
                self.config_path.display(),
                e
            ))
        })?;
        Ok(config)
    }

    /// `None` when the file does not exist; sections it omits keep their defaults
    fn read_file(&self) -> Result<Option<Config>> {
        if !self.config_path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.config_path).map_err(|e| {
            SyncError::configuration(format!(
                "Cannot read {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let config = toml::from_str(&text).map_err(|e| {
            SyncError::configuration(format!(
                "Cannot parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        Ok(Some(config))
    }

    /// The defaults rendered as a commented TOML file
    pub fn create_template(&self) -> Result<String> {
        let body = toml::to_string_pretty(&Config::default())
            .map_err(|e| SyncError::configuration(format!("Cannot render template: {}", e)))?;
        Ok(format!(
            "# Mindlog sync configuration\n\
             # Every key is optional; environment variables named {}_<SECTION>_<KEY> override it.\n\n{}",
            self.env_prefix, body
        ))
    }
}

fn discover_config_path() -> PathBuf {
    if let Some(explicit) = env::var_os(CONFIG_PATH_VAR) {
        return PathBuf::from(explicit);
    }

    let local = PathBuf::from("mindlog.toml");
    let user = dirs::config_dir().map(|dir| dir.join("mindlog").join("config.toml"));

    std::iter::once(local.clone())
        .chain(user)
        .find(|candidate| candidate.exists())
        .unwrap_or(local)
}

/// Reads `<prefix>_<name>` variables into typed config fields
struct EnvOverrides<'a> {
    prefix: &'a str,
}

impl<'a> EnvOverrides<'a> {
    fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    fn apply(&self, config: &mut Config) -> Result<()> {
        let sync = &mut config.sync;
        self.number("SYNC_MAX_PARALLEL_TASKS", &mut sync.max_parallel_tasks)?;
        self.number("SYNC_BACKOFF_BASE_MS", &mut sync.backoff_base_ms)?;
        self.number("SYNC_BACKOFF_MAX_MS", &mut sync.backoff_max_ms)?;
        self.flag("SYNC_UPLOAD_COMPRESSION", &mut sync.upload_compression)?;
        self.flag("SYNC_PULL_ON_STARTUP", &mut sync.pull_on_startup)?;
        self.flag("SYNC_RETRY_ON_METERED", &mut sync.retry_on_metered)?;
        if let Some(raw) = self.raw("SYNC_MAX_ATTEMPTS") {
            sync.max_attempts = Some(parse_number("SYNC_MAX_ATTEMPTS", &raw)?);
        }

        let storage = &mut config.storage;
        if let Some(raw) = self.raw("STORAGE_DATA_DIR") {
            storage.data_dir = PathBuf::from(raw);
        }
        self.flag("STORAGE_WAL_ENABLED", &mut storage.wal_enabled)?;

        let remote = &mut config.remote;
        self.text("REMOTE_BASE_URL", &mut remote.base_url);
        self.text("REMOTE_API_KEY", &mut remote.api_key);
        self.text("REMOTE_RECORDS_TABLE", &mut remote.records_table);
        self.text("REMOTE_MEDIA_BUCKET", &mut remote.media_bucket);
        if let Some(raw) = self.raw("REMOTE_USER_ID") {
            remote.user_id = Some(raw);
        }
        if let Some(raw) = self.raw("REMOTE_ACCESS_TOKEN") {
            remote.access_token = Some(raw);
        }

        if let Some(raw) = self.raw("CONNECTIVITY_PROBE_ADDRESS") {
            config.connectivity.probe_address = Some(raw);
        }
        self.flag("CONNECTIVITY_METERED", &mut config.connectivity.metered)?;
        Ok(())
    }

    fn raw(&self, name: &str) -> Option<String> {
        env::var(format!("{}_{}", self.prefix, name)).ok()
    }

    fn text(&self, name: &str, slot: &mut String) {
        if let Some(raw) = self.raw(name) {
            *slot = raw;
        }
    }

    fn number<T>(&self, name: &str, slot: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.raw(name) {
            *slot = parse_number(name, &raw)?;
        }
        Ok(())
    }

    fn flag(&self, name: &str, slot: &mut bool) -> Result<()> {
        if let Some(raw) = self.raw(name) {
            *slot = parse_flag(name, &raw)?;
        }
        Ok(())
    }
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        SyncError::configuration(format!("{} = '{}' is not a number: {}", name, raw, e))
    })
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::configuration(format!(
            "{} = '{}' is not a boolean",
            name, raw
        ))),
    }
}
