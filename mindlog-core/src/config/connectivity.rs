//! # Connectivity Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{require_nonzero, ValidateConfig};
use crate::error::Result;

/// Reachability probe configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectivityConfig {
    /// `host:port` to probe; derived from the remote base URL when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_address: Option<String>,

    /// Seconds between probes
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Connect timeout of a single probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Treat the network as metered (e.g. tethered)
    #[serde(default)]
    pub metered: bool,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_address: None,
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            metered: false,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ValidateConfig for ConnectivityConfig {
    fn validate(&self) -> Result<()> {
        require_nonzero(self.probe_interval_secs, "probe_interval_secs")?;
        require_nonzero(self.probe_timeout_ms, "probe_timeout_ms")?;
        Ok(())
    }
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}
