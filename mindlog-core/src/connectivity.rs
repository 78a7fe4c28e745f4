//! # Connectivity Monitor
//!
//! Live online/offline signal for the sync engine.
//!
//! ```text
//!  ReachabilityProbe ──poll──► ConnectivityMonitor ──watch──► SyncManager
//!        host push ──set_state──┘
//! ```
//!
//! Only real transitions are published; repeated identical readings do not
//! wake subscribers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConnectivityConfig, RemoteConfig};

/// Network reachability snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub connected: bool,
    /// Connection is billed by volume (cellular, tethering)
    pub metered: bool,
}

impl ConnectivityState {
    pub fn online() -> Self {
        Self {
            connected: true,
            metered: false,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }
}

/// Reachability primitive
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> ConnectivityState;
}

/// Reachable when a TCP connection to `address` opens within `timeout`
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
    metered: bool,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            metered: false,
        }
    }

    pub fn metered(mut self, metered: bool) -> Self {
        self.metered = metered;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> ConnectivityState {
        let connected = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        );
        ConnectivityState {
            connected,
            metered: connected && self.metered,
        }
    }
}

struct MonitorInner {
    state: watch::Sender<ConnectivityState>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    interval: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Publishes [`ConnectivityState`] transitions on a watch channel
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("polling", &self.inner.probe.is_some())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Monitor fed only through [`set_state`](Self::set_state)
    pub fn new(initial: ConnectivityState) -> Self {
        Self::build(initial, None, Duration::from_secs(10))
    }

    /// Monitor polling `probe` every `interval` once started
    pub fn with_probe(
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        initial: ConnectivityState,
    ) -> Self {
        Self::build(initial, Some(probe), interval)
    }

    /// TCP probe against the configured address, or the remote host when unset
    ///
    /// Without either the monitor assumes it is online.
    pub fn from_config(config: &ConnectivityConfig, remote: &RemoteConfig) -> Self {
        let address = config
            .probe_address
            .clone()
            .or_else(|| probe_address_for(remote.base()));

        match address {
            Some(address) => {
                debug!("Probing connectivity via {}", address);
                let probe = TcpProbe::new(address, config.probe_timeout()).metered(config.metered);
                Self::with_probe(
                    Arc::new(probe),
                    config.probe_interval(),
                    ConnectivityState::offline(),
                )
            }
            None => Self::new(ConnectivityState {
                connected: true,
                metered: config.metered,
            }),
        }
    }

    fn build(
        initial: ConnectivityState,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(MonitorInner {
                state,
                probe,
                interval,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Publish a new reading; returns whether it changed anything
    pub fn set_state(&self, next: ConnectivityState) -> bool {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(
                "Connectivity changed: connected={} metered={}",
                next.connected, next.metered
            );
        }
        changed
    }

    pub fn set_connected(&self, connected: bool) -> bool {
        let metered = self.state().metered;
        self.set_state(ConnectivityState { connected, metered })
    }

    /// Start polling; idempotent, no-op without a probe
    pub fn start(&self) {
        let Some(probe) = self.inner.probe.clone() else {
            return;
        };
        let mut task = self.inner.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let monitor = self.clone();
        let interval = self.inner.interval;
        let handle = tokio::spawn(async move {
            loop {
                let reading = tokio::select! {
                    _ = child.cancelled() => break,
                    reading = probe.probe() => reading,
                };
                monitor.set_state(reading);

                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Connectivity polling stopped");
        });
        *task = Some((token, handle));
    }

    /// Stop polling; idempotent
    pub fn stop(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((token, _handle)) = task.take() {
            token.cancel();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }
}

/// `host:port` of an `http(s)` base URL
fn probe_address_for(base_url: &str) -> Option<String> {
    if base_url.is_empty() {
        return None;
    }
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}
