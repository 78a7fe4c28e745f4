//! # Platform Scheduler
//!
//! Background wake-ups for the sync loop.
//!
//! ## Components
//!
//! - **SyncWaker**: coalescing wake signal consumed by the sync loop
//! - **PlatformScheduler**: host-provided periodic execution (OS job
//!   scheduler on mobile); failures are logged by the caller, never fatal
//! - **IntervalScheduler**: in-process tokio timer, for desktop hosts
//! - **NoopScheduler**: accepts every request and does nothing

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};

/// Wake signal of the sync loop
///
/// Wakes coalesce: any number of `wake()` calls while the loop is busy result
/// in exactly one extra pass.
#[derive(Clone, Default)]
pub struct SyncWaker {
    notify: Arc<Notify>,
}

impl std::fmt::Debug for SyncWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWaker").finish_non_exhaustive()
    }
}

impl SyncWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        trace!("Waking sync loop");
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Periodic wake-up requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub interval: Duration,
    /// Only fire on unmetered networks
    pub requires_unmetered: bool,
}

impl ScheduleRequest {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            requires_unmetered: false,
        }
    }
}

/// Host background execution
#[async_trait]
pub trait PlatformScheduler: Send + Sync {
    /// Register the periodic wake-up; idempotent for an identical request
    async fn ensure_scheduled(&self, waker: SyncWaker, request: ScheduleRequest) -> Result<()>;

    /// Best-effort immediate wake-up
    async fn wake_up_now(&self) -> Result<()>;

    async fn cancel(&self) -> Result<()>;
}

/// Accepts every request and never fires
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

#[async_trait]
impl PlatformScheduler for NoopScheduler {
    async fn ensure_scheduled(&self, _waker: SyncWaker, _request: ScheduleRequest) -> Result<()> {
        Ok(())
    }

    async fn wake_up_now(&self) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}

struct Scheduled {
    request: ScheduleRequest,
    waker: SyncWaker,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Fires the waker every `interval` from a tokio task
#[derive(Default)]
pub struct IntervalScheduler {
    connectivity: Option<ConnectivityMonitor>,
    scheduled: Mutex<Option<Scheduled>>,
}

impl std::fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip ticks on metered networks when the request asks for it
    pub fn with_connectivity(connectivity: ConnectivityMonitor) -> Self {
        Self {
            connectivity: Some(connectivity),
            scheduled: Mutex::new(None),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Scheduled>>> {
        self.scheduled
            .lock()
            .map_err(|_| SyncError::scheduler("scheduler state poisoned"))
    }
}

#[async_trait]
impl PlatformScheduler for IntervalScheduler {
    async fn ensure_scheduled(&self, waker: SyncWaker, request: ScheduleRequest) -> Result<()> {
        if request.interval.is_zero() {
            return Err(SyncError::scheduler("wake interval must be positive"));
        }

        let mut slot = self.slot()?;
        if let Some(existing) = slot.as_ref() {
            if existing.request == request {
                return Ok(());
            }
            existing.token.cancel();
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let tick_waker = waker.clone();
        let connectivity = self.connectivity.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(request.interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let metered = connectivity
                            .as_ref()
                            .map(|c| c.state().metered)
                            .unwrap_or(false);
                        if request.requires_unmetered && metered {
                            trace!("Skipping scheduled wake-up on metered network");
                            continue;
                        }
                        tick_waker.wake();
                    }
                }
            }
        });

        debug!("Scheduled periodic sync every {:?}", request.interval);
        *slot = Some(Scheduled {
            request,
            waker,
            token,
            _handle: handle,
        });
        Ok(())
    }

    async fn wake_up_now(&self) -> Result<()> {
        if let Some(scheduled) = self.slot()?.as_ref() {
            scheduled.waker.wake();
        }
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        if let Some(scheduled) = self.slot()?.take() {
            scheduled.token.cancel();
            debug!("Cancelled periodic sync");
        }
        Ok(())
    }
}
