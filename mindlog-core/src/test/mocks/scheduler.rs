//! # Mock Platform Scheduler

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::MockCallTracker;
use crate::error::{Result, SyncError};
use crate::scheduler::{PlatformScheduler, ScheduleRequest, SyncWaker};

/// Records requests and keeps the last waker so tests can fire it
#[derive(Debug, Clone, Default)]
pub struct MockScheduler {
    waker: Arc<Mutex<Option<SyncWaker>>>,
    last_request: Arc<Mutex<Option<ScheduleRequest>>>,
    fail_scheduling: Arc<Mutex<bool>>,
    tracker: MockCallTracker,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ensure_scheduled` fail, as a host without background execution would
    pub fn failing() -> Self {
        let scheduler = Self::default();
        *scheduler.fail_scheduling.lock().unwrap() = true;
        scheduler
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    pub fn last_request(&self) -> Option<ScheduleRequest> {
        *self.last_request.lock().unwrap()
    }

    /// Simulate the OS firing the periodic job
    pub fn fire(&self) -> bool {
        match self.waker.lock().unwrap().as_ref() {
            Some(waker) => {
                waker.wake();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PlatformScheduler for MockScheduler {
    async fn ensure_scheduled(&self, waker: SyncWaker, request: ScheduleRequest) -> Result<()> {
        self.tracker
            .record("ensure_scheduled", vec![format!("{:?}", request.interval)]);
        if *self.fail_scheduling.lock().unwrap() {
            return Err(SyncError::scheduler("background execution unavailable"));
        }
        *self.waker.lock().unwrap() = Some(waker);
        *self.last_request.lock().unwrap() = Some(request);
        Ok(())
    }

    async fn wake_up_now(&self) -> Result<()> {
        self.tracker.record("wake_up_now", vec![]);
        self.fire();
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.tracker.record("cancel", vec![]);
        self.waker.lock().unwrap().take();
        Ok(())
    }
}
