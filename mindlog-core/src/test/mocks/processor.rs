//! # Mock Sync Processor

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::MockCallTracker;
use crate::error::{Result, SyncError};
use crate::sync::SyncProcessor;
use crate::types::SyncTask;

/// Scripted processor
///
/// Succeeds unless told otherwise. Tracks how many executions overlap in time
/// and whether two executions of the same record ever did.
#[derive(Debug, Clone, Default)]
pub struct MockProcessor {
    delay: Arc<Mutex<Option<Duration>>>,
    failing_tasks: Arc<Mutex<HashSet<String>>>,
    panicking_tasks: Arc<Mutex<HashSet<String>>>,
    fail_all: Arc<AtomicBool>,
    runs: Arc<Mutex<HashMap<String, usize>>>,
    active_records: Arc<Mutex<HashSet<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
    tracker: MockCallTracker,
}

struct InFlight<'a> {
    processor: &'a MockProcessor,
    record: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.processor.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.processor
            .active_records
            .lock()
            .unwrap()
            .remove(&self.record);
    }
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every execution for `delay`
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn fail_task(&self, task_id: impl Into<String>) {
        self.failing_tasks.lock().unwrap().insert(task_id.into());
    }

    pub fn panic_on(&self, task_id: impl Into<String>) {
        self.panicking_tasks.lock().unwrap().insert(task_id.into());
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().values().sum()
    }

    pub fn runs_of(&self, task_id: &str) -> usize {
        self.runs.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous executions seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Two executions of the same record overlapped
    pub fn saw_same_record_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn enter(&self, task: &SyncTask) -> InFlight<'_> {
        let record = match task.local_id() {
            Some(local_id) => format!("record:{}", local_id),
            None => task.kind().to_string(),
        };
        if !self.active_records.lock().unwrap().insert(record.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            processor: self,
            record,
        }
    }
}

#[async_trait]
impl SyncProcessor for MockProcessor {
    async fn run(&self, task: &SyncTask) -> Result<()> {
        self.tracker.record("run", vec![task.id().to_string()]);
        *self
            .runs
            .lock()
            .unwrap()
            .entry(task.id().to_string())
            .or_insert(0) += 1;

        let _guard = self.enter(task);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.panicking_tasks.lock().unwrap().contains(task.id()) {
            panic!("scripted panic for {}", task.id());
        }
        if self.fail_all.load(Ordering::SeqCst)
            || self.failing_tasks.lock().unwrap().contains(task.id())
        {
            return Err(SyncError::remote(format!("scripted failure for {}", task.id())));
        }
        Ok(())
    }
}
