//! # Sync Manager
//!
//! Orchestrator of the sync engine.
//!
//! ```text
//!  enqueue / trigger_now ─┐
//!  connectivity restored ─┼──► SyncWaker ──► run loop ──► pass ──► JoinSet (≤ max_parallel_tasks)
//!  platform scheduler ────┘        ▲                                  │
//!                safety-net tick ──┘          entity lock → claim → processor → complete | reschedule
//! ```
//!
//! ## 状态机
//!
//! `Stopped → Running → Stopped`. `start()` and `stop()` are idempotent.
//! Stopping cancels the loop; executions in flight are abandoned and their rows
//! released back to PENDING without consuming an attempt.
//!
//! ## Passes
//!
//! A pass fetches up to `max_parallel_tasks` due tasks and keeps that many in
//! flight, refilling freed slots with due tasks not yet attempted in the same
//! pass. Passes never overlap. Only one task per entity key is dispatched at a
//! time; later tasks of a busy entity wait in due order for it to finish.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::locks::EntityLocks;
use super::processor::SyncProcessor;
use super::queue::SyncQueue;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{Result, SyncError};
use crate::event_bus::{SyncEvent, SyncEventBus};
use crate::scheduler::{NoopScheduler, PlatformScheduler, ScheduleRequest, SyncWaker};
use crate::types::{now_millis, SyncStatus, SyncTask, SyncTaskEntity};

/// Outcome counts of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Executions started
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Superseded or cancelled before it could be claimed or completed, or abandoned on stop
    pub skipped: usize,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Skipped,
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    config: SyncConfig,
    queue: SyncQueue,
    processor: Arc<dyn SyncProcessor>,
    connectivity: ConnectivityMonitor,
    scheduler: Arc<dyn PlatformScheduler>,
    events: SyncEventBus,
    locks: EntityLocks,
    waker: SyncWaker,
    status: watch::Sender<SyncStatus>,
    running: AtomicBool,
    lifecycle: AsyncMutex<Option<RunningLoop>>,
    /// Token handed to passes; replaced on every start
    shutdown: Mutex<CancellationToken>,
    pass_lock: AsyncMutex<()>,
}

/// Builder of [`SyncManager`]
pub struct SyncManagerBuilder {
    config: SyncConfig,
    queue: SyncQueue,
    processor: Arc<dyn SyncProcessor>,
    connectivity: Option<ConnectivityMonitor>,
    scheduler: Option<Arc<dyn PlatformScheduler>>,
    events: Option<SyncEventBus>,
}

impl SyncManagerBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn PlatformScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn events(mut self, events: SyncEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> SyncManager {
        let events = self
            .events
            .unwrap_or_else(|| SyncEventBus::new(self.config.event_channel_capacity));
        let (status, _) = watch::channel(SyncStatus::default());
        SyncManager {
            inner: Arc::new(ManagerInner {
                locks: EntityLocks::new(self.config.lock_cache_capacity),
                connectivity: self
                    .connectivity
                    .unwrap_or_else(|| ConnectivityMonitor::new(ConnectivityState::online())),
                scheduler: self.scheduler.unwrap_or_else(|| Arc::new(NoopScheduler)),
                config: self.config,
                queue: self.queue,
                processor: self.processor,
                events,
                waker: SyncWaker::new(),
                status,
                running: AtomicBool::new(false),
                lifecycle: AsyncMutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                pass_lock: AsyncMutex::new(()),
            }),
        }
    }
}

/// Offline-first sync orchestrator
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("running", &self.is_running())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    pub fn builder(queue: SyncQueue, processor: Arc<dyn SyncProcessor>) -> SyncManagerBuilder {
        SyncManagerBuilder {
            config: SyncConfig::default(),
            queue,
            processor,
            connectivity: None,
            scheduler: None,
            events: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn events(&self) -> &SyncEventBus {
        &self.inner.events
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Live aggregate status
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Recover interrupted rows and launch the run loop
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("Sync manager already running");
            return Ok(());
        }

        self.inner.queue.recover_interrupted().await?;
        self.inner.connectivity.start();

        let token = CancellationToken::new();
        *self.shutdown_slot() = token.clone();
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { inner.run_loop(loop_token).await });
        *lifecycle = Some(RunningLoop { token, handle });

        let request = ScheduleRequest::new(self.inner.config.wake_interval());
        if let Err(e) = self
            .inner
            .scheduler
            .ensure_scheduled(self.inner.waker.clone(), request)
            .await
        {
            warn!("Periodic background sync unavailable: {}", e);
        }

        if self.inner.config.pull_on_startup {
            if let Err(e) = self.inner.queue.enqueue(&SyncTask::pull_all()).await {
                error!("Failed to enqueue startup pull: {}", e);
            }
        }

        self.inner.refresh_status().await;
        self.inner.waker.wake();
        info!(
            "Sync manager started (max_parallel_tasks={})",
            self.inner.config.max_parallel_tasks
        );
        Ok(())
    }

    /// Cancel the loop, connectivity polling and the platform schedule
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!("Sync loop ended abnormally: {}", e);
        }
        // inline passes after a stop get a live token
        *self.shutdown_slot() = CancellationToken::new();

        self.inner.connectivity.stop();
        if let Err(e) = self.inner.scheduler.cancel().await {
            warn!("Failed to cancel periodic sync: {}", e);
        }
        self.inner.refresh_status().await;
        info!("Sync manager stopped");
    }

    /// Persist `task` and wake the loop when online
    ///
    /// A no-op while stopped. A delete cancels the record's outstanding tasks
    /// first.
    pub async fn enqueue(&self, task: SyncTask) -> Result<()> {
        if !self.is_running() {
            warn!(
                "Sync manager is not running, dropping {} task {}",
                task.kind(),
                task.id()
            );
            return Ok(());
        }

        if let SyncTask::DeleteRecord { local_id, .. } = &task {
            self.inner.queue.cancel_tasks_for_local_id(*local_id).await?;
        }
        self.inner.queue.enqueue(&task).await?;
        self.inner.refresh_status().await;

        if self.inner.connectivity.is_connected() {
            self.inner.waker.wake();
        }
        Ok(())
    }

    /// Request an immediate pass; no-op while stopped
    pub fn trigger_now(&self) {
        if self.is_running() {
            self.inner.waker.wake();
        }
    }

    /// Run one pass inline, regardless of connectivity
    pub async fn run_pass(&self) -> Result<PassReport> {
        let token = self.shutdown_slot().clone();
        self.inner.pass(&token).await
    }

    fn shutdown_slot(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.inner
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ManagerInner {
    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut connectivity = self.connectivity.subscribe();
        let mut was_connected = connectivity.borrow_and_update().connected;
        let mut last_cleanup = Instant::now();
        debug!("Sync loop started (connected={})", was_connected);

        loop {
            let connected = self.connectivity.is_connected();
            if connected {
                // failures are already published as SyncFailed
                let _ = self.pass(&token).await;
            }
            if token.is_cancelled() {
                break;
            }

            if last_cleanup.elapsed() >= self.config.cleanup_interval() {
                last_cleanup = Instant::now();
                if let Err(e) = self
                    .queue
                    .cleanup_completed_tasks(self.config.completed_retention_ms())
                    .await
                {
                    warn!("Sync task cleanup failed: {}", e);
                }
            }

            let tick = if connected {
                self.config.online_poll_interval()
            } else {
                self.config.offline_poll_interval()
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.waker.notified() => {}
                _ = tokio::time::sleep(tick) => {}
                Ok(()) = connectivity.changed() => {
                    let now_connected = connectivity.borrow_and_update().connected;
                    if now_connected && !was_connected {
                        info!("Connectivity restored, resuming sync");
                    } else if !now_connected && was_connected {
                        info!("Connectivity lost, sync paused");
                    }
                    was_connected = now_connected;
                }
            }
        }
        debug!("Sync loop stopped");
    }

    async fn fetch_due(&self, limit: usize) -> Result<Vec<SyncTaskEntity>> {
        let state = self.connectivity.state();
        let first_attempt_only = state.metered && !self.config.retry_on_metered;
        self.queue.get_dispatchable(limit, first_attempt_only).await
    }

    async fn pass(self: &Arc<Self>, token: &CancellationToken) -> Result<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let slots = self.config.max_parallel_tasks.max(1);

        let initial = match self.fetch_due(slots).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to read sync queue: {}", e);
                self.events.publish(SyncEvent::failed(e.to_string()));
                return Err(e);
            }
        };
        if initial.is_empty() {
            return Ok(PassReport::default());
        }

        self.events.publish(SyncEvent::started(initial.len()));
        debug!("Sync pass picked up {} task(s)", initial.len());

        let mut report = PassReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut backlog: VecDeque<SyncTaskEntity> = initial.into();
        let mut gate = EntityGate::default();
        // admitted rows whose predecessor on the same entity has finished
        let mut ready: VecDeque<SyncTaskEntity> = VecDeque::new();
        let mut executions: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut refill = true;

        loop {
            while executions.len() < slots && !token.is_cancelled() {
                let entity = match ready.pop_front() {
                    Some(entity) => entity,
                    None => {
                        if backlog.is_empty() && refill {
                            match self.refill(slots - executions.len(), &seen).await {
                                Ok(more) => backlog.extend(more),
                                Err(e) => {
                                    warn!("Failed to refill sync pass: {}", e);
                                    refill = false;
                                }
                            }
                        }
                        let Some(entity) = backlog.pop_front() else {
                            break;
                        };
                        if !seen.insert(entity.id.clone()) {
                            continue;
                        }
                        match gate.admit(entity) {
                            Some(entity) => entity,
                            None => continue,
                        }
                    }
                };
                report.dispatched += 1;
                let key = entity.lock_key();
                let run = AssertUnwindSafe(self.clone().execute(entity, token.clone())).catch_unwind();
                executions.spawn(async move {
                    let outcome = run.await.unwrap_or_else(|panic| {
                        error!("Sync execution panicked: {}", panic_message(panic.as_ref()));
                        TaskOutcome::Failed
                    });
                    (key, outcome)
                });
            }

            let (key, outcome) = match executions.join_next().await {
                None => break,
                Some(Ok(finished)) => finished,
                Some(Err(e)) => {
                    error!("Sync execution aborted: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Completed => report.completed += 1,
                TaskOutcome::Failed => report.failed += 1,
                TaskOutcome::Skipped => report.skipped += 1,
            }
            if let Some(next) = gate.finish(&key, outcome) {
                ready.push_back(next);
            }
        }

        self.events
            .publish(SyncEvent::completed(report.completed, report.failed));
        self.refresh_status().await;
        info!(
            "Sync pass finished: {} completed, {} failed, {} skipped",
            report.completed, report.failed, report.skipped
        );
        Ok(report)
    }

    /// Due tasks not yet seen in this pass
    async fn refill(&self, free: usize, seen: &HashSet<String>) -> Result<Vec<SyncTaskEntity>> {
        let due = self.fetch_due(free + seen.len()).await?;
        Ok(due
            .into_iter()
            .filter(|entity| !seen.contains(&entity.id))
            .take(free)
            .collect())
    }

    async fn execute(self: Arc<Self>, entity: SyncTaskEntity, token: CancellationToken) -> TaskOutcome {
        let key = entity.lock_key();
        let _guard = tokio::select! {
            _ = token.cancelled() => return TaskOutcome::Skipped,
            guard = self.locks.lock(&key) => guard,
        };

        match self.queue.claim(&entity).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task {} changed while waiting for {}, skipping", entity.id, key);
                return TaskOutcome::Skipped;
            }
            Err(e) => {
                error!("Failed to claim task {}: {}", entity.id, e);
                return TaskOutcome::Failed;
            }
        }

        let task = match entity.decode() {
            Ok(task) => task,
            Err(e) => {
                error!("Task {} has an unreadable payload: {}", entity.id, e);
                if let Err(e) = self.queue.abandon(&entity, &e.to_string()).await {
                    error!("Failed to abandon task {}: {}", entity.id, e);
                }
                return TaskOutcome::Failed;
            }
        };

        debug!("Running {} task {}", entity.task_type, entity.id);
        let run = AssertUnwindSafe(self.processor.run(&task)).catch_unwind();
        let result = tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = self.queue.release(&entity).await {
                    error!("Failed to release task {}: {}", entity.id, e);
                }
                debug!("Task {} abandoned on shutdown", entity.id);
                return TaskOutcome::Skipped;
            }
            result = run => result.unwrap_or_else(|panic| {
                Err(SyncError::other(format!("processor panicked: {}", panic_message(panic.as_ref()))))
            }),
        };

        match result {
            Ok(()) => match self.queue.complete(&entity).await {
                Ok(true) => {
                    debug!("Task {} completed", entity.id);
                    TaskOutcome::Completed
                }
                Ok(false) => {
                    debug!("Task {} was superseded while running", entity.id);
                    TaskOutcome::Skipped
                }
                Err(e) => {
                    error!("Failed to complete task {}: {}", entity.id, e);
                    self.release_after_store_error(&entity).await;
                    TaskOutcome::Failed
                }
            },
            Err(e) => {
                let attempt = entity.attempt_count.saturating_add(1);
                if let Err(store_err) = self.queue.reschedule(&entity, attempt, &e.to_string()).await {
                    error!("Failed to reschedule task {}: {}", entity.id, store_err);
                    self.release_after_store_error(&entity).await;
                }
                TaskOutcome::Failed
            }
        }
    }

    /// Put a claimed row back to PENDING so the next tick picks it up again
    async fn release_after_store_error(&self, entity: &SyncTaskEntity) {
        match self.queue.release(entity).await {
            Ok(_) => debug!("Task {} released after a store error", entity.id),
            Err(e) => error!(
                "Task {} stays RUNNING until restart, release failed: {}",
                entity.id, e
            ),
        }
    }

    async fn refresh_status(&self) {
        let pending = self.queue.get_pending_count().await;
        let running = self.queue.get_running_count().await;
        let (pending, running) = match (pending, running) {
            (Ok(pending), Ok(running)) => (pending, running),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to read sync status: {}", e);
                return;
            }
        };

        let next = SyncStatus {
            running: running > 0,
            pending_count: pending,
            last_sync_time: (pending == 0).then(now_millis),
        };
        self.status.send_replace(next);
    }
}

/// Admits one execution per entity key at a time
///
/// Rows arrive in due order; a row whose key is busy waits behind the running
/// one and is handed back, oldest first, when that execution finishes.
#[derive(Debug, Default)]
struct EntityGate {
    held: HashMap<String, VecDeque<SyncTaskEntity>>,
}

impl EntityGate {
    fn admit(&mut self, entity: SyncTaskEntity) -> Option<SyncTaskEntity> {
        match self.held.entry(entity.lock_key()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push_back(entity);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(entity)
            }
        }
    }

    /// The next row of `key`, already admitted; the key stays busy until it finishes
    ///
    /// After a failure the waiting rows are left for a later pass, behind the retry.
    fn finish(&mut self, key: &str, outcome: TaskOutcome) -> Option<SyncTaskEntity> {
        if outcome == TaskOutcome::Failed {
            self.held.remove(key);
            return None;
        }
        let next = self.held.get_mut(key)?.pop_front();
        if next.is_none() {
            self.held.remove(key);
        }
        next
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
