//! # Sync Queue
//!
//! Durable, idempotent store of outstanding sync work and the only authority on
//! when a task becomes eligible to run.
//!
//! ## 两组状态转换
//!
//! - id-keyed (`mark_running`, `mark_completed`, `mark_failed`): act on whatever
//!   row currently carries the id.
//! - revision-guarded (`claim`, `complete`, `reschedule`, `release`): act only
//!   on the exact row revision the orchestrator fetched. A re-enqueue or a
//!   cancellation that lands while the task waits for its entity lock makes
//!   these return `false` instead of overwriting the newer row.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::{AttemptUpdate, DueFilter, NewTaskRow, TaskStore};
use crate::types::{now_millis, SyncTask, SyncTaskEntity, TaskState};

const ACTIVE: &[TaskState] = &[TaskState::Pending, TaskState::Running];

/// Persistent sync task queue
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn TaskStore>,
    backoff: BackoffPolicy,
    max_attempts: Option<u32>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    pub fn new(store: Arc<dyn TaskStore>, backoff: BackoffPolicy, max_attempts: Option<u32>) -> Self {
        Self {
            store,
            backoff,
            max_attempts,
        }
    }

    pub fn from_config(store: Arc<dyn TaskStore>, config: &SyncConfig) -> Self {
        Self::new(store, BackoffPolicy::from_config(config), config.max_attempts)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Insert or replace the task keyed by its id, due immediately
    pub async fn enqueue(&self, task: &SyncTask) -> Result<()> {
        let payload = task.to_payload()?;
        self.store
            .upsert_pending(NewTaskRow {
                id: task.id(),
                task_type: task.kind(),
                payload: &payload,
                local_id: task.local_id(),
                now: now_millis(),
            })
            .await?;
        debug!("Enqueued {} task {}", task.kind(), task.id());
        Ok(())
    }

    /// Up to `limit` PENDING tasks whose due time has passed
    pub async fn get_due_tasks(&self, limit: usize) -> Result<Vec<SyncTaskEntity>> {
        self.store.due(now_millis(), limit, DueFilter::default()).await
    }

    /// Like [`get_due_tasks`](Self::get_due_tasks), restricted to tasks that never failed
    pub async fn get_due_first_attempts(&self, limit: usize) -> Result<Vec<SyncTaskEntity>> {
        let filter = DueFilter {
            first_attempt_only: true,
            ..Default::default()
        };
        self.store.due(now_millis(), limit, filter).await
    }

    /// Due tasks that may run now without overtaking an older task of the same record
    ///
    /// A record's later edits wait while an earlier one is pending (even if it is
    /// backing off) or running.
    pub async fn get_dispatchable(
        &self,
        limit: usize,
        first_attempt_only: bool,
    ) -> Result<Vec<SyncTaskEntity>> {
        let filter = DueFilter {
            first_attempt_only,
            entity_heads_only: true,
        };
        self.store.due(now_millis(), limit, filter).await
    }

    /// PENDING → RUNNING; `false` if the row is not pending
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        self.store
            .transition(id, &[TaskState::Pending], TaskState::Running, None, now_millis())
            .await
    }

    /// → COMPLETED. Terminal and idempotent: terminal rows are left untouched.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        self.store
            .transition(id, ACTIVE, TaskState::Completed, None, now_millis())
            .await?;
        Ok(())
    }

    /// Record a failed attempt and push `next_run_at` out by the backoff delay
    ///
    /// `attempt_count` is the new count (previous count + 1).
    pub async fn mark_failed(&self, id: &str, attempt_count: u32) -> Result<()> {
        self.record_failure(id, ACTIVE, None, attempt_count, None)
            .await?;
        Ok(())
    }

    /// Cancel every non-terminal task of one record
    pub async fn cancel_tasks_for_local_id(&self, local_id: i64) -> Result<usize> {
        let cancelled = self.store.cancel_for_local_id(local_id, now_millis()).await?;
        if cancelled > 0 {
            debug!("Cancelled {} task(s) of record {}", cancelled, local_id);
        }
        Ok(cancelled)
    }

    pub async fn get_pending_count(&self) -> Result<u64> {
        self.store.count(TaskState::Pending).await
    }

    pub async fn get_running_count(&self) -> Result<u64> {
        self.store.count(TaskState::Running).await
    }

    pub async fn get_failed_count(&self) -> Result<u64> {
        self.store.count(TaskState::Failed).await
    }

    /// Delete COMPLETED and CANCELLED rows not touched for `older_than_ms`
    pub async fn cleanup_completed_tasks(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(older_than_ms);
        let deleted = self.store.delete_finished_before(cutoff).await?;
        if deleted > 0 {
            info!("Cleaned up {} finished sync task(s)", deleted);
        }
        Ok(deleted)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<SyncTaskEntity>> {
        self.store.get(id).await
    }

    pub async fn list_tasks(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<SyncTaskEntity>> {
        self.store.list(state, limit).await
    }

    /// Reset rows left RUNNING by a previous process
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let recovered = self.store.reset_running(now_millis()).await?;
        if recovered > 0 {
            warn!("Recovered {} interrupted sync task(s)", recovered);
        }
        Ok(recovered)
    }

    /// PENDING → RUNNING for exactly this revision
    pub async fn claim(&self, entity: &SyncTaskEntity) -> Result<bool> {
        self.store
            .transition(
                &entity.id,
                &[TaskState::Pending],
                TaskState::Running,
                Some(entity.revision),
                now_millis(),
            )
            .await
    }

    /// RUNNING → COMPLETED for exactly this revision
    pub async fn complete(&self, entity: &SyncTaskEntity) -> Result<bool> {
        self.store
            .transition(
                &entity.id,
                &[TaskState::Running],
                TaskState::Completed,
                Some(entity.revision),
                now_millis(),
            )
            .await
    }

    /// RUNNING → PENDING (or FAILED) with backoff, for exactly this revision
    pub async fn reschedule(
        &self,
        entity: &SyncTaskEntity,
        attempt_count: u32,
        error: &str,
    ) -> Result<bool> {
        self.record_failure(
            &entity.id,
            &[TaskState::Running],
            Some(entity.revision),
            attempt_count,
            Some(error),
        )
        .await
    }

    /// RUNNING → PENDING without consuming an attempt
    pub async fn release(&self, entity: &SyncTaskEntity) -> Result<bool> {
        self.store
            .transition(
                &entity.id,
                &[TaskState::Running],
                TaskState::Pending,
                Some(entity.revision),
                now_millis(),
            )
            .await
    }

    /// RUNNING → FAILED regardless of the attempt budget (undecodable payloads)
    pub async fn abandon(&self, entity: &SyncTaskEntity, error: &str) -> Result<bool> {
        let now = now_millis();
        let applied = self
            .store
            .record_attempt(
                &entity.id,
                &[TaskState::Running],
                Some(entity.revision),
                AttemptUpdate {
                    attempt_count: entity.attempt_count.saturating_add(1),
                    next_run_at: entity.next_run_at,
                    state: TaskState::Failed,
                    error: Some(error),
                    now,
                },
            )
            .await?;
        if applied {
            warn!("Task {} abandoned: {}", entity.id, error);
        }
        Ok(applied)
    }

    async fn record_failure(
        &self,
        id: &str,
        from: &[TaskState],
        revision: Option<i64>,
        attempt_count: u32,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = now_millis();
        let exhausted = self
            .max_attempts
            .map(|max| attempt_count >= max)
            .unwrap_or(false);
        let state = if exhausted {
            TaskState::Failed
        } else {
            TaskState::Pending
        };
        let delay = self.backoff.next_delay(attempt_count);
        let next_run_at = now.saturating_add(delay.as_millis() as i64);

        let applied = self
            .store
            .record_attempt(
                id,
                from,
                revision,
                AttemptUpdate {
                    attempt_count,
                    next_run_at,
                    state,
                    error,
                    now,
                },
            )
            .await?;

        if applied {
            if exhausted {
                warn!(
                    "Task {} failed after {} attempt(s), giving up: {}",
                    id,
                    attempt_count,
                    error.unwrap_or("unknown error")
                );
            } else {
                warn!(
                    "Task {} failed (attempt {}), retrying in {:?}: {}",
                    id,
                    attempt_count,
                    delay,
                    error.unwrap_or("unknown error")
                );
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TaskDb;
    use crate::types::JournalRecord;

    fn queue_with(max_attempts: Option<u32>) -> SyncQueue {
        let store: Arc<dyn TaskStore> = Arc::new(TaskDb::open_in_memory().unwrap());
        SyncQueue::new(store, BackoffPolicy::new(5_000, 600_000), max_attempts)
    }

    fn update(local_id: i64) -> SyncTask {
        SyncTask::update_record(JournalRecord::new(local_id, "title", "content"))
    }

    #[tokio::test]
    async fn test_enqueue_same_id_keeps_one_row() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        queue.enqueue(&task).await.unwrap();

        assert_eq!(queue.get_pending_count().await.unwrap(), 1);
        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.revision, 2);
        assert_eq!(entity.decode().unwrap(), task);
    }

    #[tokio::test]
    async fn test_get_due_tasks_respects_limit_and_state() {
        let queue = queue_with(None);
        let tasks: Vec<_> = (1..=5).map(update).collect();
        for task in &tasks {
            queue.enqueue(task).await.unwrap();
        }
        queue.mark_running(tasks[0].id()).await.unwrap();
        queue.mark_completed(tasks[1].id()).await.unwrap();

        let due = queue.get_due_tasks(2).await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|t| t.state == TaskState::Pending));

        let all_due = queue.get_due_tasks(10).await.unwrap();
        assert_eq!(all_due.len(), 3);
        assert!(all_due
            .iter()
            .all(|t| t.id != tasks[0].id() && t.id != tasks[1].id()));
    }

    #[tokio::test]
    async fn test_mark_completed_is_terminal_and_idempotent() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        queue.mark_running(task.id()).await.unwrap();
        queue.mark_completed(task.id()).await.unwrap();
        queue.mark_completed(task.id()).await.unwrap();

        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Completed);
        assert!(queue.get_due_tasks(10).await.unwrap().is_empty());

        // a later failure report does not resurrect it
        queue.mark_failed(task.id(), 1).await.unwrap();
        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_mark_failed_reschedules_with_backoff() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        queue.mark_running(task.id()).await.unwrap();

        let before = now_millis();
        queue.mark_failed(task.id(), 1).await.unwrap();
        let after = now_millis();

        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Pending);
        assert_eq!(entity.attempt_count, 1);
        assert!(entity.next_run_at >= before + 4_375);
        assert!(entity.next_run_at <= after + 5_625);
        assert!(queue.get_due_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_attempts_moves_to_failed() {
        let queue = queue_with(Some(2));
        let task = update(1);
        queue.enqueue(&task).await.unwrap();

        queue.mark_failed(task.id(), 1).await.unwrap();
        assert_eq!(
            queue.get_task(task.id()).await.unwrap().unwrap().state,
            TaskState::Pending
        );

        queue.mark_failed(task.id(), 2).await.unwrap();
        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Failed);
        assert_eq!(queue.get_failed_count().await.unwrap(), 1);
        assert_eq!(queue.get_pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_tasks_for_local_id() {
        let queue = queue_with(None);
        let a = update(1);
        let b = SyncTask::toggle_favorite(1, None, true);
        let other = update(2);
        for task in [&a, &b, &other] {
            queue.enqueue(task).await.unwrap();
        }
        queue.mark_running(b.id()).await.unwrap();

        assert_eq!(queue.cancel_tasks_for_local_id(1).await.unwrap(), 2);

        let due = queue.get_due_tasks(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, other.id());
        assert_eq!(
            queue.get_task(b.id()).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_revision_guard_rejects_stale_claim() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        let stale = queue.get_due_tasks(1).await.unwrap().remove(0);

        // re-enqueued while the orchestrator waited for the lock
        queue.enqueue(&task).await.unwrap();
        assert!(!queue.claim(&stale).await.unwrap());

        let fresh = queue.get_due_tasks(1).await.unwrap().remove(0);
        assert!(queue.claim(&fresh).await.unwrap());

        // re-enqueued while running: completion of the old run is dropped
        queue.enqueue(&task).await.unwrap();
        assert!(!queue.complete(&fresh).await.unwrap());
        assert_eq!(
            queue.get_task(task.id()).await.unwrap().unwrap().state,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn test_cancelled_while_running_stays_cancelled() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        let entity = queue.get_due_tasks(1).await.unwrap().remove(0);
        assert!(queue.claim(&entity).await.unwrap());

        queue.cancel_tasks_for_local_id(1).await.unwrap();
        assert!(!queue.reschedule(&entity, 1, "network down").await.unwrap());
        assert!(!queue.complete(&entity).await.unwrap());
        assert_eq!(
            queue.get_task(task.id()).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_release_keeps_attempt_count() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        let entity = queue.get_due_tasks(1).await.unwrap().remove(0);
        queue.claim(&entity).await.unwrap();

        assert!(queue.release(&entity).await.unwrap());
        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Pending);
        assert_eq!(entity.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let queue = queue_with(None);
        for task in [update(1), update(2)] {
            queue.enqueue(&task).await.unwrap();
            queue.mark_running(task.id()).await.unwrap();
        }
        assert_eq!(queue.get_running_count().await.unwrap(), 2);

        assert_eq!(queue.recover_interrupted().await.unwrap(), 2);
        assert_eq!(queue.get_running_count().await.unwrap(), 0);
        assert_eq!(queue.get_due_tasks(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_completed_tasks() {
        let queue = queue_with(None);
        let done = update(1);
        let cancelled = update(2);
        let pending = update(3);
        for task in [&done, &cancelled, &pending] {
            queue.enqueue(task).await.unwrap();
        }
        queue.mark_completed(done.id()).await.unwrap();
        queue.cancel_tasks_for_local_id(2).await.unwrap();

        // nothing is old enough yet
        assert_eq!(queue.cleanup_completed_tasks(60_000).await.unwrap(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(queue.cleanup_completed_tasks(0).await.unwrap(), 2);
        assert!(queue.get_task(done.id()).await.unwrap().is_none());
        assert!(queue.get_task(pending.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_attempts_filter() {
        let queue = queue_with(None);
        let fresh = update(1);
        let retried = update(2);
        queue.enqueue(&fresh).await.unwrap();
        queue.enqueue(&retried).await.unwrap();

        // due again immediately but with one failure on record
        let store_queue = SyncQueue::new(
            queue.store.clone(),
            BackoffPolicy::new(0, 0),
            None,
        );
        store_queue.mark_failed(retried.id(), 1).await.unwrap();

        let due = queue.get_due_first_attempts(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, fresh.id());
        assert_eq!(queue.get_due_tasks(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_abandon_is_terminal() {
        let queue = queue_with(None);
        let task = update(1);
        queue.enqueue(&task).await.unwrap();
        let entity = queue.get_due_tasks(1).await.unwrap().remove(0);
        assert!(queue.claim(&entity).await.unwrap());

        assert!(queue.abandon(&entity, "payload unreadable").await.unwrap());
        let entity = queue.get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(entity.state, TaskState::Failed);
        assert_eq!(entity.last_error.as_deref(), Some("payload unreadable"));
        assert!(queue.get_due_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatchable_waits_for_older_task_of_record() {
        let queue = queue_with(None);
        let create = SyncTask::create_record(JournalRecord::new(1, "title", "content"));
        let edit = update(1);
        let other = update(2);
        for task in [&create, &edit, &other] {
            queue.enqueue(task).await.unwrap();
        }
        let ids = |rows: Vec<SyncTaskEntity>| rows.into_iter().map(|e| e.id).collect::<Vec<_>>();

        assert_eq!(queue.get_due_tasks(10).await.unwrap().len(), 3);
        assert_eq!(
            ids(queue.get_dispatchable(10, false).await.unwrap()),
            vec![create.id(), other.id()]
        );

        // running
        let entity = queue.get_task(create.id()).await.unwrap().unwrap();
        assert!(queue.claim(&entity).await.unwrap());
        assert_eq!(ids(queue.get_dispatchable(10, false).await.unwrap()), vec![other.id()]);

        // backing off still holds the edit back
        assert!(queue.reschedule(&entity, 1, "timeout").await.unwrap());
        assert_eq!(ids(queue.get_dispatchable(10, false).await.unwrap()), vec![other.id()]);

        queue.mark_completed(create.id()).await.unwrap();
        assert_eq!(
            ids(queue.get_dispatchable(10, false).await.unwrap()),
            vec![edit.id(), other.id()]
        );
    }
}
