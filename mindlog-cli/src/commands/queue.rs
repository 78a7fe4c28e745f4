//! # Queue Commands
//!
//! Read and edit the durable task queue without starting the engine.

use anyhow::{Context, Result};
use mindlog_core::engine::open_queue;
use mindlog_core::{Config, SyncQueue, SyncTask, TaskState};
use serde::Serialize;

use super::{format_millis, success, truncate};

/// Queue counts
#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub pending: u64,
    pub running: u64,
    pub failed: u64,
    pub queue_db: String,
}

fn open(config: &Config) -> Result<SyncQueue> {
    open_queue(config).with_context(|| {
        format!(
            "Failed to open sync queue at {}",
            config.storage.queue_db_path().display()
        )
    })
}

pub async fn summarize(queue: &SyncQueue, config: &Config) -> Result<QueueSummary> {
    Ok(QueueSummary {
        pending: queue.get_pending_count().await?,
        running: queue.get_running_count().await?,
        failed: queue.get_failed_count().await?,
        queue_db: config.storage.queue_db_path().display().to_string(),
    })
}

pub async fn show_status(config: &Config, json: bool) -> Result<()> {
    let queue = open(config)?;
    let summary = summarize(&queue, config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Sync Queue:");
    println!("  Database:  {}", summary.queue_db);
    println!("  Pending:   {}", summary.pending);
    println!("  Running:   {}", summary.running);
    println!("  Failed:    {}", summary.failed);
    if summary.running > 0 {
        println!();
        println!("Running rows are reset to pending the next time the engine starts.");
    }
    Ok(())
}

pub async fn list_tasks(
    config: &Config,
    state: Option<TaskState>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let queue = open(config)?;
    let tasks = queue.list_tasks(state, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<28} {:<16} {:<10} {:>8} {:>8} {:<19} {}",
        "ID", "Type", "State", "Record", "Attempts", "Next Run", "Last Error"
    );
    println!("{}", "-".repeat(120));

    for task in tasks {
        println!(
            "{:<28} {:<16} {:<10} {:>8} {:>8} {:<19} {}",
            truncate(&task.id, 28),
            task.task_type.as_str(),
            task.state.as_str(),
            task.local_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            task.attempt_count,
            format_millis(task.next_run_at),
            task.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default(),
        );
    }
    Ok(())
}

pub async fn enqueue_pull(config: &Config, json: bool) -> Result<()> {
    let queue = open(config)?;
    let task = SyncTask::pull_all();
    queue.enqueue(&task).await?;

    if json {
        println!("{}", serde_json::json!({ "enqueued": task.id() }));
    } else {
        println!("{}", success(&format!("Enqueued full refresh {}", task.id())));
        println!("  Run `mindlog sync --once` or keep the engine running to apply it.");
    }
    Ok(())
}

pub async fn cancel_record(config: &Config, local_id: i64, json: bool) -> Result<()> {
    let queue = open(config)?;
    let cancelled = queue.cancel_tasks_for_local_id(local_id).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "local_id": local_id, "cancelled": cancelled })
        );
    } else if cancelled == 0 {
        println!("No outstanding tasks for record {}.", local_id);
    } else {
        println!(
            "{}",
            success(&format!("Cancelled {} task(s) of record {}", cancelled, local_id))
        );
    }
    Ok(())
}

pub async fn cleanup(config: &Config, older_than_hours: Option<u64>, json: bool) -> Result<()> {
    let queue = open(config)?;
    let older_than_ms = match older_than_hours {
        Some(hours) => (hours as i64).saturating_mul(3_600_000),
        None => config.sync.completed_retention_ms(),
    };
    let deleted = queue.cleanup_completed_tasks(older_than_ms).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": deleted }));
    } else {
        println!("{}", success(&format!("Deleted {} finished task(s)", deleted)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindlog_core::JournalRecord;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let queue = open(&config).unwrap();
        queue
            .enqueue(&SyncTask::create_record(JournalRecord::new(1, "a", "b")))
            .await
            .unwrap();
        queue.enqueue(&SyncTask::pull_all()).await.unwrap();

        let summary = summarize(&queue, &config).await.unwrap();
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.running, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_cancel_record_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let task = SyncTask::toggle_favorite(5, None, true);
        open(&config).unwrap().enqueue(&task).await.unwrap();

        cancel_record(&config, 5, true).await.unwrap();

        let row = open(&config).unwrap().get_task(task.id()).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_enqueue_pull_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        enqueue_pull(&config, true).await.unwrap();

        let queue = open(&config).unwrap();
        let pending = queue.list_tasks(Some(TaskState::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, None);
    }
}
