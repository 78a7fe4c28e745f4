//! # Core Types
//!
//! Domain records, sync tasks and their persisted representation.
//!
//! ## Task lifecycle
//!
//! ```text
//!  enqueue ──► PENDING ──claim──► RUNNING ──ok──► COMPLETED ──cleanup──► (deleted)
//!                 ▲                  │
//!                 └──── backoff ─────┤ err
//!                                    └──(max_attempts)──► FAILED
//!  cancel_tasks_for_local_id: PENDING | RUNNING ──► CANCELLED
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A journal entry as stored on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Device-local primary key
    pub local_id: i64,
    /// Remote primary key once the record has been created remotely
    #[serde(default)]
    pub remote_id: Option<String>,
    pub title: String,
    pub content: String,
    /// Mood score picked by the user (1..=5)
    #[serde(default)]
    pub mood: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Local image files attached to the entry
    #[serde(default)]
    pub image_paths: Vec<String>,
    /// Remote URLs of uploaded images
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Local voice note
    #[serde(default)]
    pub audio_path: Option<String>,
    /// Remote URL of the uploaded voice note
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JournalRecord {
    /// Create a new record with the given local id and text
    pub fn new(local_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            local_id,
            remote_id: None,
            title: title.into(),
            content: content.into(),
            mood: None,
            tags: Vec::new(),
            image_paths: Vec::new(),
            image_urls: Vec::new(),
            audio_path: None,
            audio_url: None,
            is_favorite: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set mood score
    pub fn with_mood(mut self, mood: i32) -> Self {
        self.mood = Some(mood);
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Attach a local image file
    pub fn with_image(mut self, path: impl Into<String>) -> Self {
        self.image_paths.push(path.into());
        self
    }

    /// Attach a local voice note
    pub fn with_audio(mut self, path: impl Into<String>) -> Self {
        self.audio_path = Some(path.into());
        self
    }
}

/// A journal entry as stored by the remote backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Remote primary key (absent on create requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    /// The creating device's local id, used to make creates idempotent
    pub local_id: i64,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub mood: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RemoteRecord {
    /// Build the remote representation of a local record
    pub fn from_journal(
        record: &JournalRecord,
        user_id: &str,
        image_urls: Vec<String>,
        audio_url: Option<String>,
    ) -> Self {
        Self {
            id: record.remote_id.clone(),
            user_id: user_id.to_string(),
            local_id: record.local_id,
            title: record.title.clone(),
            content: record.content.clone(),
            mood: record.mood,
            tags: record.tags.clone(),
            image_urls,
            audio_url,
            is_favorite: record.is_favorite,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Discriminator of a [`SyncTask`], persisted in the `task_type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    CreateRecord,
    UpdateRecord,
    ToggleFavorite,
    DeleteRecord,
    PullAll,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateRecord => "create_record",
            TaskKind::UpdateRecord => "update_record",
            TaskKind::ToggleFavorite => "toggle_favorite",
            TaskKind::DeleteRecord => "delete_record",
            TaskKind::PullAll => "pull_all",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create_record" => Ok(TaskKind::CreateRecord),
            "update_record" => Ok(TaskKind::UpdateRecord),
            "toggle_favorite" => Ok(TaskKind::ToggleFavorite),
            "delete_record" => Ok(TaskKind::DeleteRecord),
            "pull_all" => Ok(TaskKind::PullAll),
            other => Err(SyncError::invalid_input(format!("Unknown task type: {}", other))),
        }
    }
}

/// One unit of outbound synchronization work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncTask {
    /// Create the record remotely (uploading its attachments first)
    CreateRecord {
        id: String,
        local_id: i64,
        record: JournalRecord,
    },
    /// Push the latest local state of the record
    UpdateRecord {
        id: String,
        local_id: i64,
        record: JournalRecord,
    },
    /// Set the favorite flag of the record
    ToggleFavorite {
        id: String,
        local_id: i64,
        #[serde(default)]
        remote_id: Option<String>,
        is_favorite: bool,
    },
    /// Delete the record and its uploaded media
    DeleteRecord {
        id: String,
        local_id: i64,
        #[serde(default)]
        remote_id: Option<String>,
    },
    /// Full refresh of local records from the remote system of record
    PullAll { id: String },
}

fn new_task_id(kind: TaskKind, local_id: Option<i64>) -> String {
    match local_id {
        Some(local_id) => format!("{}-{}-{}", kind.as_str(), local_id, Uuid::new_v4()),
        None => format!("{}-{}", kind.as_str(), Uuid::new_v4()),
    }
}

impl SyncTask {
    pub fn create_record(record: JournalRecord) -> Self {
        SyncTask::CreateRecord {
            id: new_task_id(TaskKind::CreateRecord, Some(record.local_id)),
            local_id: record.local_id,
            record,
        }
    }

    pub fn update_record(record: JournalRecord) -> Self {
        SyncTask::UpdateRecord {
            id: new_task_id(TaskKind::UpdateRecord, Some(record.local_id)),
            local_id: record.local_id,
            record,
        }
    }

    pub fn toggle_favorite(local_id: i64, remote_id: Option<String>, is_favorite: bool) -> Self {
        SyncTask::ToggleFavorite {
            id: new_task_id(TaskKind::ToggleFavorite, Some(local_id)),
            local_id,
            remote_id,
            is_favorite,
        }
    }

    pub fn delete_record(local_id: i64, remote_id: Option<String>) -> Self {
        SyncTask::DeleteRecord {
            id: new_task_id(TaskKind::DeleteRecord, Some(local_id)),
            local_id,
            remote_id,
        }
    }

    pub fn pull_all() -> Self {
        SyncTask::PullAll {
            id: new_task_id(TaskKind::PullAll, None),
        }
    }

    /// Task occurrence id
    pub fn id(&self) -> &str {
        match self {
            SyncTask::CreateRecord { id, .. }
            | SyncTask::UpdateRecord { id, .. }
            | SyncTask::ToggleFavorite { id, .. }
            | SyncTask::DeleteRecord { id, .. }
            | SyncTask::PullAll { id } => id,
        }
    }

    /// The domain record this task touches, if any
    pub fn local_id(&self) -> Option<i64> {
        match self {
            SyncTask::CreateRecord { local_id, .. }
            | SyncTask::UpdateRecord { local_id, .. }
            | SyncTask::ToggleFavorite { local_id, .. }
            | SyncTask::DeleteRecord { local_id, .. } => Some(*local_id),
            SyncTask::PullAll { .. } => None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            SyncTask::CreateRecord { .. } => TaskKind::CreateRecord,
            SyncTask::UpdateRecord { .. } => TaskKind::UpdateRecord,
            SyncTask::ToggleFavorite { .. } => TaskKind::ToggleFavorite,
            SyncTask::DeleteRecord { .. } => TaskKind::DeleteRecord,
            SyncTask::PullAll { .. } => TaskKind::PullAll,
        }
    }

    /// Serialize into the persisted payload format
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the persisted payload format
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Key of the per-entity lock serializing tasks of one record
pub fn lock_key(kind: TaskKind, local_id: Option<i64>) -> String {
    match local_id {
        Some(local_id) => format!("record:{}", local_id),
        None => kind.as_str().to_string(),
    }
}

/// State of a persisted task row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting until `next_run_at`
    Pending,
    /// Claimed by the orchestrator
    Running,
    /// Terminal success
    Completed,
    /// Terminal failure (attempt budget exhausted)
    Failed,
    /// Terminal, the record went away before the task ran
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskState::Pending),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            "CANCELLED" => Ok(TaskState::Cancelled),
            other => Err(SyncError::invalid_input(format!("Unknown task state: {}", other))),
        }
    }
}

/// Persisted representation of a [`SyncTask`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncTaskEntity {
    pub id: String,
    pub task_type: TaskKind,
    pub payload: String,
    pub state: TaskState,
    pub attempt_count: u32,
    /// Due time, epoch millis
    pub next_run_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub local_id: Option<i64>,
    /// Bumped each time the same id is enqueued again
    pub revision: i64,
    pub last_error: Option<String>,
}

impl SyncTaskEntity {
    /// Decode the payload back into a task
    pub fn decode(&self) -> Result<SyncTask> {
        SyncTask::from_payload(&self.payload)
    }

    pub fn lock_key(&self) -> String {
        lock_key(self.task_type, self.local_id)
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.state == TaskState::Pending && self.next_run_at <= now
    }
}

impl Serialize for TaskKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Aggregate sync status published to the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// At least one task is RUNNING
    pub running: bool,
    pub pending_count: u64,
    /// Set when the last pass left nothing pending
    pub last_sync_time: Option<i64>,
}
