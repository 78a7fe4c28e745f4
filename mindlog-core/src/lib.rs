//! # Mindlog Core
//!
//! Offline-first sync engine of the Mindlog journaling app.
//!
//! Journal records are written locally first; every create, edit, favorite
//! toggle and delete becomes a durable [`SyncTask`] that the [`SyncManager`]
//! delivers to the remote backend once the device is online, with backoff on
//! failure and per-record ordering.
//!
//! ## Architecture
//!
//! - **Types**: journal records, sync tasks and their persisted rows
//! - **Storage**: SQLite task queue and local record store
//! - **Sync**: queue, backoff, entity locks, processor and orchestrator
//! - **Remote**: record API and object storage clients
//! - **Media**: attachment preparation before upload
//! - **Connectivity**: online/offline signal
//! - **Scheduler**: periodic background wake-ups
//! - **Event Bus**: sync lifecycle notifications
//! - **Engine**: wires the default implementations from a [`Config`]
//!
//! ```text
//!  UI ──enqueue──► SyncManager ──► SyncQueue (SQLite)
//!                      │
//!                      └──► RecordSyncProcessor ──► RemoteBackend / ObjectStorage
//! ```

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod media;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(any(test, feature = "test-utils"))]
pub use test::mocks::{MockObjectStorage, MockProcessor, MockRemoteBackend, MockScheduler};

pub use config::{Config, ConfigLoader};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use event_bus::{SyncEvent, SyncEventBus};
pub use sync::{PassReport, SyncManager, SyncProcessor, SyncQueue};
pub use types::{JournalRecord, RemoteRecord, SyncStatus, SyncTask, SyncTaskEntity, TaskKind, TaskState};
