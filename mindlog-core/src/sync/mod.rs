//! # Sync Engine
//!
//! ## 模块结构
//!
//! - `queue`: durable task queue over a [`TaskStore`](crate::storage::TaskStore)
//! - `backoff`: retry delays with jitter
//! - `locks`: per-entity mutual exclusion
//! - `processor`: executes one task against the remote backend
//! - `manager`: the orchestrator (run loop, passes, status, events)

pub mod backoff;
pub mod locks;
pub mod manager;
pub mod processor;
pub mod queue;

pub use backoff::BackoffPolicy;
pub use locks::EntityLocks;
pub use manager::{PassReport, SyncManager, SyncManagerBuilder};
pub use processor::{ProcessorOptions, RecordSyncProcessor, SyncProcessor};
pub use queue::SyncQueue;
