//! # Sync Event Bus
//!
//! Lifecycle notifications of the sync engine, fanned out over a tokio
//! broadcast channel.
//!
//! ## 设计原则
//!
//! - **无全局单例**: the bus is constructed by the caller and injected into the
//!   [`SyncManager`](crate::sync::SyncManager); any number of buses may coexist.
//! - **发布不阻塞**: publishing with no subscribers is fine; a subscriber that
//!   falls behind loses the oldest events (`RecvError::Lagged`).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::now_millis;

/// Sync lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A processing pass picked up `count` due tasks
    SyncStarted { count: usize, timestamp: i64 },
    /// A processing pass finished
    SyncCompleted {
        success: usize,
        failure: usize,
        timestamp: i64,
    },
    /// A processing pass could not run
    SyncFailed { reason: String, timestamp: i64 },
}

impl SyncEvent {
    pub fn started(count: usize) -> Self {
        SyncEvent::SyncStarted {
            count,
            timestamp: now_millis(),
        }
    }

    pub fn completed(success: usize, failure: usize) -> Self {
        SyncEvent::SyncCompleted {
            success,
            failure,
            timestamp: now_millis(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        SyncEvent::SyncFailed {
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }

    /// Event time, epoch millis
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::SyncStarted { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// Broadcast channel of [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    /// Create new bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber; returns how many received it
    pub fn publish(&self, event: SyncEvent) -> usize {
        trace!("Publishing {:?}", event);
        // Err only means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
