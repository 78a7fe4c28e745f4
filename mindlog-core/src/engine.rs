//! # Sync Engine Assembly
//!
//! Builds a [`SyncManager`] from a [`Config`] with the default collaborators:
//! SQLite stores, the HTTP backend, the `image` pipeline, a TCP reachability
//! probe and the in-process interval scheduler.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::event_bus::SyncEventBus;
use crate::media::ImagePipeline;
use crate::remote::{self, SessionProvider, StaticSession};
use crate::scheduler::IntervalScheduler;
use crate::storage::{LocalRecordStore, RecordDb, TaskDb, TaskStore};
use crate::sync::{ProcessorOptions, RecordSyncProcessor, SyncManager, SyncQueue};

/// A fully wired engine
pub struct SyncEngine {
    pub manager: SyncManager,
    pub records: Arc<RecordDb>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wire the default implementations; the remote section must be configured
    pub fn from_config(config: &Config) -> Result<Self> {
        let sessions: Arc<dyn SessionProvider> = Arc::new(StaticSession::from_config(&config.remote));
        Self::with_sessions(config, sessions)
    }

    /// Like [`from_config`](Self::from_config) with a host-provided session source
    pub fn with_sessions(config: &Config, sessions: Arc<dyn SessionProvider>) -> Result<Self> {
        config.validate()?;

        let queue = open_queue(config)?;
        let records = Arc::new(RecordDb::open_from_config(&config.storage)?);
        let (backend, storage) = remote::http_clients(&config.remote)?;
        let local: Arc<dyn LocalRecordStore> = records.clone();

        let processor = RecordSyncProcessor::new(
            backend,
            storage,
            sessions,
            local,
            Arc::new(ImagePipeline::from_config(&config.media)),
            ProcessorOptions::from_config(&config.sync, &config.remote),
        );

        let connectivity = ConnectivityMonitor::from_config(&config.connectivity, &config.remote);
        let scheduler = IntervalScheduler::with_connectivity(connectivity.clone());

        let manager = SyncManager::builder(queue, Arc::new(processor))
            .config(config.sync.clone())
            .connectivity(connectivity)
            .scheduler(Arc::new(scheduler))
            .events(SyncEventBus::new(config.sync.event_channel_capacity))
            .build();

        info!("Sync engine ready (backend {})", config.remote.base());
        Ok(Self { manager, records })
    }
}

/// The durable queue alone, for tooling that never talks to the backend
pub fn open_queue(config: &Config) -> Result<SyncQueue> {
    let store: Arc<dyn TaskStore> = Arc::new(TaskDb::open_from_config(&config.storage)?);
    Ok(SyncQueue::from_config(store, &config.sync))
}
