//! Per-entity mutual exclusion.
//!
//! One async mutex per entity key, kept in an LRU table. Only idle locks (no
//! holder, no waiter) are evicted, so the table can temporarily exceed its
//! capacity while many entities are busy.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type EntityLock = Arc<AsyncMutex<()>>;

/// Bounded table of entity locks
pub struct EntityLocks {
    table: Mutex<LruCache<String, EntityLock>>,
    capacity: usize,
}

impl std::fmt::Debug for EntityLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLocks")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl EntityLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.entry(key);
        trace!("Waiting for entity lock {}", key);
        lock.lock_owned().await
    }

    /// Exclusive access to `key` if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Number of locks currently in the table
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> EntityLock {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = table.get(key) {
            return lock.clone();
        }

        let lock: EntityLock = Arc::new(AsyncMutex::new(()));
        table.put(key.to_string(), lock.clone());
        Self::evict_idle(&mut table, self.capacity);
        lock
    }

    fn evict_idle(table: &mut LruCache<String, EntityLock>, capacity: usize) {
        while table.len() > capacity {
            // least recently used first; strong_count == 1 means only the table holds it
            let victim = table
                .iter()
                .rev()
                .find(|(_, lock)| Arc::strong_count(lock) == 1)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    table.pop(&key);
                    trace!("Evicted idle entity lock {}", key);
                }
                None => break,
            }
        }
    }
}
