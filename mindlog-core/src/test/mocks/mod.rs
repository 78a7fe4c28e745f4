//! # Mock Implementations
//!
//! 可验证的 Mock 实现，用于单元测试中的依赖隔离。
//!
//! | Mock | Trait | 关键能力 |
//! |------|-------|----------|
//! | `MockRemoteBackend` | `RemoteBackend` | row store, injected failures |
//! | `MockObjectStorage` | `ObjectStorage` | object map, signed URLs |
//! | `MockMediaPipeline` | `MediaPipeline` | deterministic bytes, missing files |
//! | `MockProcessor` | `SyncProcessor` | scripted failures, delays, in-flight counts |
//! | `MockScheduler` | `PlatformScheduler` | request log, scheduling failure |
//!
//! Every mock records its calls in a [`MockCallTracker`].

pub mod media;
pub mod processor;
pub mod remote;
pub mod scheduler;

pub use media::MockMediaPipeline;
pub use processor::MockProcessor;
pub use remote::{MockObjectStorage, MockRemoteBackend};
pub use scheduler::MockScheduler;

use std::sync::{Arc, Mutex};

/// Ordered log of `(method, args)` pairs shared by a mock and its clones
#[derive(Debug, Default, Clone)]
pub struct MockCallTracker {
    log: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl MockCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: impl Into<String>, args: Vec<String>) {
        self.log.lock().unwrap().push((method.into(), args));
    }

    /// Arguments of every call to `method`, oldest first
    pub fn args_of(&self, method: &str) -> Vec<Vec<String>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn total(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn assert_call_count(&self, method: &str, expected: usize) {
        let seen = self.count(method);
        assert!(
            seen == expected,
            "{}: expected {} call(s), saw {}",
            method,
            expected,
            seen
        );
    }

    pub fn assert_not_called(&self, method: &str) {
        self.assert_call_count(method, 0);
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_tracker() {
        let tracker = MockCallTracker::new();
        tracker.record("upload", vec!["u/1/a.jpg".to_string()]);
        tracker.record("upload", vec!["u/1/b.jpg".to_string()]);
        tracker.record("delete", vec![]);

        tracker.assert_call_count("upload", 2);
        tracker.assert_call_count("delete", 1);
        tracker.assert_not_called("list");
        assert_eq!(tracker.args_of("upload")[1][0], "u/1/b.jpg");
        assert_eq!(tracker.total(), 3);

        tracker.clear();
        assert_eq!(tracker.total(), 0);
    }
}
