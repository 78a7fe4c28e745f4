//! # Test Support
//!
//! Mock collaborators and helpers for unit and integration tests.
//!
//! ## 模块结构
//!
//! - `mocks`: in-memory implementations of the collaborator traits
//!   - `MockRemoteBackend`: record rows in a `Vec`
//!   - `MockObjectStorage`: objects in a `BTreeMap`
//!   - `MockMediaPipeline`: attachment bytes derived from the path
//!   - `MockProcessor`: scripted task outcomes with concurrency tracking
//!   - `MockScheduler`: records scheduling requests
//!
//! Compiled for this crate's tests and, through the `test-utils` feature, for
//! downstream test crates.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mindlog_core::test::mocks::MockProcessor;
//!
//! let processor = Arc::new(MockProcessor::new());
//! processor.fail_task("update_record-7-abc");
//! ```

pub mod mocks;

/// 测试工具函数
pub mod utils {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::types::JournalRecord;

    /// Run `f` with a deadline
    pub async fn with_timeout<T, F>(duration: Duration, f: F) -> Result<T, String>
    where
        F: std::future::Future<Output = T>,
    {
        timeout(duration, f)
            .await
            .map_err(|_| format!("Test timed out after {:?}", duration))
    }

    /// Run `f` with a 5 second deadline
    pub async fn with_default_timeout<T, F>(f: F) -> Result<T, String>
    where
        F: std::future::Future<Output = T>,
    {
        with_timeout(Duration::from_secs(5), f).await
    }

    /// Plain record without attachments
    pub fn sample_record(local_id: i64) -> JournalRecord {
        JournalRecord::new(local_id, format!("Entry {}", local_id), "Today was fine.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_with_timeout() {
        let result = utils::with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));

        let result = utils::with_timeout(
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_record() {
        let record = utils::sample_record(3);
        assert_eq!(record.local_id, 3);
        assert_eq!(record.title, "Entry 3");
    }
}
