//! # Mock Media Pipeline

use std::path::Path;

use async_trait::async_trait;

use super::MockCallTracker;
use crate::error::{Result, SyncError};
use crate::media::{content_type_for, MediaPipeline, PreparedMedia};

/// Attachment bytes are the path itself; paths containing `missing` do not exist
#[derive(Debug, Clone, Default)]
pub struct MockMediaPipeline {
    tracker: MockCallTracker,
}

impl MockMediaPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &MockCallTracker {
        &self.tracker
    }

    fn load(&self, path: &Path) -> Result<(Vec<u8>, String)> {
        let display = path.display().to_string();
        if display.contains("missing") {
            return Err(SyncError::not_found(format!("media file {}", display)));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        Ok((display.into_bytes(), extension))
    }
}

#[async_trait]
impl MediaPipeline for MockMediaPipeline {
    async fn prepare_image(&self, path: &Path, compress: bool) -> Result<PreparedMedia> {
        self.tracker
            .record("prepare_image", vec![path.display().to_string(), compress.to_string()]);
        let (bytes, extension) = self.load(path)?;
        let extension = if compress { "jpg".to_string() } else { extension };
        Ok(PreparedMedia {
            bytes,
            content_type: content_type_for(&extension).to_string(),
            extension,
        })
    }

    async fn read_file(&self, path: &Path) -> Result<PreparedMedia> {
        self.tracker
            .record("read_file", vec![path.display().to_string()]);
        let (bytes, extension) = self.load(path)?;
        Ok(PreparedMedia {
            bytes,
            content_type: content_type_for(&extension).to_string(),
            extension,
        })
    }
}
