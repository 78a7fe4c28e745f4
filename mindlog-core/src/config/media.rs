//! # Media Configuration

use serde::{Deserialize, Serialize};

use super::{require_nonzero, validation_error, ValidateConfig};
use crate::error::Result;

/// Upload pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    /// Longest image edge after re-encoding
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Files larger than this are refused
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_image_dimension: default_max_image_dimension(),
            jpeg_quality: default_jpeg_quality(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ValidateConfig for MediaConfig {
    fn validate(&self) -> Result<()> {
        require_nonzero(self.max_image_dimension as u64, "max_image_dimension")?;
        require_nonzero(self.max_upload_bytes, "max_upload_bytes")?;
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(validation_error(format!(
                "jpeg_quality must be within 1..=100 (got {})",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

fn default_max_image_dimension() -> u32 {
    1600
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_max_upload_bytes() -> u64 {
    25 * 1024 * 1024
}
