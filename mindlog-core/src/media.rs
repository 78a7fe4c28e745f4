//! # Media Pipeline
//!
//! Turns attachment files into upload-ready bytes.
//!
//! Images are optionally downscaled so their longest edge fits
//! `max_image_dimension` and re-encoded as JPEG. Decoding and encoding run on the
//! blocking pool.

use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

use crate::config::MediaConfig;
use crate::error::{Result, SyncError};

/// Bytes ready for [`ObjectStorage::upload`](crate::remote::ObjectStorage::upload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Lower-case extension without the dot
    pub extension: String,
}

/// Attachment preparation
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Image bytes, re-encoded when `compress` is set
    async fn prepare_image(&self, path: &Path, compress: bool) -> Result<PreparedMedia>;

    /// Raw file bytes (voice notes, uncompressed images)
    async fn read_file(&self, path: &Path) -> Result<PreparedMedia>;
}

/// Default pipeline built on the `image` crate
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    max_dimension: u32,
    quality: u8,
    max_bytes: u64,
}

impl Default for ImagePipeline {
    fn default() -> Self {
        Self::from_config(&MediaConfig::default())
    }
}

impl ImagePipeline {
    pub fn new(max_dimension: u32, quality: u8, max_bytes: u64) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            quality: quality.clamp(1, 100),
            max_bytes,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.max_image_dimension,
            config.jpeg_quality,
            config.max_upload_bytes,
        )
    }

    async fn checked_size(&self, path: &Path) -> Result<u64> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::not_found(format!("media file {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(SyncError::media(format!("{} is not a file", path.display())));
        }
        if metadata.len() > self.max_bytes {
            return Err(SyncError::media(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                metadata.len(),
                self.max_bytes
            )));
        }
        Ok(metadata.len())
    }
}

#[async_trait]
impl MediaPipeline for ImagePipeline {
    async fn prepare_image(&self, path: &Path, compress: bool) -> Result<PreparedMedia> {
        if !compress {
            return self.read_file(path).await;
        }
        self.checked_size(path).await?;

        let bytes = tokio::fs::read(path).await?;
        let max_dimension = self.max_dimension;
        let quality = self.quality;
        let encoded = tokio::task::spawn_blocking(move || reencode(&bytes, max_dimension, quality))
            .await
            .map_err(|e| SyncError::media(format!("image task failed: {}", e)))??;

        debug!("Re-encoded {} to {} bytes", path.display(), encoded.len());
        Ok(PreparedMedia {
            bytes: encoded,
            content_type: "image/jpeg".to_string(),
            extension: "jpg".to_string(),
        })
    }

    async fn read_file(&self, path: &Path) -> Result<PreparedMedia> {
        self.checked_size(path).await?;
        let bytes = tokio::fs::read(path).await?;
        let extension = extension_of(path);
        Ok(PreparedMedia {
            bytes,
            content_type: content_type_for(&extension).to_string(),
            extension,
        })
    }
}

/// Downscale to fit `max_dimension` and encode as JPEG
fn reencode(bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = img.dimensions();
    let img = if w > max_dimension || h > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

/// MIME type for the attachment extensions the app produces
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}
