use crate::blob_storage::{get_content_type, BlobStorage};
use crate::config::UploadConfig;
use crate::image_prep::prepare_jpeg_blocking;
use crate::media_source::{Asset, MediaLibrary, MediaType};
use bytes::Bytes;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A successfully stored asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedMedia {
    pub asset_id: String,
    pub remote_url: String,
    pub media_type: MediaType,
}

/// Upload failure of a single asset
#[derive(Debug, Clone, Error)]
#[error("Upload failed for asset {asset_id}: {message}")]
pub struct UploadError {
    pub asset_id: String,
    pub message: String,
}

impl UploadError {
    fn new(asset: &Asset, error: impl std::fmt::Display) -> Self {
        Self {
            asset_id: asset.id.clone(),
            message: error.to_string(),
        }
    }
}

/// Uploads asset bytes to blob storage
pub struct UploadCoordinator {
    library: Arc<dyn MediaLibrary>,
    storage: Arc<dyn BlobStorage>,
    photo_max_pixels: u64,
    photo_jpeg_quality: u8,
}

impl UploadCoordinator {
    pub fn new(
        library: Arc<dyn MediaLibrary>,
        storage: Arc<dyn BlobStorage>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            library,
            storage,
            photo_max_pixels: config.photo_max_pixels,
            photo_jpeg_quality: config.photo_jpeg_quality,
        }
    }

    /// Upload one asset, reporting the transferred fraction in `[0, 1]`
    #[instrument(skip(self, asset, on_progress), fields(asset_id = %asset.id))]
    pub async fn upload(
        &self,
        asset: &Asset,
        owner_id: &str,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<UploadedMedia, UploadError> {
        let started = Instant::now();

        let data = self
            .library
            .read_asset(asset)
            .await
            .map_err(|e| UploadError::new(asset, e))?;

        let (body, extension) = self.prepare(asset, data).await;
        let key = object_key(owner_id, asset, &extension);

        let report = |transferred: u64, total: u64| {
            let fraction = if total == 0 {
                1.0
            } else {
                transferred as f64 / total as f64
            };
            on_progress(fraction.clamp(0.0, 1.0));
        };

        let remote_url = self
            .storage
            .upload(&key, body, get_content_type(&extension), &report)
            .await
            .map_err(|e| UploadError::new(asset, e))?;

        on_progress(1.0);
        metrics::histogram!("importer.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        debug!(key = %key, remote_url = %remote_url, "Asset uploaded");

        Ok(UploadedMedia {
            asset_id: asset.id.clone(),
            remote_url,
            media_type: asset.media_type,
        })
    }

    /// Recompress photos; videos and undecodable photos go up unchanged
    async fn prepare(&self, asset: &Asset, data: Bytes) -> (Bytes, String) {
        let original_extension = extension_of(&asset.uri).unwrap_or_else(|| match asset.media_type {
            MediaType::Photo => "jpg".to_string(),
            MediaType::Video => "mp4".to_string(),
        });

        if asset.media_type == MediaType::Video {
            return (data, original_extension);
        }

        match prepare_jpeg_blocking(data.clone(), self.photo_max_pixels, self.photo_jpeg_quality).await {
            Ok(prepared) => {
                debug!(
                    original_bytes = data.len(),
                    prepared_bytes = prepared.bytes.len(),
                    width = prepared.width,
                    height = prepared.height,
                    "Photo recompressed"
                );
                (prepared.bytes, "jpg".to_string())
            }
            Err(e) => {
                warn!(asset_id = %asset.id, error = %e, "Photo could not be recompressed, uploading original");
                (data, original_extension)
            }
        }
    }
}

/// Storage key for an asset.
/// Format: memories/{owner_id}/{YYYY-MM-DD}/{HHMMSSmmm}_{stem}_{upload_id}.{ext}
///
/// Every call yields a fresh key, so distinct assets (and re-imports of the
/// same asset) never overwrite each other.
pub fn object_key(owner_id: &str, asset: &Asset, extension: &str) -> String {
    let captured = asset.created_at.with_timezone(&Local);
    let stem = Path::new(&asset.id)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| asset.id.clone());

    format!(
        "memories/{owner}/{date}/{time}_{stem}_{upload_id}.{ext}",
        owner = sanitize_path_component(owner_id),
        date = captured.format("%Y-%m-%d"),
        time = captured.format("%H%M%S%3f"),
        stem = sanitize_path_component(&stem),
        upload_id = Uuid::new_v4().simple(),
        ext = sanitize_path_component(&extension.to_lowercase()),
    )
}

fn extension_of(uri: &str) -> Option<String> {
    Path::new(uri)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
