use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while storing an object
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Multipart upload of {key} failed: {message}")]
    Multipart { key: String, message: String },
}

/// Durable binary storage
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `body` under `key` and return its durable URL.
    ///
    /// `on_progress` receives `(bytes_transferred, total_bytes)`.
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<String, StorageError>;
}

/// S3 blob storage for imported media
pub struct S3BlobStorage {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3BlobStorage {
    /// Create a new S3 blob storage
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob storage initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Durable URL of a stored object
    pub fn object_url(&self, key: &str) -> String {
        object_url(
            self.config.public_base_url.as_deref(),
            &self.bucket,
            &self.config.region,
            key,
        )
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    /// Multipart upload for large files, reporting progress after every part
    async fn multipart_upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), StorageError> {
        let multipart_error = |message: String| StorageError::Multipart {
            key: key.to_string(),
            message,
        };

        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| multipart_error(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| multipart_error("no upload ID in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &body, on_progress).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| multipart_error(DisplayErrorContext(&e).to_string()))?;

                Ok(())
            }
            Err(message) => {
                // Parts already stored are billed until the upload is aborted
                if let Err(e) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
                }
                Err(multipart_error(message))
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &Bytes,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<Vec<CompletedPart>, String> {
        let total = body.len() as u64;
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut transferred = 0u64;

        for (index, start) in (0..body.len()).step_by(part_size).enumerate() {
            let end = (start + part_size).min(body.len());
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice(start..end)))
                .send()
                .await
                .map_err(|e| format!("part {part_number}: {}", DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            transferred += (end - start) as u64;
            on_progress(transferred, total);
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStorage for S3BlobStorage {
    #[instrument(skip(self, body, on_progress), fields(key = %key, size_bytes = body.len()))]
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<String, StorageError> {
        let total = body.len() as u64;
        on_progress(0, total);

        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type, on_progress)
                .await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
            on_progress(total, total);
        }

        debug!(key = %key, "Object uploaded");

        Ok(self.object_url(key))
    }
}

/// URL under which an object is served
fn object_url(public_base_url: Option<&str>, bucket: &str, region: &str, key: &str) -> String {
    match public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

/// Get content type for a file extension
pub fn get_content_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}
