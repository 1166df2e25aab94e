use crate::media_source::Asset;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Errors that can occur while extracting a video frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to run frame extractor: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Frame extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("No frame at offset {offset_ms}ms")]
    NoFrame { offset_ms: u128 },
}

/// Pulls still frames out of video assets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Encoded image of the frame shown at `offset`
    async fn extract_frame(&self, asset: &Asset, offset: Duration) -> Result<Bytes, FrameError>;
}

/// Frame extractor that shells out to ffmpeg
pub struct FfmpegFrameExtractor {
    binary: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(asset: &Asset, offset: Duration) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", offset.as_secs_f64()),
            "-i".to_string(),
            asset.uri.clone(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "-vcodec".to_string(),
            "mjpeg".to_string(),
            "pipe:1".to_string(),
        ]
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    #[instrument(skip(self, asset), fields(asset_id = %asset.id))]
    async fn extract_frame(&self, asset: &Asset, offset: Duration) -> Result<Bytes, FrameError> {
        let output = Command::new(&self.binary)
            .args(Self::args(asset, offset))
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(FrameError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Seeking past the end succeeds with an empty stream
        if output.stdout.is_empty() {
            return Err(FrameError::NoFrame {
                offset_ms: offset.as_millis(),
            });
        }

        debug!(
            offset_ms = offset.as_millis() as u64,
            size_bytes = output.stdout.len(),
            "Extracted video frame"
        );

        Ok(Bytes::from(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_source::MediaType;
    use chrono::Utc;

    fn video() -> Asset {
        Asset {
            id: "clip.mov".to_string(),
            uri: "/media/Us/clip.mov".to_string(),
            media_type: MediaType::Video,
            created_at: Utc::now(),
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = FfmpegFrameExtractor::args(&video(), Duration::from_millis(1500));

        let seek = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[seek + 1], "1.500");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/media/Us/clip.mov");
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let extractor = FfmpegFrameExtractor::new("/nonexistent/bin/ffmpeg-for-tests");
        let result = extractor.extract_frame(&video(), Duration::ZERO).await;

        assert!(matches!(result, Err(FrameError::Spawn(_))));
    }
}
