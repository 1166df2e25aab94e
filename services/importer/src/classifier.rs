//! Content classification of day groups.
//!
//! Only one representative asset per group is sent to the external service
//! (the first photo, else the first video), and every call goes through a
//! shared rate limiter. Classification never fails the import: any error is
//! logged and turned into [`ClassificationResult::failed`].

use crate::config::ClassifierConfig;
use crate::frame_extractor::{FrameError, FrameExtractor};
use crate::grouping::Group;
use crate::image_prep::{prepare_jpeg_blocking, PrepError};
use crate::media_source::{Asset, LibraryError, MediaLibrary, MediaType};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Description reported when a classification could not be obtained
pub const ANALYSIS_FAILED: &str = "Analysis failed";

/// How sure the service is about its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl TryFrom<String> for Confidence {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            other => Err(format!("unknown confidence level: {other}")),
        }
    }
}

fn default_confidence() -> Confidence {
    Confidence::Low
}

/// Structured answer of the classification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub has_primary_subject: bool,
    pub has_secondary_subject: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: Confidence,
}

impl ClassificationResult {
    /// Result used whenever classification could not be completed
    pub fn failed() -> Self {
        Self {
            has_primary_subject: false,
            has_secondary_subject: false,
            description: ANALYSIS_FAILED.to_string(),
            confidence: Confidence::Low,
        }
    }

    /// Whether the group this result stands for should be imported
    pub fn is_relevant(&self) -> bool {
        self.has_primary_subject || self.has_secondary_subject
    }

    fn has_usable_description(&self) -> bool {
        let description = self.description.trim();
        !description.is_empty() && description != ANALYSIS_FAILED
    }
}

/// Errors that can occur while classifying an asset
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Failed to read asset: {0}")]
    Read(#[from] LibraryError),

    #[error("Failed to extract video frame: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Prep(#[from] PrepError),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse service response: {0}")]
    Parse(String),

    #[error("No video frame could be classified")]
    NoFrames,
}

/// Decides what an asset shows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    /// Classify one asset; failures yield [`ClassificationResult::failed`]
    async fn classify(&self, asset: &Asset) -> ClassificationResult;
}

/// The asset whose classification decides for the whole group
pub fn representative(group: &Group) -> Option<&Asset> {
    group
        .assets
        .iter()
        .find(|a| a.media_type == MediaType::Photo)
        .or_else(|| group.assets.first())
}

/// Combine per-frame results into one result for a video.
///
/// Subject flags are true if any frame says so, confidence is the highest
/// seen and the description is the first usable one. `None` without frames.
pub fn aggregate_frames(frames: &[ClassificationResult]) -> Option<ClassificationResult> {
    if frames.is_empty() {
        return None;
    }

    let description = frames
        .iter()
        .find(|f| f.has_usable_description())
        .map(|f| format!("Video: {}", f.description.trim()))
        .unwrap_or_else(|| "Video".to_string());

    Some(ClassificationResult {
        has_primary_subject: frames.iter().any(|f| f.has_primary_subject),
        has_secondary_subject: frames.iter().any(|f| f.has_secondary_subject),
        description,
        confidence: frames
            .iter()
            .map(|f| f.confidence)
            .max()
            .unwrap_or(Confidence::Low),
    })
}

/// Parse a service response body.
///
/// Accepts a bare JSON object or one embedded in surrounding text.
pub fn parse_response(body: &str) -> Result<ClassificationResult, ClassificationError> {
    if let Ok(result) = serde_json::from_str::<ClassificationResult>(body.trim()) {
        return Ok(result);
    }

    let start = body.find('{');
    let end = body.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&body[start..=end]).map_err(|e| ClassificationError::Parse(e.to_string()))
        }
        _ => Err(ClassificationError::Parse(
            "response contains no JSON object".to_string(),
        )),
    }
}

/// Enforces a minimum interval between consecutive calls
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait if necessary to comply with the rate limit
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    instruction: &'a str,
    image: ImagePayload,
}

#[derive(Serialize)]
struct ImagePayload {
    media_type: &'static str,
    data: String,
}

/// Classifier backed by the HTTP classification service
pub struct HttpClassifier {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    instruction: String,
    library: Arc<dyn MediaLibrary>,
    frames: Arc<dyn FrameExtractor>,
    rate_limiter: RateLimiter,
    target_pixels: u64,
    jpeg_quality: u8,
    max_payload_bytes: usize,
    frame_offsets: Vec<Duration>,
}

impl HttpClassifier {
    pub fn new(
        config: &ClassifierConfig,
        library: Arc<dyn MediaLibrary>,
        frames: Arc<dyn FrameExtractor>,
    ) -> Result<Self, ClassificationError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        info!(
            endpoint = %config.endpoint,
            min_interval_ms = config.min_interval_ms,
            "Classification client initialized"
        );

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            instruction: config.instruction.clone(),
            library,
            frames,
            rate_limiter: RateLimiter::new(config.min_interval()),
            target_pixels: config.target_pixels,
            jpeg_quality: config.jpeg_quality,
            max_payload_bytes: config.max_payload_bytes,
            frame_offsets: config.frame_offsets(),
        })
    }

    async fn classify_photo(&self, asset: &Asset) -> Result<ClassificationResult, ClassificationError> {
        let data = self.library.read_asset(asset).await?;
        self.classify_image(data).await
    }

    async fn classify_video(&self, asset: &Asset) -> Result<ClassificationResult, ClassificationError> {
        let mut frames = Vec::with_capacity(self.frame_offsets.len());

        for offset in &self.frame_offsets {
            let result = match self.frames.extract_frame(asset, *offset).await {
                Ok(frame) => self.classify_image(frame).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(frame_result) => frames.push(frame_result),
                Err(e) => warn!(
                    asset_id = %asset.id,
                    offset_ms = offset.as_millis() as u64,
                    error = %e,
                    "Video frame classification failed"
                ),
            }
        }

        aggregate_frames(&frames).ok_or(ClassificationError::NoFrames)
    }

    async fn classify_image(&self, data: Bytes) -> Result<ClassificationResult, ClassificationError> {
        let prepared = prepare_jpeg_blocking(data, self.target_pixels, self.jpeg_quality).await?;

        if prepared.bytes.len() > self.max_payload_bytes {
            return Err(ClassificationError::PayloadTooLarge {
                size: prepared.bytes.len(),
                limit: self.max_payload_bytes,
            });
        }

        self.request(&prepared.bytes).await
    }

    async fn request(&self, jpeg: &[u8]) -> Result<ClassificationResult, ClassificationError> {
        self.rate_limiter.wait().await;
        metrics::counter!("importer.classifier.calls").increment(1);

        let body = ClassifyRequest {
            instruction: &self.instruction,
            image: ImagePayload {
                media_type: "image/jpeg",
                data: STANDARD.encode(jpeg),
            },
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ClassificationError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_response(&text)
    }
}

#[async_trait]
impl ContentClassifier for HttpClassifier {
    #[instrument(skip(self, asset), fields(asset_id = %asset.id, media_type = asset.media_type.as_str()))]
    async fn classify(&self, asset: &Asset) -> ClassificationResult {
        let outcome = match asset.media_type {
            MediaType::Photo => self.classify_photo(asset).await,
            MediaType::Video => self.classify_video(asset).await,
        };

        match outcome {
            Ok(result) => {
                debug!(
                    relevant = result.is_relevant(),
                    confidence = ?result.confidence,
                    "Asset classified"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, "Classification failed, treating asset as not relevant");
                metrics::counter!("importer.classifier.failures").increment(1);
                ClassificationResult::failed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::MockFrameExtractor;
    use crate::image_prep::tests::png_bytes;
    use crate::media_source::MockMediaLibrary;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn asset(id: &str, media_type: MediaType) -> Asset {
        Asset {
            id: id.to_string(),
            uri: format!("/media/{id}"),
            media_type,
            created_at: Utc::now(),
            width: 0,
            height: 0,
        }
    }

    fn result(primary: bool, secondary: bool, description: &str, confidence: Confidence) -> ClassificationResult {
        ClassificationResult {
            has_primary_subject: primary,
            has_secondary_subject: secondary,
            description: description.to_string(),
            confidence,
        }
    }

    fn test_config(endpoint: String) -> ClassifierConfig {
        ClassifierConfig {
            endpoint,
            api_key: "test-key".to_string(),
            instruction: "describe".to_string(),
            min_interval_ms: 0,
            target_pixels: 1_048_576,
            jpeg_quality: 70,
            max_payload_bytes: 5 * 1024 * 1024,
            frame_offsets_ms: vec![0, 1000, 3000],
            ffmpeg_path: PathBuf::from("ffmpeg"),
            request_timeout_secs: 5,
        }
    }

    fn library_serving_png() -> MockMediaLibrary {
        let mut library = MockMediaLibrary::new();
        library
            .expect_read_asset()
            .returning(|_| Ok(Bytes::from(png_bytes(32, 32))));
        library
    }

    /// Start a fake classification service answering every request with `reply`
    async fn serve(status: StatusCode, reply: &'static str, calls: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/v1/analyze",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(
                        headers.get("authorization").unwrap(),
                        "Bearer test-key"
                    );
                    assert_eq!(body["image"]["media_type"], "image/jpeg");
                    assert!(body["image"]["data"].as_str().unwrap().len() > 0);
                    (status, reply)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}/v1/analyze")
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn test_parse_plain_response() {
        let parsed = parse_response(
            r#"{"hasPrimarySubject": true, "hasSecondarySubject": false, "description": "Two people at the beach", "confidence": "HIGH"}"#,
        )
        .unwrap();

        assert!(parsed.has_primary_subject);
        assert!(!parsed.has_secondary_subject);
        assert_eq!(parsed.confidence, Confidence::High);
        assert!(parsed.is_relevant());
    }

    #[test]
    fn test_parse_embedded_response() {
        let body = "Sure! Here is the analysis:\n```json\n{\"hasPrimarySubject\": false, \"hasSecondarySubject\": true, \"description\": \"A dog\", \"confidence\": \"medium\"}\n```";
        let parsed = parse_response(body).unwrap();

        assert!(parsed.has_secondary_subject);
        assert_eq!(parsed.confidence, Confidence::Medium);
    }

    #[test]
    fn test_parse_garbage_response() {
        assert!(matches!(
            parse_response("no json here"),
            Err(ClassificationError::Parse(_))
        ));
        assert!(matches!(
            parse_response(r#"{"confidence": "certain"}"#),
            Err(ClassificationError::Parse(_))
        ));
    }

    #[test]
    fn test_failed_result() {
        let failed = ClassificationResult::failed();
        assert!(!failed.is_relevant());
        assert_eq!(failed.description, "Analysis failed");
        assert_eq!(failed.confidence, Confidence::Low);
    }

    #[test]
    fn test_representative_prefers_first_photo() {
        let group = Group {
            date_key: "2024-01-15".to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            assets: vec![
                asset("v1", MediaType::Video),
                asset("p1", MediaType::Photo),
                asset("p2", MediaType::Photo),
            ],
        };
        assert_eq!(representative(&group).unwrap().id, "p1");
    }

    #[test]
    fn test_representative_falls_back_to_first_video() {
        let group = Group {
            date_key: "2024-01-15".to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            assets: vec![asset("v1", MediaType::Video), asset("v2", MediaType::Video)],
        };
        assert_eq!(representative(&group).unwrap().id, "v1");

        let empty = Group {
            assets: vec![],
            ..group
        };
        assert!(representative(&empty).is_none());
    }

    #[test]
    fn test_aggregate_frames() {
        let frames = vec![
            result(false, false, "Analysis failed", Confidence::Low),
            result(false, true, "A cat on a sofa", Confidence::Medium),
            result(true, false, "Two people hugging", Confidence::High),
        ];
        let aggregate = aggregate_frames(&frames).unwrap();

        assert!(aggregate.has_primary_subject);
        assert!(aggregate.has_secondary_subject);
        assert_eq!(aggregate.confidence, Confidence::High);
        assert_eq!(aggregate.description, "Video: A cat on a sofa");
    }

    #[test]
    fn test_aggregate_without_frames() {
        assert!(aggregate_frames(&[]).is_none());
    }

    #[tokio::test]
    async fn test_rate_limiter_timing() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        let start = Instant::now();

        limiter.wait().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_classify_photo_over_http() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = serve(
            StatusCode::OK,
            r#"{"hasPrimarySubject": true, "hasSecondarySubject": false, "description": "Dinner together", "confidence": "high"}"#,
            calls.clone(),
        )
        .await;

        let classifier = HttpClassifier::new(
            &test_config(endpoint),
            Arc::new(library_serving_png()),
            Arc::new(MockFrameExtractor::new()),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("p1", MediaType::Photo)).await;

        assert!(outcome.is_relevant());
        assert_eq!(outcome.description, "Dinner together");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_error_fails_soft() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = serve(StatusCode::TOO_MANY_REQUESTS, "slow down", calls.clone()).await;

        let classifier = HttpClassifier::new(
            &test_config(endpoint),
            Arc::new(library_serving_png()),
            Arc::new(MockFrameExtractor::new()),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("p1", MediaType::Photo)).await;

        assert_eq!(outcome, ClassificationResult::failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_not_sent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = serve(StatusCode::OK, "{}", calls.clone()).await;

        let mut config = test_config(endpoint);
        config.max_payload_bytes = 10;

        let classifier = HttpClassifier::new(
            &config,
            Arc::new(library_serving_png()),
            Arc::new(MockFrameExtractor::new()),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("p1", MediaType::Photo)).await;

        assert_eq!(outcome, ClassificationResult::failed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreadable_photo_fails_soft() {
        let mut library = MockMediaLibrary::new();
        library
            .expect_read_asset()
            .returning(|asset| Err(LibraryError::AssetNotFound(asset.id.clone())));

        let classifier = HttpClassifier::new(
            &test_config("http://127.0.0.1:9/unused".to_string()),
            Arc::new(library),
            Arc::new(MockFrameExtractor::new()),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("p1", MediaType::Photo)).await;
        assert_eq!(outcome, ClassificationResult::failed());
    }

    #[tokio::test]
    async fn test_video_frames_are_aggregated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = serve(
            StatusCode::OK,
            r#"{"hasPrimarySubject": false, "hasSecondarySubject": true, "description": "Our dog running", "confidence": "medium"}"#,
            calls.clone(),
        )
        .await;

        let mut frames = MockFrameExtractor::new();
        frames.expect_extract_frame().returning(|_, offset| {
            if offset == Duration::from_millis(3000) {
                Err(FrameError::NoFrame { offset_ms: 3000 })
            } else {
                Ok(Bytes::from(png_bytes(16, 16)))
            }
        });

        let classifier = HttpClassifier::new(
            &test_config(endpoint),
            Arc::new(MockMediaLibrary::new()),
            Arc::new(frames),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("v1", MediaType::Video)).await;

        assert!(outcome.has_secondary_subject);
        assert!(!outcome.has_primary_subject);
        assert_eq!(outcome.confidence, Confidence::Medium);
        assert_eq!(outcome.description, "Video: Our dog running");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_video_without_frames_fails_soft() {
        let mut frames = MockFrameExtractor::new();
        frames
            .expect_extract_frame()
            .times(3)
            .returning(|_, offset| Err(FrameError::NoFrame { offset_ms: offset.as_millis() }));

        let classifier = HttpClassifier::new(
            &test_config("http://127.0.0.1:9/unused".to_string()),
            Arc::new(MockMediaLibrary::new()),
            Arc::new(frames),
        )
        .unwrap();

        let outcome = classifier.classify(&asset("v1", MediaType::Video)).await;
        assert_eq!(outcome, ClassificationResult::failed());
    }
}
