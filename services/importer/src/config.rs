use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the importer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Media library configuration
    pub media_source: MediaSourceConfig,
    /// Content classification service configuration
    pub classifier: ClassifierConfig,
    /// Upload preprocessing configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Import run configuration
    pub import: ImportConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port, disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Media library configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaSourceConfig {
    /// Library root; every sub-directory is a collection
    pub root: PathBuf,
    /// Assets requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Hard cap on assets listed per run
    #[serde(default = "default_max_assets")]
    pub max_assets: usize,
}

/// Content classification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Classification endpoint URL
    pub endpoint: String,
    /// Static API key sent as a bearer token
    pub api_key: String,
    /// Instruction sent along with every image
    #[serde(default = "default_instruction")]
    pub instruction: String,
    /// Minimum delay between two service calls in milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Pixel budget for the image sent to the service
    #[serde(default = "default_target_pixels")]
    pub target_pixels: u64,
    /// JPEG quality (1-100) for the image sent to the service
    #[serde(default = "default_classifier_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Largest payload accepted after preprocessing (5MB default)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Offsets of the video frames that get sampled, in milliseconds
    #[serde(default = "default_frame_offsets_ms")]
    pub frame_offsets_ms: Vec<u64>,
    /// Path of the ffmpeg binary used for frame extraction
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Upload preprocessing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Pixel budget for uploaded photos
    #[serde(default = "default_photo_max_pixels")]
    pub photo_max_pixels: u64,
    /// JPEG quality (1-100) for uploaded photos
    #[serde(default = "default_photo_jpeg_quality")]
    pub photo_jpeg_quality: u8,
    /// Uploads in flight within one group (1 = sequential)
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for media storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public URL prefix for stored objects (CDN or bucket website)
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Parameters of the import run
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// Name of the collection to import (matched case-insensitively)
    pub collection_name: String,
    /// User the memories are created by
    pub owner_id: String,
    /// Couple/group the memories belong to
    pub owner_group_id: String,
    /// Ask the classification service before importing a day
    #[serde(default = "default_true")]
    pub classify_enabled: bool,
    /// Tag added to every imported memory
    #[serde(default = "default_provenance_tag")]
    pub provenance_tag: String,
}

// Default value functions
fn default_service_name() -> String {
    "keepsake-importer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_max_assets() -> usize {
    50_000
}

fn default_instruction() -> String {
    "Look at this photo and answer in JSON with the fields hasPrimarySubject, \
     hasSecondarySubject, description and confidence (high, medium or low). \
     The primary subject is the couple, the secondary subject is a pet or a place \
     they share."
        .to_string()
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_target_pixels() -> u64 {
    1024 * 1024 // ~1 megapixel
}

fn default_classifier_jpeg_quality() -> u8 {
    70
}

fn default_max_payload_bytes() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_frame_offsets_ms() -> Vec<u64> {
    vec![0, 1000, 3000]
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_photo_max_pixels() -> u64 {
    4 * 1024 * 1024
}

fn default_photo_jpeg_quality() -> u8 {
    85
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_provenance_tag() -> String {
    "imported".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "keepsake-importer")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/importer").required(false))
            .add_source(config::File::with_name("/etc/keepsake/importer").required(false))
            // Override with environment variables
            // IMPORTER__IMPORT__COLLECTION_NAME -> import.collection_name
            .add_source(
                config::Environment::with_prefix("IMPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl ClassifierConfig {
    /// Minimum delay between two service calls
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Video sampling offsets as Durations
    pub fn frame_offsets(&self) -> Vec<Duration> {
        self.frame_offsets_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            photo_max_pixels: default_photo_max_pixels(),
            photo_jpeg_quality: default_photo_jpeg_quality(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl MediaSourceConfig {
    /// Configuration with the default page size and asset cap
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: default_page_size(),
            max_assets: default_max_assets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_page_size(), 1000);
        assert_eq!(default_max_assets(), 50_000);
        assert_eq!(default_min_interval_ms(), 1000);
        assert_eq!(default_max_payload_bytes(), 5 * 1024 * 1024);
        assert_eq!(default_upload_concurrency(), 1);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [media_source]
                root = "/srv/media"

                [classifier]
                endpoint = "https://classifier.example.com/v1/analyze"
                api_key = "secret"

                [s3]
                bucket = "memories"

                [database]
                url = "postgres://localhost/keepsake"

                [import]
                collection_name = "Us"
                owner_id = "user-1"
                owner_group_id = "couple-1"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.service.name, "keepsake-importer");
        assert_eq!(config.media_source.page_size, 1000);
        assert_eq!(config.classifier.frame_offsets_ms, vec![0, 1000, 3000]);
        assert_eq!(config.classifier.min_interval(), Duration::from_secs(1));
        assert_eq!(config.upload.photo_jpeg_quality, 85);
        assert_eq!(config.s3.region, "us-east-1");
        assert!(config.import.classify_enabled);
        assert_eq!(config.import.provenance_tag, "imported");
    }
}
