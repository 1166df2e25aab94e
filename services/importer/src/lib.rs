//! Keepsake Importer
//!
//! Batch import of a personal media collection into the Keepsake shared
//! journal. A run lists one collection of the media library, groups its assets
//! by local capture day, optionally asks a content classification service
//! whether a day is worth keeping, uploads the media of each kept day to S3 and
//! stores one memory record per day in PostgreSQL.
//!
//! ## Features
//!
//! - **Paged Listing**: Cursor pagination with a hard cap on the number of
//!   assets per run, reported back as a truncation flag
//! - **Day Grouping**: One memory per local calendar day, in listing order
//! - **Fail-Soft Classification**: Rate-limited HTTP classifier, video frames
//!   sampled with ffmpeg and aggregated; any failure means "not relevant"
//! - **Resilient Uploads**: Photos recompressed before upload, large objects
//!   sent as S3 multipart uploads, per-asset failures recorded without
//!   stopping the run
//! - **Progress Events**: Progress, upload progress, errors and the final
//!   summary are streamed over a channel; runs can be cancelled
//!
//! ## Architecture
//!
//! ```text
//! Media Library              Classification            S3 Bucket
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Collection   │           │ HTTP         │          │ memories/    │
//! │ (directory)  │           │ Classifier   │          │   {owner}/   │
//! └──────────────┘           └──────────────┘          │   {date}/    │
//!        │                          ▲                  └──────────────┘
//!        ▼                          │                         ▲
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ Media        │──────────▶│ Batch        │──────────▶┌──────────────┐
//! │ Source       │  groups   │ Importer     │           │ Upload       │
//! └──────────────┘           └──────────────┘           │ Coordinator  │
//!                                   │                   └──────────────┘
//!                     events ◀──────┤
//!                                   ▼
//!                            ┌──────────────┐          PostgreSQL
//!                            │ Record       │─────────▶┌──────────────┐
//!                            │ Store        │          │ memories     │
//!                            └──────────────┘          └──────────────┘
//! ```

pub mod batch;
pub mod blob_storage;
pub mod classifier;
pub mod config;
pub mod directory_library;
pub mod frame_extractor;
pub mod grouping;
pub mod image_prep;
pub mod media_source;
pub mod record_store;
pub mod uploader;

pub use batch::{
    BatchEvent, BatchImporter, BatchOutcome, BatchProgress, BatchResult, BatchStatus, ImportOptions,
    ItemError,
};
pub use blob_storage::{BlobStorage, S3BlobStorage, StorageError};
pub use classifier::{ClassificationResult, Confidence, ContentClassifier, HttpClassifier};
pub use config::Config;
pub use directory_library::DirectoryLibrary;
pub use frame_extractor::{FfmpegFrameExtractor, FrameExtractor};
pub use grouping::Group;
pub use media_source::{Asset, ImportError, MediaLibrary, MediaSource, MediaType};
pub use record_store::{MemoryRecord, PgRecordStore, RecordStore};
pub use uploader::{UploadCoordinator, UploadedMedia};
