//! Batch orchestration of an import run.
//!
//! One run lists a collection, splits it into day groups and walks the groups
//! in order: classify (optional), upload every asset, persist one memory.
//! Only listing failures abort a run; everything after that is recorded per
//! asset or per group and the run moves on.
//!
//! Runs are not idempotent: importing the same collection twice creates a
//! second set of uploads and memories.

use crate::classifier::{representative, ContentClassifier};
use crate::grouping::{self, Group};
use crate::media_source::{ImportError, MediaSource};
use crate::record_store::{RecordBuilder, RecordStore};
use crate::uploader::{UploadCoordinator, UploadError, UploadedMedia};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Parameters of one import run
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Collection to import, matched case-insensitively
    pub collection_name: String,
    /// User the memories are created by
    pub owner_id: String,
    /// Couple/group the memories belong to
    pub owner_group_id: String,
    /// Ask the classifier before importing a group
    pub classify_enabled: bool,
}

/// State of a run as seen in progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Cancelled,
}

/// Incremental progress of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Number of day groups in the run
    pub total: usize,
    /// Groups visited so far
    pub processed: usize,
    /// Groups that produced a memory
    pub created: usize,
    /// Groups that went past classification but produced no memory
    pub failed: usize,
    /// Date key of the group being processed
    pub current_item: Option<String>,
    pub status: BatchStatus,
}

/// A recovered failure, keyed by asset id or group date key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub error: String,
}

impl From<UploadError> for ItemError {
    fn from(e: UploadError) -> Self {
        Self {
            error: e.to_string(),
            item: e.asset_id,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Cancelled,
}

/// Final summary of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Groups visited, whatever their outcome
    pub total_processed: usize,
    pub memories_created: usize,
    pub errors: Vec<ItemError>,
    pub outcome: BatchOutcome,
    /// The listing hit the asset cap
    pub listing_truncated: bool,
}

/// Events emitted while a run is in progress, in pipeline order
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Progress(BatchProgress),
    UploadProgress { asset_id: String, fraction: f64 },
    ItemError(ItemError),
    Completion(BatchResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    /// Classified as not relevant
    Skipped,
    Created,
    /// Nothing uploaded or the record could not be stored
    NoRecord,
    /// Cancelled before any asset was uploaded
    Interrupted,
}

/// Uploads of one group
struct GroupUploads {
    media: Vec<UploadedMedia>,
    /// Assets left out because the run was cancelled
    skipped: usize,
}

/// Drives import runs over a media source
pub struct BatchImporter {
    source: MediaSource,
    classifier: Arc<dyn ContentClassifier>,
    uploader: UploadCoordinator,
    store: Arc<dyn RecordStore>,
    provenance_tag: String,
    upload_concurrency: usize,
    event_tx: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl BatchImporter {
    pub fn new(
        source: MediaSource,
        classifier: Arc<dyn ContentClassifier>,
        uploader: UploadCoordinator,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            source,
            classifier,
            uploader,
            store,
            provenance_tag: "imported".to_string(),
            upload_concurrency: 1,
            event_tx: None,
        }
    }

    /// Send run events to `event_tx`
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<BatchEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Tag added to every memory
    pub fn with_provenance_tag(mut self, tag: impl Into<String>) -> Self {
        self.provenance_tag = tag.into();
        self
    }

    /// Uploads allowed in flight within one group
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    /// Import one collection.
    ///
    /// Fails only when the collection cannot be listed, before any event is
    /// emitted. Cancelling `cancel` stops the run between groups or between
    /// uploads and returns what was accumulated with [`BatchOutcome::Cancelled`].
    #[instrument(skip(self, options, cancel), fields(collection = %options.collection_name, classify = options.classify_enabled))]
    pub async fn run(
        &self,
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ImportError> {
        let listing = self.source.list(&options.collection_name).await?;
        let listing_truncated = listing.truncated;
        let groups = grouping::partition(listing.assets);

        info!(groups = groups.len(), truncated = listing_truncated, "Starting import");

        let builder = RecordBuilder::new(
            &options.owner_group_id,
            &options.owner_id,
            &self.provenance_tag,
            &options.collection_name,
        );

        let mut progress = BatchProgress {
            total: groups.len(),
            processed: 0,
            created: 0,
            failed: 0,
            current_item: None,
            status: BatchStatus::Processing,
        };
        let mut errors = Vec::new();
        let mut cut_short = false;
        self.emit(BatchEvent::Progress(progress.clone()));

        for group in &groups {
            if cancel.is_cancelled() {
                info!(remaining = groups.len() - progress.processed, "Import cancelled");
                cut_short = true;
                break;
            }

            progress.current_item = Some(group.date_key.clone());
            self.emit(BatchEvent::Progress(progress.clone()));

            let (outcome, interrupted) = self
                .process_group(group, options, &builder, cancel, &mut errors)
                .await;
            cut_short |= interrupted;

            progress.processed += 1;
            match outcome {
                GroupOutcome::Created => progress.created += 1,
                GroupOutcome::NoRecord => progress.failed += 1,
                GroupOutcome::Skipped | GroupOutcome::Interrupted => {}
            }
            metrics::counter!("importer.groups.processed").increment(1);

            self.emit(BatchEvent::Progress(progress.clone()));
        }

        // Cancellation after the last asset went up does not undo a full run
        let outcome = if cut_short {
            BatchOutcome::Cancelled
        } else {
            BatchOutcome::Completed
        };

        progress.current_item = None;
        progress.status = match outcome {
            BatchOutcome::Completed => BatchStatus::Completed,
            BatchOutcome::Cancelled => BatchStatus::Cancelled,
        };
        self.emit(BatchEvent::Progress(progress.clone()));

        let result = BatchResult {
            total_processed: progress.processed,
            memories_created: progress.created,
            errors,
            outcome,
            listing_truncated,
        };

        info!(
            total_processed = result.total_processed,
            memories_created = result.memories_created,
            errors = result.errors.len(),
            outcome = ?result.outcome,
            "Import finished"
        );

        self.emit(BatchEvent::Completion(result.clone()));
        Ok(result)
    }

    /// Process one group; the flag is set when cancellation left assets out
    #[instrument(skip_all, fields(date_key = %group.date_key, photos = group.photo_count(), videos = group.video_count()))]
    async fn process_group(
        &self,
        group: &Group,
        options: &ImportOptions,
        builder: &RecordBuilder,
        cancel: &CancellationToken,
        errors: &mut Vec<ItemError>,
    ) -> (GroupOutcome, bool) {
        if options.classify_enabled {
            let Some(asset) = representative(group) else {
                return (GroupOutcome::Skipped, false);
            };

            let decision = self.classifier.classify(asset).await;
            if !decision.is_relevant() {
                info!(
                    asset_id = %asset.id,
                    description = %decision.description,
                    "Group not relevant, skipping"
                );
                metrics::counter!("importer.groups.skipped").increment(1);
                return (GroupOutcome::Skipped, false);
            }

            debug!(confidence = ?decision.confidence, "Group classified as relevant");
        }

        let GroupUploads { media, skipped } = self.upload_group(group, options, cancel, errors).await;
        let interrupted = skipped > 0;
        if interrupted {
            info!(skipped = skipped, "Uploads cancelled");
        }

        if media.is_empty() {
            if interrupted {
                return (GroupOutcome::Interrupted, true);
            }
            warn!("No asset of the group could be uploaded");
            return (GroupOutcome::NoRecord, false);
        }

        let record = builder.build(group, &media);
        match self.store.create(&record).await {
            Ok(memory_id) => {
                info!(
                    memory_id = %memory_id,
                    photos = record.photo_urls.len(),
                    videos = record.video_urls.len(),
                    "Memory created"
                );
                metrics::counter!("importer.memories.created").increment(1);
                (GroupOutcome::Created, interrupted)
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist memory");
                self.record_error(
                    errors,
                    ItemError {
                        item: group.date_key.clone(),
                        error: e.to_string(),
                    },
                );
                (GroupOutcome::NoRecord, interrupted)
            }
        }
    }

    /// Upload the assets of a group in order.
    ///
    /// Each result is handled as soon as it is yielded, so a failure is
    /// reported before the uploads queued behind it finish.
    async fn upload_group(
        &self,
        group: &Group,
        options: &ImportOptions,
        cancel: &CancellationToken,
        errors: &mut Vec<ItemError>,
    ) -> GroupUploads {
        let uploads = stream::iter(&group.assets)
            .map(|asset| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let on_progress = |fraction: f64| {
                    self.emit(BatchEvent::UploadProgress {
                        asset_id: asset.id.clone(),
                        fraction,
                    })
                };
                Some(self.uploader.upload(asset, &options.owner_id, &on_progress).await)
            })
            .buffered(self.upload_concurrency);
        futures::pin_mut!(uploads);

        let mut media = Vec::with_capacity(group.assets.len());
        let mut skipped = 0;
        while let Some(result) = uploads.next().await {
            let Some(result) = result else {
                skipped += 1;
                continue;
            };
            match result {
                Ok(uploaded) => {
                    metrics::counter!("importer.assets.uploaded").increment(1);
                    media.push(uploaded);
                }
                Err(e) => {
                    warn!(asset_id = %e.asset_id, error = %e.message, "Asset upload failed");
                    metrics::counter!("importer.assets.failed").increment(1);
                    self.record_error(errors, e.into());
                }
            }
        }

        GroupUploads { media, skipped }
    }

    fn record_error(&self, errors: &mut Vec<ItemError>, error: ItemError) {
        self.emit(BatchEvent::ItemError(error.clone()));
        errors.push(error);
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.event_tx {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }
}
