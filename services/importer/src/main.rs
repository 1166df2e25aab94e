use anyhow::{Context, Result};
use keepsake_importer::batch::{BatchEvent, BatchImporter, BatchOutcome, ImportOptions};
use keepsake_importer::blob_storage::S3BlobStorage;
use keepsake_importer::classifier::HttpClassifier;
use keepsake_importer::config::Config;
use keepsake_importer::directory_library::DirectoryLibrary;
use keepsake_importer::frame_extractor::FfmpegFrameExtractor;
use keepsake_importer::media_source::{MediaLibrary, MediaSource};
use keepsake_importer::record_store::PgRecordStore;
use keepsake_importer::uploader::UploadCoordinator;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        collection = %config.import.collection_name,
        "Starting Keepsake importer"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    // Initialize components
    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_storage = Arc::new(
        S3BlobStorage::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob storage")?,
    );

    let library: Arc<dyn MediaLibrary> = Arc::new(DirectoryLibrary::new(&config.media_source.root));
    let frames = Arc::new(FfmpegFrameExtractor::new(&config.classifier.ffmpeg_path));

    let classifier = Arc::new(
        HttpClassifier::new(&config.classifier, library.clone(), frames)
            .context("Failed to initialize classifier")?,
    );

    let uploader = UploadCoordinator::new(library.clone(), blob_storage, &config.upload);
    let source = MediaSource::new(library, &config.media_source);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let importer = BatchImporter::new(source, classifier, uploader, record_store)
        .with_provenance_tag(&config.import.provenance_tag)
        .with_upload_concurrency(config.upload.upload_concurrency)
        .with_events(event_tx);

    let events_handle = tokio::spawn(log_events(event_rx));

    // Cancel the run on shutdown signal
    let cancel = CancellationToken::new();
    let signal_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Cancelling import");
            cancel.cancel();
        }
    });

    let options = ImportOptions {
        collection_name: config.import.collection_name.clone(),
        owner_id: config.import.owner_id.clone(),
        owner_group_id: config.import.owner_group_id.clone(),
        classify_enabled: config.import.classify_enabled,
    };

    let result = importer
        .run(&options, &cancel)
        .await
        .with_context(|| format!("Failed to import collection '{}'", options.collection_name))?;

    signal_handle.abort();
    // Dropping the importer closes the event channel
    drop(importer);
    let _ = events_handle.await;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize import result")?
    );

    if result.outcome == BatchOutcome::Cancelled {
        warn!("Import was cancelled before all days were processed");
    }

    info!("Importer stopped");

    Ok(())
}

/// Log run events until the channel closes
async fn log_events(mut event_rx: mpsc::UnboundedReceiver<BatchEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            BatchEvent::Progress(progress) => info!(
                total = progress.total,
                processed = progress.processed,
                created = progress.created,
                failed = progress.failed,
                current = progress.current_item.as_deref().unwrap_or("-"),
                status = ?progress.status,
                "Import progress"
            ),
            BatchEvent::UploadProgress { asset_id, fraction } => {
                debug!(asset_id = %asset_id, fraction = fraction, "Upload progress")
            }
            BatchEvent::ItemError(error) => {
                warn!(item = %error.item, error = %error.error, "Import item failed")
            }
            BatchEvent::Completion(result) => info!(
                total_processed = result.total_processed,
                memories_created = result.memories_created,
                errors = result.errors.len(),
                truncated = result.listing_truncated,
                "Import completed"
            ),
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
