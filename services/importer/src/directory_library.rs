//! Media library backed by a directory tree.
//!
//! Every immediate sub-directory of the root is a collection named after the
//! directory. Files inside it with a known photo or video extension are the
//! collection's assets, listed in file-name order.

use crate::media_source::{
    AccessStatus, Asset, AssetPage, CollectionInfo, LibraryError, MediaLibrary, MediaType,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "webp", "gif", "bmp", "tif", "tiff",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm", "3gp"];

/// Media type implied by a file extension
pub fn media_type_for(path: &Path) -> Option<MediaType> {
    let ext = path.extension()?.to_str()?.to_lowercase();

    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Video)
    } else {
        None
    }
}

/// Media library reading collections from sub-directories of a root
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MediaLibrary for DirectoryLibrary {
    async fn request_access(&self) -> AccessStatus {
        match tokio::fs::read_dir(&self.root).await {
            Ok(_) => AccessStatus::Granted,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Media library root is not readable");
                AccessStatus::Denied
            }
        }
    }

    async fn collections(&self) -> Result<Vec<CollectionInfo>, LibraryError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut collections = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            collections.push(CollectionInfo {
                id: entry.path().to_string_lossy().into_owned(),
                title: entry.file_name().to_string_lossy().into_owned(),
            });
        }

        collections.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(collections)
    }

    #[instrument(skip(self, collection), fields(collection = %collection.title))]
    async fn list_page(
        &self,
        collection: &CollectionInfo,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<AssetPage, LibraryError> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| LibraryError::InvalidCursor(c))?,
            None => 0,
        };
        let dir = PathBuf::from(&collection.id);

        tokio::task::spawn_blocking(move || scan_page(&dir, offset, limit))
            .await
            .map_err(|e| LibraryError::Backend(format!("listing task failed: {e}")))?
    }

    async fn read_asset(&self, asset: &Asset) -> Result<Bytes, LibraryError> {
        match tokio::fs::read(&asset.uri).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LibraryError::AssetNotFound(asset.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Read one page of media files from a collection directory
fn scan_page(dir: &Path, offset: usize, limit: usize) -> Result<AssetPage, LibraryError> {
    let mut files: Vec<(PathBuf, MediaType)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| media_type_for(&path).map(|media_type| (path, media_type)))
        .collect();
    files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

    let total = files.len();
    let end = offset.saturating_add(limit).min(total);
    let mut assets = Vec::with_capacity(end.saturating_sub(offset));

    for (path, media_type) in files.into_iter().skip(offset).take(limit) {
        assets.push(describe_file(&path, media_type)?);
    }

    debug!(dir = %dir.display(), offset, returned = assets.len(), total, "Scanned collection page");

    Ok(AssetPage {
        assets,
        next_cursor: (end < total).then(|| end.to_string()),
        has_more: end < total,
    })
}

fn describe_file(path: &Path, media_type: MediaType) -> Result<Asset, LibraryError> {
    let metadata = std::fs::metadata(path)?;
    let created = metadata.created().or_else(|_| metadata.modified())?;

    // Header-only read; formats the decoder does not know (HEIC) stay 0x0
    let (width, height) = match media_type {
        MediaType::Photo => image::image_dimensions(path).unwrap_or((0, 0)),
        MediaType::Video => (0, 0),
    };

    Ok(Asset {
        id: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uri: path.to_string_lossy().into_owned(),
        media_type,
        created_at: DateTime::<Utc>::from(created),
        width,
        height,
    })
}
