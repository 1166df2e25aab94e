use crate::config::MediaSourceConfig;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Kind of media an asset holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
        }
    }
}

/// One photo or video from an external media collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Identifier assigned by the media library
    pub id: String,
    /// Location the library reads the asset bytes from
    pub uri: String,
    pub media_type: MediaType,
    /// Capture time
    pub created_at: DateTime<Utc>,
    /// Width in pixels (0 when unknown)
    pub width: u32,
    /// Height in pixels (0 when unknown)
    pub height: u32,
}

/// Answer to an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

/// A named collection (album) in the media library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub id: String,
    pub title: String,
}

/// One page of a collection listing
#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    pub assets: Vec<Asset>,
    /// Cursor to pass back for the following page
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Errors reported by a media library backend
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid page cursor: {0}")]
    InvalidCursor(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Media library error: {0}")]
    Backend(String),
}

/// Errors that abort an import before any group is processed
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Access to the media library was denied")]
    PermissionDenied,

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Failed to list collection: {0}")]
    Source(#[from] LibraryError),
}

/// Permission-gated, paginated access to a media library
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Ask for read access to the library
    async fn request_access(&self) -> AccessStatus;

    /// All collections in the library
    async fn collections(&self) -> Result<Vec<CollectionInfo>, LibraryError>;

    /// List at most `limit` assets of a collection, starting at `cursor`
    async fn list_page(
        &self,
        collection: &CollectionInfo,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<AssetPage, LibraryError>;

    /// Read the full bytes of an asset
    async fn read_asset(&self, asset: &Asset) -> Result<Bytes, LibraryError>;
}

/// Result of listing a collection
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Assets sorted by capture time
    pub assets: Vec<Asset>,
    /// The asset cap was hit before the library ran out of pages
    pub truncated: bool,
}

/// Resolves a collection by name and pages through all of its assets
pub struct MediaSource {
    library: Arc<dyn MediaLibrary>,
    page_size: usize,
    max_assets: usize,
}

impl MediaSource {
    /// Create a media source with limits from configuration
    pub fn new(library: Arc<dyn MediaLibrary>, config: &MediaSourceConfig) -> Self {
        Self::with_limits(library, config.page_size, config.max_assets)
    }

    /// Create a media source with explicit page size and asset cap
    pub fn with_limits(library: Arc<dyn MediaLibrary>, page_size: usize, max_assets: usize) -> Self {
        Self {
            library,
            page_size: page_size.max(1),
            max_assets,
        }
    }

    /// List every asset of the named collection, up to the asset cap
    #[instrument(skip(self))]
    pub async fn list(&self, collection_name: &str) -> Result<Listing, ImportError> {
        if self.library.request_access().await != AccessStatus::Granted {
            return Err(ImportError::PermissionDenied);
        }

        let collection = self.resolve(collection_name).await?;

        let mut assets: Vec<Asset> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut truncated = false;
        let mut pages = 0usize;

        loop {
            let limit = self.page_size.min(self.max_assets - assets.len()).max(1);
            let page = self
                .library
                .list_page(&collection, cursor.take(), limit)
                .await?;
            pages += 1;

            debug!(
                page = pages,
                page_assets = page.assets.len(),
                has_more = page.has_more,
                "Fetched asset page"
            );

            if page.assets.is_empty() {
                if page.has_more {
                    warn!(
                        collection = %collection.title,
                        page = pages,
                        "Library returned an empty page but claims more, stopping"
                    );
                }
                break;
            }

            assets.extend(page.assets);

            if assets.len() >= self.max_assets {
                if assets.len() > self.max_assets || page.has_more {
                    truncated = true;
                    warn!(
                        collection = %collection.title,
                        max_assets = self.max_assets,
                        "Asset cap reached, remaining assets are not imported"
                    );
                }
                assets.truncate(self.max_assets);
                break;
            }

            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }

        // Stable, so library order survives for identical timestamps
        assets.sort_by_key(|asset| asset.created_at);

        info!(
            collection = %collection.title,
            assets = assets.len(),
            pages = pages,
            truncated = truncated,
            "Collection listed"
        );

        Ok(Listing { assets, truncated })
    }

    /// Find a collection by case-insensitive exact title match
    async fn resolve(&self, collection_name: &str) -> Result<CollectionInfo, ImportError> {
        let wanted = collection_name.to_lowercase();

        self.library
            .collections()
            .await?
            .into_iter()
            .find(|c| c.title.to_lowercase() == wanted)
            .ok_or_else(|| ImportError::CollectionNotFound(collection_name.to_string()))
    }
}
