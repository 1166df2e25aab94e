use crate::config::DatabaseConfig;
use crate::grouping::Group;
use crate::media_source::MediaType;
use crate::uploader::UploadedMedia;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Aggregate record for one imported day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Couple/group the memory belongs to
    pub owner_group_id: String,
    /// User that ran the import
    pub created_by: String,
    pub title: String,
    pub description: String,
    pub photo_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub tags: Vec<String>,
    /// Day the media was captured
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while persisting a record
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to insert memory record: {0}")]
    Insert(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                PersistenceError::Unavailable(e.to_string())
            }
            other => PersistenceError::Insert(other.to_string()),
        }
    }
}

/// Document persistence for memory records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a record and return its identifier
    async fn create(&self, record: &MemoryRecord) -> Result<String, PersistenceError>;
}

/// Builds memory records for the groups of one import run
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    owner_group_id: String,
    created_by: String,
    tags: Vec<String>,
}

impl RecordBuilder {
    pub fn new(owner_group_id: &str, created_by: &str, provenance_tag: &str, collection_name: &str) -> Self {
        let mut tags = vec![provenance_tag.to_string()];
        let collection_tag = slugify(collection_name);
        if !collection_tag.is_empty() && collection_tag != provenance_tag {
            tags.push(collection_tag);
        }

        Self {
            owner_group_id: owner_group_id.to_string(),
            created_by: created_by.to_string(),
            tags,
        }
    }

    /// Assemble the record for `group` from its uploaded media
    pub fn build(&self, group: &Group, media: &[UploadedMedia]) -> MemoryRecord {
        let urls_of = |media_type: MediaType| -> Vec<String> {
            media
                .iter()
                .filter(|m| m.media_type == media_type)
                .map(|m| m.remote_url.clone())
                .collect()
        };
        let photo_urls = urls_of(MediaType::Photo);
        let video_urls = urls_of(MediaType::Video);

        MemoryRecord {
            owner_group_id: self.owner_group_id.clone(),
            created_by: self.created_by.clone(),
            title: format!("Memory from {}", long_form_date(group.date)),
            description: media_summary(photo_urls.len(), video_urls.len()),
            photo_urls,
            video_urls,
            tags: self.tags.clone(),
            date: group.date,
            created_at: Utc::now(),
        }
    }
}

/// "January 15, 2024"
pub fn long_form_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// "2 photos, 1 video"; zero counts are left out
pub fn media_summary(photos: usize, videos: usize) -> String {
    fn count(n: usize, noun: &str) -> String {
        if n == 1 {
            format!("1 {noun}")
        } else {
            format!("{n} {noun}s")
        }
    }

    let mut parts = Vec::with_capacity(2);
    if photos > 0 {
        parts.push(count(photos, "photo"));
    }
    if videos > 0 {
        parts.push(count(videos, "video"));
    }
    parts.join(", ")
}

/// Lowercase, alphanumeric runs joined by single dashes
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Memory records in PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(date = %record.date, owner_group_id = %record.owner_group_id))]
    async fn create(&self, record: &MemoryRecord) -> Result<String, PersistenceError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO memories (
                id, owner_group_id, created_by, title, description,
                photo_urls, video_urls, tags, memory_date, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10
            )
            "#,
        )
        .bind(id)
        .bind(&record.owner_group_id)
        .bind(&record.created_by)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.photo_urls)
        .bind(&record.video_urls)
        .bind(&record.tags)
        .bind(record.date)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        debug!(memory_id = %id, "Memory record inserted");

        Ok(id.to_string())
    }
}
