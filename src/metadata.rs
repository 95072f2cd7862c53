//! Video record persistence.
//!
//! Records are created elsewhere (the studio flow that registers a video
//! before any media exists); ingestion only reads a record and sets one URL
//! on it. `RecordStore` is the narrow view the pipeline depends on, and
//! `MetadataStore` is the SQLite-compatible implementation behind it.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// One logical video, owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub thumbnail_url: Option<String>,
    pub video_url: Option<String>,
}

impl VideoRecord {
    pub fn new(user_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            thumbnail_url: None,
            video_url: None,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fails with `NotFound` when no record has this id.
    async fn get(&self, id: Uuid) -> IngestResult<VideoRecord>;

    /// Persists the record's mutable fields. Fails with `ServerError`.
    async fn update(&self, record: &VideoRecord) -> IngestResult<()>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            thumbnail_url TEXT,
            video_url TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_videos_user_id ON videos(user_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite-compatible connection that owns the `videos` table.
#[derive(Debug)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the DB and ensures the schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening metadata DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn insert_video(&self, record: &VideoRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, user_id, title, description, created_at, updated_at,
                    thumbnail_url, video_url
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.id.to_string(),
                    record.user_id.to_string(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.thumbnail_url.as_deref(),
                    record.video_url.as_deref(),
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", record.id))?;
        Ok(())
    }

    pub async fn get_video(&self, id: Uuid) -> Result<Option<VideoRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, user_id, title, description, created_at, updated_at,
                       thumbnail_url, video_url
                FROM videos
                WHERE id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([id.to_string()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Rewrites the mutable columns. Errors when the row does not exist.
    pub async fn update_video(&self, record: &VideoRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    title = ?1,
                    description = ?2,
                    updated_at = ?3,
                    thumbnail_url = ?4,
                    video_url = ?5
                WHERE id = ?6
                "#,
                params![
                    record.title.as_str(),
                    record.description.as_str(),
                    record.updated_at.to_rfc3339(),
                    record.thumbnail_url.as_deref(),
                    record.video_url.as_deref(),
                    record.id.to_string(),
                ],
            )
            .await
            .with_context(|| format!("updating video {}", record.id))?;
        if changed == 0 {
            return Err(anyhow!("video {} does not exist", record.id));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MetadataStore {
    async fn get(&self, id: Uuid) -> IngestResult<VideoRecord> {
        self.get_video(id)
            .await
            .map_err(|err| IngestError::ServerError(format!("{err:#}")))?
            .ok_or_else(|| IngestError::NotFound(format!("video {id} does not exist")))
    }

    async fn update(&self, record: &VideoRecord) -> IngestResult<()> {
        self.update_video(record)
            .await
            .map_err(|err| IngestError::ServerError(format!("{err:#}")))
    }
}

/// Converts a SQL row into a `VideoRecord`. Column order must match the
/// SELECT in `get_video`.
fn row_to_video_record(row: &Row) -> Result<VideoRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(VideoRecord {
        id: Uuid::parse_str(&id).context("parsing stored video id")?,
        user_id: Uuid::parse_str(&user_id).context("parsing stored user id")?,
        title: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_timestamp(&created_at).context("parsing created_at")?,
        updated_at: parse_timestamp(&updated_at).context("parsing updated_at")?,
        thumbnail_url: row.get(6)?,
        video_url: row.get(7)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
