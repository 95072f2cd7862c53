#![forbid(unsafe_code)]

//! Video and thumbnail ingestion.
//!
//! Both pipelines are strictly sequential and every step is a hard gate: the
//! first failure aborts and no record field is written. Local files created
//! along the way are owned by guards from `staging`, so they are reclaimed on
//! every exit path.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use mime_guess::mime::Mime;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::config::RuntimeConfig;
use crate::error::{IngestError, IngestResult};
use crate::media::{AspectClass, MediaTools, inspect_aspect_ratio, normalize_for_streaming};
use crate::metadata::{RecordStore, VideoRecord};
use crate::naming::{StorageKey, extension_for};
use crate::staging::{ScratchFile, StagedUpload, write_bounded};
use crate::storage::AssetStore;

pub const MAX_VIDEO_BYTES: u64 = 1 << 30;
pub const MAX_THUMBNAIL_BYTES: u64 = 10 << 20;
pub const VIDEO_MEDIA_TYPE: &str = "video/mp4";
pub const THUMBNAIL_MEDIA_TYPES: [&str; 2] = ["image/jpeg", "image/png"];
pub const ASSETS_ROUTE: &str = "assets";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub staging_dir: PathBuf,
    pub assets_root: PathBuf,
    /// Joined with a storage key to form the public video URL.
    pub distribution_base: String,
    /// Origin that serves `assets_root` under `/assets/`.
    pub public_base_url: String,
    pub max_video_bytes: u64,
    pub max_thumbnail_bytes: u64,
}

impl IngestSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            staging_dir: config.staging_dir.clone(),
            assets_root: config.assets_root.clone(),
            distribution_base: config.distribution_base.clone(),
            public_base_url: config.public_base_url.clone(),
            max_video_bytes: MAX_VIDEO_BYTES,
            max_thumbnail_bytes: MAX_THUMBNAIL_BYTES,
        }
    }

    fn video_url(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.distribution_base.trim_end_matches('/'), key)
    }

    fn thumbnail_url(&self, key: &StorageKey) -> String {
        format!(
            "{}/{ASSETS_ROUTE}/{}",
            self.public_base_url.trim_end_matches('/'),
            key
        )
    }
}

/// Parses the `{videoID}` path segment.
pub fn parse_video_id(raw: &str) -> IngestResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|err| IngestError::BadRequest(format!("invalid video id {raw:?}: {err}")))
}

/// Reduces a `Content-Type` header value to its lowercase `type/subtype`.
/// A missing or unparseable value is not an accepted type either.
pub fn media_essence(content_type: &str) -> IngestResult<String> {
    let mime: Mime = content_type.trim().parse().map_err(|err| {
        IngestError::UnsupportedMediaType(format!("unusable content type {content_type:?}: {err}"))
    })?;
    Ok(mime.essence_str().to_ascii_lowercase())
}

/// Proof that a token's user owns a video. Issued by `Ingestor::authorize`.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    user_id: Uuid,
    record: VideoRecord,
}

/// Owns the collaborators and runs both ingestion pipelines.
#[derive(Clone)]
pub struct Ingestor {
    auth: Arc<dyn Authenticator>,
    records: Arc<dyn RecordStore>,
    assets: Arc<dyn AssetStore>,
    tools: Arc<dyn MediaTools>,
    settings: Arc<IngestSettings>,
}

impl Ingestor {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        records: Arc<dyn RecordStore>,
        assets: Arc<dyn AssetStore>,
        tools: Arc<dyn MediaTools>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            auth,
            records,
            assets,
            tools,
            settings: Arc::new(settings),
        }
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    /// Token → user, then user must own `video_id`. Runs before any upload
    /// bytes are read.
    pub async fn authorize(&self, video_id: Uuid, token: &str) -> IngestResult<UploadGrant> {
        let user_id = self.auth.validate(token)?;
        let record = self.records.get(video_id).await?;
        if record.user_id != user_id {
            tracing::warn!(
                video_id = %video_id,
                user_id = %user_id,
                owner_id = %record.user_id,
                "upload attempted by non-owner"
            );
            return Err(IngestError::Forbidden(format!(
                "user {user_id} does not own video {video_id}"
            )));
        }
        Ok(UploadGrant { user_id, record })
    }

    /// `authorize` followed by `store_video`.
    pub async fn ingest_video<R>(
        &self,
        video_id: Uuid,
        token: &str,
        body: R,
        content_type: &str,
    ) -> IngestResult<VideoRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let grant = self.authorize(video_id, token).await?;
        self.store_video(grant, body, content_type).await
    }

    /// Stages, normalizes, classifies, and uploads an mp4, then points the
    /// record's `video_url` at it. The record is written only after the
    /// object store has confirmed the upload.
    #[tracing::instrument(skip_all, fields(video_id = %grant.record.id))]
    pub async fn store_video<R>(
        &self,
        grant: UploadGrant,
        body: R,
        content_type: &str,
    ) -> IngestResult<VideoRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let UploadGrant {
            user_id,
            mut record,
        } = grant;

        let media_type = media_essence(content_type)?;
        if media_type != VIDEO_MEDIA_TYPE {
            return Err(IngestError::UnsupportedMediaType(format!(
                "expected {VIDEO_MEDIA_TYPE}, got {media_type}"
            )));
        }
        let extension = extension_for(&media_type)?;

        let staged = StagedUpload::stage(
            &self.settings.staging_dir,
            extension,
            &media_type,
            self.settings.max_video_bytes,
            body,
        )
        .await?;
        tracing::info!(
            user_id = %user_id,
            bytes = staged.len(),
            path = %staged.path().display(),
            "staged video upload"
        );

        let normalized = normalize_for_streaming(self.tools.as_ref(), staged.path()).await?;
        let label = inspect_aspect_ratio(self.tools.as_ref(), staged.path()).await?;
        let class = AspectClass::from_label(&label);
        let key = StorageKey::build(Some(class), extension)?;

        let file = tokio::fs::File::open(normalized.path()).await.map_err(|err| {
            IngestError::ProcessingError(format!(
                "opening normalized output {}: {err}",
                normalized.path().display()
            ))
        })?;
        self.assets
            .put(&key, Box::pin(file), staged.media_type())
            .await?;

        record.video_url = Some(self.settings.video_url(&key));
        record.updated_at = Utc::now();
        if let Err(err) = self.records.update(&record).await {
            tracing::error!(key = %key, error = %err, "record update failed after upload");
            if let Err(cleanup) = self.assets.delete(&key).await {
                tracing::warn!(key = %key, error = %cleanup, "could not roll back uploaded object");
            }
            return Err(match err {
                IngestError::ServerError(message) => IngestError::ServerError(message),
                other => IngestError::ServerError(other.to_string()),
            });
        }

        tracing::info!(
            user_id = %user_id,
            key = %key,
            label = %label,
            bucket = %self.assets.bucket(),
            "video ingested"
        );
        Ok(record)
    }

    /// `authorize` followed by `store_thumbnail`.
    pub async fn ingest_thumbnail<R>(
        &self,
        video_id: Uuid,
        token: &str,
        body: R,
        content_type: &str,
    ) -> IngestResult<VideoRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let grant = self.authorize(video_id, token).await?;
        self.store_thumbnail(grant, body, content_type).await
    }

    /// Writes a jpeg/png straight into the local assets directory and points
    /// the record's `thumbnail_url` at it.
    #[tracing::instrument(skip_all, fields(video_id = %grant.record.id))]
    pub async fn store_thumbnail<R>(
        &self,
        grant: UploadGrant,
        body: R,
        content_type: &str,
    ) -> IngestResult<VideoRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let UploadGrant {
            user_id,
            mut record,
        } = grant;

        let media_type = media_essence(content_type)?;
        if !THUMBNAIL_MEDIA_TYPES.contains(&media_type.as_str()) {
            return Err(IngestError::UnsupportedMediaType(format!(
                "expected one of {THUMBNAIL_MEDIA_TYPES:?}, got {media_type}"
            )));
        }
        let extension = extension_for(&media_type)?;
        let key = StorageKey::build(None, extension)?;

        let written = self
            .write_asset(&self.settings.assets_root.join(key.as_str()), body)
            .await?;

        record.thumbnail_url = Some(self.settings.thumbnail_url(&key));
        record.updated_at = Utc::now();
        self.records.update(&record).await.map_err(|err| {
            tracing::error!(error = %err, "record update failed after thumbnail write");
            match err {
                IngestError::ServerError(message) => IngestError::ServerError(message),
                other => IngestError::ServerError(other.to_string()),
            }
        })?;

        let path = written.keep();
        tracing::info!(
            user_id = %user_id,
            path = %path.display(),
            "thumbnail ingested"
        );
        Ok(record)
    }

    /// Streams `body` to `path`. The returned guard still owns the file; the
    /// caller keeps it once the record points at it.
    async fn write_asset<R>(&self, path: &Path, body: R) -> IngestResult<ScratchFile>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|err| {
                IngestError::StorageError(format!("creating {}: {err}", path.display()))
            })?;
        let guard = ScratchFile::new(path);

        write_bounded(body, &mut file, self.settings.max_thumbnail_bytes).await?;
        file.flush()
            .await
            .map_err(|err| IngestError::StorageError(format!("flushing {}: {err}", path.display())))?;
        Ok(guard)
    }
}
