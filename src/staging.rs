#![forbid(unsafe_code)]

//! Scoped temporary files.
//!
//! Everything the pipeline writes to local disk on its way to durable storage
//! is owned by one of these guards, so every exit path (including `?` early
//! returns and dropped futures) releases it.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IngestError, IngestResult};

const STAGING_PREFIX: &str = "tubely-upload-";

/// Deletes the file at `path` when dropped unless `keep` was called.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    /// Takes ownership of `path`; the file does not have to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarms the guard and hands back the path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await, so this is a blocking unlink on whatever thread
        // drops the guard. A single unlink is short enough to do inline.
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed scratch file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove scratch file"
            ),
        }
    }
}

/// Copies `body` into `writer`, failing with `PayloadTooLarge` once more
/// than `max_bytes` have been read. Stops pulling from `body` at that point.
pub async fn write_bounded<R, W>(body: R, writer: &mut W, max_bytes: u64) -> IngestResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // One byte past the limit is enough to tell "exactly full" from "too big".
    let mut limited = body.take(max_bytes.saturating_add(1));
    let len = tokio::io::copy(&mut limited, writer)
        .await
        .map_err(|err| match err.kind() {
            // Transport-level limits and malformed bodies surface through the
            // reader; anything else is the disk.
            std::io::ErrorKind::FileTooLarge => {
                IngestError::PayloadTooLarge(format!("reading upload body: {err}"))
            }
            std::io::ErrorKind::InvalidData => {
                IngestError::BadRequest(format!("reading upload body: {err}"))
            }
            _ => IngestError::StorageError(format!("writing upload to disk: {err}")),
        })?;
    if len > max_bytes {
        return Err(IngestError::PayloadTooLarge(format!(
            "upload exceeds {max_bytes} bytes"
        )));
    }
    Ok(len)
}

/// An upload body spooled to local disk in full.
#[derive(Debug)]
pub struct StagedUpload {
    file: NamedTempFile,
    len: u64,
    media_type: String,
}

impl StagedUpload {
    /// Streams `body` into a fresh temp file under `dir`, failing with
    /// `PayloadTooLarge` as soon as more than `max_bytes` arrive.
    pub async fn stage<R>(
        dir: &Path,
        extension: &str,
        media_type: &str,
        max_bytes: u64,
        body: R,
    ) -> IngestResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&format!(".{}", extension.trim_start_matches('.')))
            .tempfile_in(dir)
            .map_err(|err| {
                IngestError::StorageError(format!(
                    "creating temp file in {}: {err}",
                    dir.display()
                ))
            })?;
        let handle = file
            .reopen()
            .map_err(|err| IngestError::StorageError(format!("opening temp file: {err}")))?;
        let mut writer = tokio::fs::File::from_std(handle);

        let len = write_bounded(body, &mut writer, max_bytes).await?;
        writer
            .flush()
            .await
            .map_err(|err| IngestError::StorageError(format!("flushing upload: {err}")))?;
        writer
            .sync_all()
            .await
            .map_err(|err| IngestError::StorageError(format!("syncing upload: {err}")))?;

        Ok(Self {
            file,
            len,
            media_type: media_type.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}
