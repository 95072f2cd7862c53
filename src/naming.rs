#![forbid(unsafe_code)]

//! Storage key construction and media-type → extension resolution.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore};

use crate::error::{IngestError, IngestResult};
use crate::media::AspectClass;

const KEY_ENTROPY_BYTES: usize = 32;

/// Path under which a processed asset is stored.
///
/// `<classification>/<43 url-safe base64 chars>.<ext>` for videos,
/// `<43 chars>.<ext>` for thumbnails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Draws a fresh random key from the OS CSPRNG. `classification` is
    /// `None` for thumbnails.
    pub fn build(classification: Option<AspectClass>, extension: &str) -> IngestResult<Self> {
        let mut entropy = [0u8; KEY_ENTROPY_BYTES];
        OsRng
            .try_fill_bytes(&mut entropy)
            .map_err(|err| IngestError::ServerError(format!("reading OS randomness: {err}")))?;
        let name = URL_SAFE_NO_PAD.encode(entropy);
        let extension = extension.trim_start_matches('.');

        let key = match classification {
            Some(class) => format!("{}/{name}.{extension}", class.prefix()),
            None => format!("{name}.{extension}"),
        };
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Picks the file extension registered for `media_type`, preferring the one
/// that matches the subtype (`mp4`, `png`, `jpeg`).
pub fn extension_for(media_type: &str) -> IngestResult<&'static str> {
    let candidates = mime_guess::get_mime_extensions_str(media_type)
        .filter(|candidates| !candidates.is_empty())
        .ok_or_else(|| {
            IngestError::ServerError(format!("no file extension registered for {media_type}"))
        })?;
    let subtype = media_type.split_once('/').map(|(_, sub)| sub).unwrap_or("");
    Ok(candidates
        .iter()
        .copied()
        .find(|ext| ext.eq_ignore_ascii_case(subtype))
        .unwrap_or(candidates[0]))
}
