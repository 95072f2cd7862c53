#![forbid(unsafe_code)]

//! Failure taxonomy shared by both ingestion pipelines.
//!
//! Every variant carries an internal diagnostic message. Callers only see the
//! classification (and the HTTP status derived from it); the message is what
//! ends up in the logs.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("probe failed: {0}")]
    ProbeError(String),

    #[error("processing failed: {0}")]
    ProcessingError(String),

    #[error("storage failed: {0}")]
    StorageError(String),

    #[error("server error: {0}")]
    ServerError(String),
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ProbeError(_)
            | Self::ProcessingError(_)
            | Self::StorageError(_)
            | Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short, client-safe description of the classification.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid request",
            Self::Unauthenticated(_) => "couldn't validate credentials",
            Self::Forbidden(_) => "not the owner of this video",
            Self::NotFound(_) => "video not found",
            Self::UnsupportedMediaType(_) => "unsupported media type",
            Self::PayloadTooLarge(_) => "upload too large",
            Self::ProbeError(_) => "couldn't inspect video",
            Self::ProcessingError(_) => "couldn't process video",
            Self::StorageError(_) => "couldn't store upload",
            Self::ServerError(_) => "internal server error",
        }
    }
}
