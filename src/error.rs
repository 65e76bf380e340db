//! Error taxonomy for the conversion path
//!
//! Every failure on the request path ends up as a [`ConvertError`], which maps
//! to an HTTP-style status at the front-end boundary. None of these are fatal
//! to the serving process.

use thiserror::Error;

use crate::transcoder::TranscodeError;

/// Errors surfaced by [`crate::service::ImageService::convert`]
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Request path is malformed or escapes the source root (400)
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    /// File extension is not an allowed source type (415)
    #[error("Unsupported extension: {extension}")]
    UnsupportedExtension { extension: String },

    /// Source type and target format cannot be converted (415)
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Local source does not exist (404)
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Encoder failed; cache left untouched (500)
    #[error("Encode error: {0}")]
    Encode(String),

    /// Remote origin could not be reached or timed out (502)
    #[error("Origin unreachable: {0}")]
    OriginUnreachable(String),

    /// Remote origin reported the source as absent (404)
    #[error("Origin not found: {0}")]
    OriginNotFound(String),

    /// Waiting on another conversion of the same key took too long.
    /// Recovered internally by converting directly.
    #[error("Timed out waiting for conversion lock on {0}")]
    LockTimeout(String),

    /// Filesystem error (500)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConvertError {
    /// Maps conversion errors to HTTP status codes
    ///
    /// - InvalidPath → 400
    /// - UnsupportedExtension, UnsupportedFormat → 415
    /// - SourceNotFound, OriginNotFound → 404
    /// - OriginUnreachable → 502
    /// - Encode, Io, LockTimeout, Config → 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ConvertError::InvalidPath { .. } => 400,
            ConvertError::UnsupportedExtension { .. } | ConvertError::UnsupportedFormat(_) => 415,
            ConvertError::SourceNotFound(_) | ConvertError::OriginNotFound(_) => 404,
            ConvertError::OriginUnreachable(_) => 502,
            ConvertError::Encode(_)
            | ConvertError::LockTimeout(_)
            | ConvertError::Io(_)
            | ConvertError::Config(_) => 500,
        }
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        ConvertError::InvalidPath { path: path.into() }
    }

    pub fn unsupported_extension(extension: impl Into<String>) -> Self {
        ConvertError::UnsupportedExtension {
            extension: extension.into(),
        }
    }
}

impl From<TranscodeError> for ConvertError {
    fn from(err: TranscodeError) -> Self {
        if err.is_passthrough() {
            return ConvertError::UnsupportedFormat(err.to_string());
        }
        match err {
            TranscodeError::Io(e) => ConvertError::Io(e),
            other => ConvertError::Encode(other.to_string()),
        }
    }
}

impl From<crate::storage::StorageError> for ConvertError {
    fn from(err: crate::storage::StorageError) -> Self {
        match err {
            crate::storage::StorageError::Io(e) => ConvertError::Io(e),
            other => ConvertError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}
