//! Transcoder error types

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while transcoding a source image
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Source type cannot be converted to the target format
    #[error("Cannot convert {source_type} to {target}")]
    UnsupportedFormat { source_type: String, target: String },

    /// Source bytes could not be decoded (corrupt or unsupported color mode)
    #[error("Failed to decode image: {message}")]
    DecodeFailed { message: String },

    /// Resize or crop failed
    #[error("Resize failed: {message}")]
    ResizeFailed { message: String },

    /// Encoder returned an error or crashed
    #[error("Failed to encode to {format}: {message}")]
    EncodeFailed { format: String, message: String },

    /// Image is larger than the target encoder accepts
    #[error("Image {width}x{height} exceeds {format} limit of {max} pixels per side")]
    DimensionsTooLarge {
        format: String,
        width: u32,
        height: u32,
        max: u32,
    },

    /// Encoder did not finish in time
    #[error("Processing timeout after {timeout_ms}ms")]
    ProcessingTimeout { timeout_ms: u64 },

    /// Reading the source or writing the artifact failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn unsupported_format(source_type: impl Into<String>, target: impl Into<String>) -> Self {
        TranscodeError::UnsupportedFormat {
            source_type: source_type.into(),
            target: target.into(),
        }
    }

    pub fn decode_failed(message: impl Into<String>) -> Self {
        TranscodeError::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn resize_failed(message: impl Into<String>) -> Self {
        TranscodeError::ResizeFailed {
            message: message.into(),
        }
    }

    pub fn encode_failed(format: impl Into<String>, message: impl Into<String>) -> Self {
        TranscodeError::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Policy mismatches: the caller should serve the source unconverted
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            TranscodeError::UnsupportedFormat { .. } | TranscodeError::DimensionsTooLarge { .. }
        )
    }
}

impl From<StorageError> for TranscodeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => TranscodeError::Io(e),
            other => TranscodeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}
