//! Error types for disk operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Path has no parent directory: {0}")]
    NoParent(String),
}

impl StorageError {
    /// True when the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
