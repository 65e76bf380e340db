//! Disk primitives shared by the cache components
//!
//! Every persisted file (artifacts, metadata records, remote-raw copies) is
//! written through [`DiskBackend::write_file_atomic`], so a concurrent reader
//! never observes a partially written file.

pub use self::backend::{DiskBackend, FileEntry};
pub use self::error::StorageError;
pub use self::tokio_backend::TokioFsBackend;

mod backend;
mod error;
mod tokio_backend;

/// Suffix of in-flight temp files; walkers and the eviction pass ignore them
pub const TEMP_SUFFIX: &str = ".tmp";
