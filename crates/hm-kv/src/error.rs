//! Error types for the store client.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur talking to the backing store.
///
/// `KeyNotFound` is ordinary control flow: absence is meaningful.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key is a directory: {0}")]
    IsDirectory(String),

    #[error("key is not a directory: {0}")]
    IsNotDirectory(String),

    #[error("store request timed out: {0}")]
    Timeout(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }

    /// A directory/leaf shape mismatch.
    pub fn is_directory_conflict(&self) -> bool {
        matches!(self, StoreError::IsDirectory(_) | StoreError::IsNotDirectory(_))
    }
}
