//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage operation timed out: {0}")]
    Timeout(String),
}

impl StorageError {
    /// Transport-level failures that may succeed on another attempt.
    ///
    /// `NotFound` and `AlreadyExists` are answers, not failures, and are never
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::AlreadyExists
                    | std::io::ErrorKind::InvalidInput
            ),
            Self::S3(_) | Self::Timeout(_) => true,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::InvalidKey(_) | Self::Config(_) => {
                false
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
