//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid sensor id: {0}")]
    InvalidSensor(String),

    #[error("invalid tile id: {0}")]
    InvalidTile(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("invalid tracking name: {0}")]
    InvalidName(String),

    #[error("unknown job status: {0}")]
    InvalidStatus(String),

    #[error("invalid path template: {0}")]
    InvalidTemplate(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
