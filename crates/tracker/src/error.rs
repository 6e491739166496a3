//! Tracker error types.

use ardtrack_storage::StorageError;
use thiserror::Error;

/// Errors reported by a remote job service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The service refused the job (malformed spec, quota). Not retried.
    #[error("job rejected by remote service: {0}")]
    Rejected(String),

    /// Credentials were refused. Every further call would fail the same way.
    #[error("remote service refused credentials: {0}")]
    Unauthorized(String),

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote call timed out: {0}")]
    Timeout(String),

    #[error("remote job not found: {0}")]
    NotFound(String),

    #[error("invalid response from remote service: {0}")]
    InvalidResponse(String),

    #[error("remote client configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Errors that make every remote call fail; batches abort on these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Config(_))
    }
}

/// Tracker operation errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupt tracking record {name}: {reason}")]
    CorruptRecord { name: String, reason: String },

    #[error("invalid transition for {name}: {reason}")]
    InvalidTransition { name: String, reason: String },

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("download verification failed for {name}: {reason}")]
    DownloadVerification { name: String, reason: String },

    #[error("record {0} is COMPLETED but has no output location")]
    MissingOutput(String),

    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),
}

impl From<ardtrack_core::Error> for TrackerError {
    fn from(err: ardtrack_core::Error) -> Self {
        match err {
            ardtrack_core::Error::InvalidStateTransition { from, to } => Self::InvalidTransition {
                name: String::new(),
                reason: format!("{from} -> {to}"),
            },
            other => Self::InvalidParameters(other.to_string()),
        }
    }
}

impl TrackerError {
    /// Whether running the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable(),
            Self::Storage(e) => e.is_retryable(),
            Self::DownloadVerification { .. } => true,
            _ => false,
        }
    }

    /// Whether the error should abort a whole batch.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_fatal(),
            Self::Storage(StorageError::Config(_)) => true,
            _ => false,
        }
    }

    pub(crate) fn transition(name: &impl std::fmt::Display, err: ardtrack_core::Error) -> Self {
        match Self::from(err) {
            Self::InvalidTransition { reason, .. } => Self::InvalidTransition {
                name: name.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Result type for tracker operations.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::Transient("503".to_string()).is_retryable());
        assert!(RemoteError::Timeout("status".to_string()).is_retryable());
        assert!(!RemoteError::Rejected("quota".to_string()).is_retryable());
        assert!(RemoteError::Unauthorized("401".to_string()).is_fatal());
        assert!(!RemoteError::Transient("503".to_string()).is_fatal());
    }

    #[test]
    fn test_tracker_error_classification() {
        let err = TrackerError::from(RemoteError::Unauthorized("401".to_string()));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        let err = TrackerError::from(StorageError::Timeout("put".to_string()));
        assert!(err.is_retryable());

        let err = TrackerError::DownloadVerification {
            name: "T1".to_string(),
            reason: "size".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_core_transition_error_names_record() {
        let core = ardtrack_core::Error::InvalidStateTransition {
            from: "FAILED".to_string(),
            to: "cancel".to_string(),
        };
        let err = TrackerError::transition(&"T1_20200101_20200131", core);
        assert_eq!(
            err.to_string(),
            "invalid transition for T1_20200101_20200131: FAILED -> cancel"
        );
    }
}
