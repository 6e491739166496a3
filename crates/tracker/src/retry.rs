//! Retry with exponential backoff and a per-attempt timeout.

use crate::error::{RemoteError, TrackerError};
use ardtrack_core::config::RetryConfig;
use ardtrack_storage::StorageError;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt may succeed.
pub trait Retryable: std::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// Error reported when an attempt exceeds its timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        RemoteError::is_retryable(self)
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        RemoteError::Timeout(format!("{operation} exceeded {after:?}"))
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        StorageError::Timeout(format!("{operation} exceeded {after:?}"))
    }
}

impl Retryable for TrackerError {
    fn is_retryable(&self) -> bool {
        TrackerError::is_retryable(self)
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        TrackerError::Storage(StorageError::timed_out(operation, after))
    }
}

/// Backoff schedule applied to remote and store calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    timeout: Duration,
    transfer_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: multiplier.max(1.0),
            timeout,
            transfer_timeout: timeout,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.multiplier,
            Duration::from_secs(config.timeout_secs),
        )
        .with_transfer_timeout(Duration::from_secs(config.transfer_timeout_secs))
    }

    /// Per-attempt timeout for artifact copies. Defaults to the call timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// One attempt, no backoff.
    pub fn no_retry(timeout: Duration) -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0, timeout)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    /// The same schedule with each attempt bounded by the transfer timeout.
    pub fn for_transfers(&self) -> Self {
        Self {
            timeout: self.transfer_timeout,
            ..self.clone()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Each attempt is bounded by the policy timeout.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(operation, self.timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
