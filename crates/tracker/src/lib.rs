//! Asynchronous job tracking for ardtrack.
//!
//! This crate provides:
//! - The `RemoteJobService` interface and its HTTP client
//! - Retry with capped exponential backoff
//! - `TrackingStore`: one JSON record per job in an object store
//! - `Tracker`: submit, update, list, download, clean and cancel

pub mod error;
pub mod http;
mod output;
pub mod remote;
pub mod report;
pub mod retry;
pub mod store;
pub mod tracker;

pub use error::{RemoteError, TrackerError, TrackerResult};
pub use http::HttpJobService;
pub use remote::{JobSpec, RemoteJobService, RemoteJobStatus, RemoteState};
pub use report::{BatchReport, RecordAction, RecordFailure, StatusSummary, SubmitOutcome};
pub use retry::{RetryPolicy, Retryable};
pub use store::TrackingStore;
pub use tracker::{CleanOptions, Clock, Tracker};

use ardtrack_core::config::AppConfig;
use std::sync::Arc;

/// Build a tracker from configuration: staging and destination stores, the
/// HTTP remote client and the retry policy.
pub async fn from_config(config: &AppConfig) -> TrackerResult<Tracker> {
    config.validate().map_err(TrackerError::InvalidParameters)?;

    let staging = ardtrack_storage::from_config(&config.storage).await?;
    staging.health_check().await?;
    let remote = HttpJobService::from_config(&config.remote)?;
    let retry = RetryPolicy::from_config(&config.retry);

    let mut tracker = Tracker::new(Arc::new(remote), staging, config.tracker.clone(), retry)?;
    if let Some(destination) = &config.destination {
        let destination = ardtrack_storage::from_config(destination).await?;
        destination.health_check().await?;
        tracker = tracker.with_destination(destination);
    }

    tracing::info!(
        tracking_prefix = %config.tracker.tracking_prefix,
        remote = %config.remote.base_url,
        "Tracker initialized"
    );
    Ok(tracker)
}
