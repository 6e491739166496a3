//! Interface to the remote compute service that runs export jobs.

use crate::error::RemoteError;
use ardtrack_core::{JobEvent, JobParameters, RemoteJobId, TrackingName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job submission payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: TrackingName,
    pub parameters: JobParameters,
    /// Staging path the output should be exported to.
    pub output_path: String,
}

/// State of a job as reported by the remote service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The service knows the id but not the job (expired history).
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    pub state: RemoteState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteJobStatus {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state,
            output_location: None,
            error: None,
        }
    }

    pub fn completed(output_location: impl Into<String>) -> Self {
        Self {
            output_location: Some(output_location.into()),
            ..Self::new(RemoteState::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(RemoteState::Failed)
        }
    }

    /// Translate into a state-machine event.
    ///
    /// `default_output` stands in for a completion report without a location.
    /// Returns `None` for [`RemoteState::Unknown`].
    pub fn event(&self, default_output: &str) -> Option<JobEvent> {
        let event = match self.state {
            RemoteState::Queued => JobEvent::Queued,
            RemoteState::Running => JobEvent::Running,
            RemoteState::Completed => JobEvent::Completed {
                output_location: self
                    .output_location
                    .clone()
                    .unwrap_or_else(|| default_output.to_string()),
            },
            RemoteState::Failed => JobEvent::Failed {
                reason: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "remote job failed".to_string()),
            },
            RemoteState::Cancelled => JobEvent::RemoteCancelled,
            RemoteState::Unknown => return None,
        };
        Some(event)
    }
}

/// Remote compute service.
#[async_trait]
pub trait RemoteJobService: Send + Sync + 'static {
    /// Start a job and return its remote id.
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJobId, RemoteError>;

    /// Current state of one job.
    async fn status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, RemoteError>;

    /// State of many jobs in one round trip.
    ///
    /// Ids the service no longer knows are absent from the result.
    async fn status_batch(
        &self,
        ids: &[RemoteJobId],
    ) -> Result<HashMap<RemoteJobId, RemoteJobStatus>, RemoteError> {
        let mut statuses = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.status(id).await {
                Ok(status) => {
                    statuses.insert(id.clone(), status);
                }
                Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(statuses)
    }

    /// Request cancellation. Cancelling a finished job is not an error.
    async fn cancel(&self, id: &RemoteJobId) -> Result<(), RemoteError>;

    /// Static identifier of the service type, used in logs.
    fn service_name(&self) -> &'static str;
}
