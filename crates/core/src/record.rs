//! Tracking records and the job state machine.
//!
//! ```text
//! (none) --submit--> SUBMITTED
//! SUBMITTED --remote running--> RUNNING
//! SUBMITTED|RUNNING --remote success--> COMPLETED
//! SUBMITTED|RUNNING --remote failure--> FAILED
//! SUBMITTED|RUNNING --remote cancelled--> CANCELLED
//! COMPLETED --artifact fetched--> DOWNLOADED
//! any non-terminal --explicit cancel--> CANCELLED
//! ```
//!
//! Transitions are computed by [`next_status`], a pure function, and applied to a
//! record by [`TrackingRecord::apply`].

use crate::job::JobParameters;
use crate::naming::TrackingName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

/// Failure reason recorded when a remote job vanished without a terminal signal.
pub const MISSING_JOB_REASON: &str = "remote job no longer known";

/// Identifier assigned to a job by the remote compute service.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobId(String);

impl RemoteJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteJobId({})", self.0)
    }
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local status of a tracked job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Downloaded,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Submitted,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Downloaded,
        Self::Cancelled,
    ];

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed | Self::Cancelled)
    }

    /// Still waiting on the remote service.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Downloaded => "DOWNLOADED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidStatus(s.to_string()))
    }
}

/// Something that happened to a job: a remote observation or a local request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// Remote accepted the job but has not started it.
    Queued,
    /// Remote reports the job running.
    Running,
    /// Remote reports success; output is staged at `output_location`.
    Completed { output_location: String },
    /// Remote reports failure.
    Failed { reason: String },
    /// Remote reports the job cancelled.
    RemoteCancelled,
    /// Explicit local cancel request.
    Cancel,
    /// Artifact verified at `destination_path`.
    Downloaded { destination_path: String },
}

impl JobEvent {
    /// Whether the event comes from polling the remote service.
    ///
    /// Poll events are advisory: when stale they are discarded instead of
    /// rejected.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::Running
                | Self::Completed { .. }
                | Self::Failed { .. }
                | Self::RemoteCancelled
        )
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::RemoteCancelled => "remote-cancelled",
            Self::Cancel => "cancel",
            Self::Downloaded { .. } => "downloaded",
        }
    }
}

/// Compute the status a job moves to when `event` happens in `current`.
///
/// `Ok(None)` means the event causes no status change (including stale poll
/// results for finished jobs). Local requests that the state machine forbids
/// return [`crate::Error::InvalidStateTransition`].
pub fn next_status(current: JobStatus, event: &JobEvent) -> crate::Result<Option<JobStatus>> {
    use JobStatus::*;

    let next = match (current, event) {
        (Submitted, JobEvent::Running) => Some(Running),
        (Submitted | Running, JobEvent::Completed { .. }) => Some(Completed),
        (Submitted | Running, JobEvent::Failed { .. }) => Some(Failed),
        (Submitted | Running, JobEvent::RemoteCancelled) => Some(Cancelled),
        (_, e) if e.is_remote() => None,

        (Submitted | Running | Completed, JobEvent::Cancel) => Some(Cancelled),
        (Completed | Downloaded, JobEvent::Downloaded { .. }) => Some(Downloaded),
        (from, e) => {
            return Err(crate::Error::InvalidStateTransition {
                from: from.to_string(),
                to: e.label().to_string(),
            });
        }
    };
    Ok(next)
}

/// Outcome of observing that the remote service no longer reports a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingOutcome {
    /// First observation; `missing_since` was recorded.
    Marked,
    /// Still inside the grace period; nothing changed.
    Pending,
    /// Grace period elapsed; the record is now FAILED.
    Expired,
    /// The record was not open; nothing changed.
    Ignored,
}

/// Persisted state of one tracked job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    pub name: TrackingName,
    pub remote_job_id: RemoteJobId,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub parameters: JobParameters,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the remote service first stopped reporting this job.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub missing_since: Option<OffsetDateTime>,
}

impl TrackingRecord {
    /// A freshly submitted record.
    pub fn new(
        name: TrackingName,
        remote_job_id: RemoteJobId,
        parameters: JobParameters,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            name,
            remote_job_id,
            status: JobStatus::Submitted,
            submitted_at: now,
            updated_at: now,
            parameters,
            output_location: None,
            destination_path: None,
            failure_reason: None,
            missing_since: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply an event. Returns whether the record changed and must be persisted.
    pub fn apply(&mut self, event: &JobEvent, now: OffsetDateTime) -> crate::Result<bool> {
        let Some(next) = next_status(self.status, event)? else {
            // A definitive remote answer for an open job ends any disappearance.
            if event.is_remote() && self.status.is_open() && self.missing_since.is_some() {
                self.missing_since = None;
                self.touch(now);
                return Ok(true);
            }
            return Ok(false);
        };

        match event {
            JobEvent::Completed { output_location } => {
                self.output_location = Some(output_location.clone());
            }
            JobEvent::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
            }
            JobEvent::Downloaded { destination_path } => {
                self.destination_path = Some(destination_path.clone());
            }
            _ => {}
        }
        self.status = next;
        self.missing_since = None;
        self.touch(now);
        Ok(true)
    }

    /// Record that the remote service did not report this job.
    ///
    /// After `grace` has elapsed since the first such observation the record
    /// resolves to FAILED.
    pub fn observe_missing(&mut self, now: OffsetDateTime, grace: Duration) -> MissingOutcome {
        if !self.status.is_open() {
            return MissingOutcome::Ignored;
        }
        let first = self.missing_since.is_none();
        let since = *self.missing_since.get_or_insert(now);

        if now - since >= grace {
            self.status = JobStatus::Failed;
            self.failure_reason = Some(MISSING_JOB_REASON.to_string());
            self.missing_since = None;
            self.touch(now);
            MissingOutcome::Expired
        } else if first {
            self.touch(now);
            MissingOutcome::Marked
        } else {
            MissingOutcome::Pending
        }
    }

    /// Whether a terminal record has outlived `retention`.
    pub fn retention_elapsed(&self, retention: Duration, now: OffsetDateTime) -> bool {
        self.is_terminal() && self.updated_at + retention <= now
    }

    fn touch(&mut self, now: OffsetDateTime) {
        self.updated_at = self.updated_at.max(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DateRange, TileId};
    use time::macros::{date, datetime};

    fn record() -> TrackingRecord {
        let params = JobParameters::new(
            TileId::new("T1").unwrap(),
            DateRange::new(date!(2020 - 01 - 01), date!(2020 - 01 - 31)).unwrap(),
        );
        TrackingRecord::new(
            TrackingName::new("T1_20200101_20200131").unwrap(),
            RemoteJobId::new("job-1"),
            params,
            datetime!(2024-01-01 00:00 UTC),
        )
    }

    fn remote_events() -> Vec<JobEvent> {
        vec![
            JobEvent::Queued,
            JobEvent::Running,
            JobEvent::Completed {
                output_location: "out.tif".to_string(),
            },
            JobEvent::Failed {
                reason: "boom".to_string(),
            },
            JobEvent::RemoteCancelled,
        ]
    }

    #[test]
    fn test_forward_transitions() {
        use JobStatus::*;
        assert_eq!(next_status(Submitted, &JobEvent::Running).unwrap(), Some(Running));
        assert_eq!(next_status(Submitted, &JobEvent::Queued).unwrap(), None);
        assert_eq!(next_status(Running, &JobEvent::Running).unwrap(), None);
        assert_eq!(
            next_status(Running, &remote_events()[2]).unwrap(),
            Some(Completed)
        );
        assert_eq!(next_status(Running, &remote_events()[3]).unwrap(), Some(Failed));
        assert_eq!(
            next_status(Submitted, &JobEvent::RemoteCancelled).unwrap(),
            Some(Cancelled)
        );
    }

    #[test]
    fn test_terminal_states_discard_remote_events() {
        for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for event in remote_events() {
                assert_eq!(next_status(status, &event).unwrap(), None, "{status} {event:?}");
            }
        }
    }

    #[test]
    fn test_remote_events_never_regress_running() {
        assert_eq!(next_status(JobStatus::Running, &JobEvent::Queued).unwrap(), None);
        assert_eq!(
            next_status(JobStatus::Completed, &JobEvent::Running).unwrap(),
            None
        );
    }

    #[test]
    fn test_explicit_cancel() {
        use JobStatus::*;
        for status in [Submitted, Running, Completed] {
            assert_eq!(next_status(status, &JobEvent::Cancel).unwrap(), Some(Cancelled));
        }
        for status in [Downloaded, Failed, Cancelled] {
            assert!(next_status(status, &JobEvent::Cancel).is_err());
        }
    }

    #[test]
    fn test_download_requires_completed() {
        let event = JobEvent::Downloaded {
            destination_path: "T1/x.tif".to_string(),
        };
        assert_eq!(
            next_status(JobStatus::Completed, &event).unwrap(),
            Some(JobStatus::Downloaded)
        );
        assert!(next_status(JobStatus::Submitted, &event).is_err());
        assert!(next_status(JobStatus::Failed, &event).is_err());
    }

    #[test]
    fn test_apply_sets_fields_and_updated_at() {
        let mut rec = record();
        let later = datetime!(2024-01-02 00:00 UTC);
        let changed = rec
            .apply(
                &JobEvent::Completed {
                    output_location: "ARD_PREARD/T1.tif".to_string(),
                },
                later,
            )
            .unwrap();
        assert!(changed);
        assert_eq!(rec.status, JobStatus::Completed);
        assert_eq!(rec.output_location.as_deref(), Some("ARD_PREARD/T1.tif"));
        assert_eq!(rec.updated_at, later);
        assert_eq!(rec.submitted_at, datetime!(2024-01-01 00:00 UTC));
    }

    #[test]
    fn test_updated_at_never_decreases() {
        let mut rec = record();
        let earlier = datetime!(2023-12-31 00:00 UTC);
        rec.apply(&JobEvent::Running, earlier).unwrap();
        assert_eq!(rec.updated_at, datetime!(2024-01-01 00:00 UTC));
    }

    #[test]
    fn test_missing_marks_then_expires() {
        let mut rec = record();
        let grace = Duration::hours(1);
        let t0 = datetime!(2024-01-02 00:00 UTC);

        assert_eq!(rec.observe_missing(t0, grace), MissingOutcome::Marked);
        assert_eq!(rec.missing_since, Some(t0));
        assert_eq!(rec.status, JobStatus::Submitted);

        assert_eq!(
            rec.observe_missing(t0 + Duration::minutes(30), grace),
            MissingOutcome::Pending
        );
        assert_eq!(
            rec.observe_missing(t0 + Duration::hours(1), grace),
            MissingOutcome::Expired
        );
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.failure_reason.as_deref(), Some(MISSING_JOB_REASON));
        assert!(rec.missing_since.is_none());
    }

    #[test]
    fn test_missing_with_zero_grace_expires_immediately() {
        let mut rec = record();
        let outcome = rec.observe_missing(datetime!(2024-01-02 00:00 UTC), Duration::ZERO);
        assert_eq!(outcome, MissingOutcome::Expired);
        assert_eq!(rec.status, JobStatus::Failed);
    }

    #[test]
    fn test_definitive_status_clears_missing() {
        let mut rec = record();
        rec.observe_missing(datetime!(2024-01-02 00:00 UTC), Duration::hours(1));
        let changed = rec
            .apply(&JobEvent::Queued, datetime!(2024-01-02 00:10 UTC))
            .unwrap();
        assert!(changed);
        assert!(rec.missing_since.is_none());
        assert_eq!(rec.status, JobStatus::Submitted);
    }

    #[test]
    fn test_missing_ignored_for_non_open_records() {
        let mut rec = record();
        rec.status = JobStatus::Completed;
        assert_eq!(
            rec.observe_missing(datetime!(2024-01-02 00:00 UTC), Duration::ZERO),
            MissingOutcome::Ignored
        );
        assert_eq!(rec.status, JobStatus::Completed);
    }

    #[test]
    fn test_retention() {
        let mut rec = record();
        let now = datetime!(2024-01-10 00:00 UTC);
        assert!(!rec.retention_elapsed(Duration::ZERO, now));
        rec.status = JobStatus::Downloaded;
        assert!(rec.retention_elapsed(Duration::ZERO, now));
        assert!(rec.retention_elapsed(Duration::days(9), now));
        assert!(!rec.retention_elapsed(Duration::days(10), now));
    }

    #[test]
    fn test_record_json_schema() {
        let rec = record();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["name"], "T1_20200101_20200131");
        assert_eq!(json["remoteJobId"], "job-1");
        assert_eq!(json["status"], "SUBMITTED");
        assert_eq!(json["submittedAt"], "2024-01-01T00:00:00Z");
        assert_eq!(json["updatedAt"], "2024-01-01T00:00:00Z");
        assert!(json["outputLocation"].is_null());
        assert!(json["destinationPath"].is_null());
        assert!(json.get("missingSince").is_none());

        let decoded: TrackingRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
