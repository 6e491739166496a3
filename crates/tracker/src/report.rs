//! Results of tracker operations.

use crate::error::TrackerError;
use ardtrack_core::{JobStatus, TrackingName, TrackingRecord};
use std::collections::BTreeMap;
use std::fmt;

/// Result of [`crate::Tracker::submit`].
#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    /// A new remote job was started and recorded.
    Submitted(TrackingRecord),
    /// A new remote job replaced a previous record with the same name.
    Replaced {
        record: TrackingRecord,
        previous: JobStatus,
    },
    /// An open record already existed; nothing was submitted.
    Existing(TrackingRecord),
}

impl SubmitOutcome {
    pub fn record(&self) -> &TrackingRecord {
        match self {
            Self::Submitted(record) | Self::Existing(record) => record,
            Self::Replaced { record, .. } => record,
        }
    }

    /// Whether this call started a remote job.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Existing(_))
    }
}

/// What happened to one record during a batch operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordAction {
    Transitioned { from: JobStatus, to: JobStatus },
    /// The remote service no longer reports the job; grace period running.
    MarkedMissing,
    Unchanged,
    /// The record changed underneath us; the observation was discarded.
    Stale,
    /// `destination` is the primary output; `files` counts pieces and sidecars.
    Downloaded {
        destination: String,
        files: usize,
        bytes: u64,
    },
    /// An artifact already at the destination was verified and adopted.
    Recovered { destination: String },
    Cancelled,
    Removed { artifact_removed: bool },
}

#[derive(Debug)]
pub struct RecordFailure {
    pub name: TrackingName,
    pub error: TrackerError,
}

/// Per-record results of a batch operation.
///
/// One record's failure never hides the others; callers decide the exit
/// status from [`BatchReport::is_success`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(TrackingName, RecordAction)>,
    pub failed: Vec<RecordFailure>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: TrackingName, result: Result<RecordAction, TrackerError>) {
        match result {
            Ok(action) => self.succeeded.push((name, action)),
            Err(error) => {
                tracing::warn!(name = %name, error = %error, "Record operation failed");
                self.failed.push(RecordFailure { name, error });
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn action(&self, name: &TrackingName) -> Option<&RecordAction> {
        self.succeeded
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, action)| action)
    }

    pub fn failure(&self, name: &TrackingName) -> Option<&TrackerError> {
        self.failed
            .iter()
            .find(|f| &f.name == name)
            .map(|f| &f.error)
    }

    pub fn count(&self, predicate: impl Fn(&RecordAction) -> bool) -> usize {
        self.succeeded.iter().filter(|(_, a)| predicate(a)).count()
    }

    pub(crate) fn sort(&mut self) {
        self.succeeded.sort_by(|a, b| a.0.cmp(&b.0));
        self.failed.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Record counts per status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSummary {
    counts: BTreeMap<JobStatus, usize>,
}

impl StatusSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TrackingRecord>) -> Self {
        let mut counts = BTreeMap::new();
        for record in records {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn get(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, usize)> + '_ {
        self.counts.iter().map(|(s, n)| (*s, *n))
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in JobStatus::ALL {
            writeln!(f, "{:<10} {}", status.as_str(), self.get(status))?;
        }
        write!(f, "{:<10} {}", "TOTAL", self.total())
    }
}
