//! Job tracker: submission, reconciliation, download and cleanup.
//!
//! Every multi-record operation is a sequence of independent single-record
//! commits. Each commit re-reads the stored record and applies its event to
//! the fresh copy, so a crash mid-batch leaves a consistent state and a
//! second run picks up where the first stopped.

use crate::error::{RemoteError, TrackerError, TrackerResult};
use crate::output::StagedOutput;
use crate::remote::{JobSpec, RemoteJobService, RemoteJobStatus};
use crate::report::{BatchReport, RecordAction, StatusSummary, SubmitOutcome};
use crate::retry::RetryPolicy;
use crate::store::TrackingStore;
use ardtrack_core::config::TrackerConfig;
use ardtrack_core::{
    JobEvent, JobParameters, JobStatus, MissingOutcome, NamingScheme, RecordFilter, RemoteJobId,
    TrackingName, TrackingRecord,
};
use ardtrack_storage::{ObjectStore, StorageError, join_path};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Options for [`Tracker::clean`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanOptions {
    /// Also delete the staged output of each removed record, including its
    /// pieces and sidecar.
    pub remove_artifacts: bool,
}

enum Observation {
    Reported(RemoteJobStatus),
    Missing,
}

pub struct Tracker {
    remote: Arc<dyn RemoteJobService>,
    records: TrackingStore,
    staging: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    naming: NamingScheme,
    config: TrackerConfig,
    retry: RetryPolicy,
    transfer_retry: RetryPolicy,
    clock: Clock,
}

impl Tracker {
    /// Build a tracker whose records, staged outputs and downloads all live
    /// in `staging`. Use [`Tracker::with_destination`] to download elsewhere.
    pub fn new(
        remote: Arc<dyn RemoteJobService>,
        staging: Arc<dyn ObjectStore>,
        config: TrackerConfig,
        retry: RetryPolicy,
    ) -> TrackerResult<Self> {
        config.validate().map_err(TrackerError::InvalidParameters)?;
        let naming = NamingScheme::new(&config.default_destination_template)?;
        let records = TrackingStore::new(staging.clone(), config.tracking_prefix.clone())
            .with_retry(retry.clone())
            .with_concurrency(config.concurrency);

        Ok(Self {
            remote,
            records,
            destination: staging.clone(),
            staging,
            naming,
            config,
            transfer_retry: retry.for_transfers(),
            retry,
            clock: Arc::new(OffsetDateTime::now_utc),
        })
    }

    pub fn with_destination(mut self, destination: Arc<dyn ObjectStore>) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    pub fn records(&self) -> &TrackingStore {
        &self.records
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    /// Staging path requested for a job's output.
    pub fn output_path(&self, name: &TrackingName) -> String {
        join_path(&self.config.output_prefix, &format!("{name}.tif"))
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit a job unless an open record for the same parameters exists.
    ///
    /// A terminal record, or any record when `overwrite` is set, is replaced
    /// by a fresh submission. With `overwrite`, an unreadable record is
    /// replaced as well.
    #[instrument(skip(self, params), fields(tile = %params.tile))]
    pub async fn submit(
        &self,
        params: JobParameters,
        overwrite: bool,
    ) -> TrackerResult<SubmitOutcome> {
        self.naming.validate(&params)?;
        let name = self.naming.name(&params);

        let (existing, unreadable) = match self.records.get(&name).await {
            Ok(existing) => (existing, false),
            Err(TrackerError::CorruptRecord { reason, .. }) if overwrite => {
                tracing::warn!(name = %name, reason = %reason, "Replacing unreadable tracking record");
                (None, true)
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = existing.as_ref()
            && !record.is_terminal()
            && !overwrite
        {
            tracing::info!(name = %name, status = %record.status, "Job already tracked, not resubmitting");
            return Ok(SubmitOutcome::Existing(record.clone()));
        }

        let spec = JobSpec {
            name: name.clone(),
            parameters: params.clone(),
            output_path: self.output_path(&name),
        };
        let job_id = self
            .retry
            .run("remote.submit", || self.remote.submit(&spec))
            .await?;
        tracing::info!(name = %name, job_id = %job_id, "Submitted remote job");

        let record = TrackingRecord::new(name.clone(), job_id.clone(), params, self.now());
        let persisted = if existing.is_some() || unreadable {
            self.records.put(&record).await.map(|()| true)
        } else {
            self.records.create(&record).await
        };

        match persisted {
            Ok(true) => {}
            Ok(false) => {
                self.abandon(&job_id).await;
                let winner = self.records.get(&name).await?.ok_or_else(|| {
                    TrackerError::InconsistentState(format!(
                        "record {name} reported as existing but cannot be read"
                    ))
                })?;
                tracing::info!(name = %name, "Concurrent submission won, keeping its record");
                return Ok(SubmitOutcome::Existing(winner));
            }
            Err(e) => {
                self.abandon(&job_id).await;
                return Err(e);
            }
        }

        match existing {
            Some(previous) => {
                if previous.status.is_open() {
                    self.abandon(&previous.remote_job_id).await;
                }
                tracing::info!(name = %name, previous = %previous.status, "Replaced tracking record");
                Ok(SubmitOutcome::Replaced {
                    record,
                    previous: previous.status,
                })
            }
            None => Ok(SubmitOutcome::Submitted(record)),
        }
    }

    /// Cancel a remote job nobody will track.
    async fn abandon(&self, job_id: &RemoteJobId) {
        if let Err(e) = self.cancel_remote(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel abandoned remote job");
        }
    }

    /// Best-effort remote cancel. Only fatal errors are returned.
    async fn cancel_remote(&self, job_id: &RemoteJobId) -> TrackerResult<()> {
        match self
            .retry
            .run("remote.cancel", || self.remote.cancel(job_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Remote cancel failed");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Poll the remote service for every open record matching `filter` and
    /// persist the resulting transitions.
    #[instrument(skip(self, filter))]
    pub async fn update(&self, filter: &RecordFilter) -> TrackerResult<BatchReport> {
        let records = self.select(filter, |s| s.is_open()).await?;
        let mut report = BatchReport::new();
        if records.is_empty() {
            return Ok(report);
        }

        let observations = self.poll(&records).await?;
        let mut commits = stream::iter(observations)
            .map(|(name, job_id, observation)| async move {
                let result = match observation {
                    Ok(observation) => self.commit_observation(&name, &job_id, observation).await,
                    Err(e) => Err(e),
                };
                (name, result)
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((name, result)) = commits.next().await {
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                result => report.record(name, result),
            }
        }
        report.sort();
        Ok(report)
    }

    #[allow(clippy::type_complexity)]
    async fn poll(
        &self,
        records: &[TrackingRecord],
    ) -> TrackerResult<Vec<(TrackingName, RemoteJobId, TrackerResult<Observation>)>> {
        let ids: Vec<RemoteJobId> = records.iter().map(|r| r.remote_job_id.clone()).collect();

        let batch = self
            .retry
            .run("remote.status_batch", || self.remote.status_batch(&ids))
            .await;
        let error = match batch {
            Ok(statuses) => {
                return Ok(records
                    .iter()
                    .map(|r| {
                        let observation = match statuses.get(&r.remote_job_id) {
                            Some(status) => Observation::Reported(status.clone()),
                            None => Observation::Missing,
                        };
                        (r.name.clone(), r.remote_job_id.clone(), Ok(observation))
                    })
                    .collect());
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => e,
        };

        tracing::warn!(
            error = %error,
            service = self.remote.service_name(),
            "Batch status query failed, falling back to per-job queries"
        );
        let mut polls = stream::iter(records)
            .map(|record| async move {
                let result = self
                    .retry
                    .run("remote.status", || self.remote.status(&record.remote_job_id))
                    .await;
                (record, result)
            })
            .buffer_unordered(self.config.concurrency);

        let mut observations = Vec::with_capacity(records.len());
        while let Some((record, result)) = polls.next().await {
            let observation = match result {
                Ok(status) => Ok(Observation::Reported(status)),
                Err(RemoteError::NotFound(_)) => Ok(Observation::Missing),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => Err(e.into()),
            };
            observations.push((record.name.clone(), record.remote_job_id.clone(), observation));
        }
        Ok(observations)
    }

    async fn commit_observation(
        &self,
        name: &TrackingName,
        job_id: &RemoteJobId,
        observation: Observation,
    ) -> TrackerResult<RecordAction> {
        let Some(mut record) = self.records.get(name).await? else {
            return Ok(RecordAction::Stale);
        };
        if !record.status.is_open() || &record.remote_job_id != job_id {
            tracing::debug!(name = %name, status = %record.status, "Discarding stale observation");
            return Ok(RecordAction::Stale);
        }

        let from = record.status;
        let now = self.now();
        let event = match &observation {
            Observation::Reported(status) => status.event(&self.output_path(name)),
            Observation::Missing => None,
        };

        let changed = match event {
            Some(event) => record
                .apply(&event, now)
                .map_err(|e| TrackerError::transition(name, e))?,
            None => match record.observe_missing(now, self.config.missing_grace_period()) {
                MissingOutcome::Marked => {
                    tracing::warn!(
                        name = %name,
                        job_id = %job_id,
                        "Remote service no longer reports job, waiting for grace period"
                    );
                    true
                }
                MissingOutcome::Expired => {
                    tracing::warn!(
                        name = %name,
                        job_id = %job_id,
                        "Remote job missing past grace period, marking FAILED"
                    );
                    true
                }
                MissingOutcome::Pending | MissingOutcome::Ignored => false,
            },
        };

        if changed {
            self.records.put(&record).await?;
        }

        if record.status != from {
            tracing::info!(name = %name, from = %from, to = %record.status, "Job status changed");
            Ok(RecordAction::Transitioned {
                from,
                to: record.status,
            })
        } else if record.missing_since.is_some() {
            Ok(RecordAction::MarkedMissing)
        } else {
            Ok(RecordAction::Unchanged)
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Records matching `filter`, oldest submission first.
    pub async fn list(&self, filter: &RecordFilter) -> TrackerResult<Vec<TrackingRecord>> {
        self.select(filter, |_| true).await
    }

    pub async fn get(&self, name: &TrackingName) -> TrackerResult<Option<TrackingRecord>> {
        self.records.get(name).await
    }

    /// Record counts per status.
    pub async fn summary(&self, filter: &RecordFilter) -> TrackerResult<StatusSummary> {
        let records = self.list(filter).await?;
        Ok(StatusSummary::from_records(&records))
    }

    async fn select(
        &self,
        filter: &RecordFilter,
        eligible: impl Fn(JobStatus) -> bool,
    ) -> TrackerResult<Vec<TrackingRecord>> {
        let mut records: Vec<TrackingRecord> = self
            .records
            .list()
            .await?
            .into_iter()
            .filter(|r| eligible(r.status) && filter.matches(r))
            .collect();
        records.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Copy the staged output of every COMPLETED record to its destination
    /// path and mark it DOWNLOADED. With `overwrite`, DOWNLOADED records are
    /// fetched again.
    #[instrument(skip(self, filter))]
    pub async fn download(
        &self,
        filter: &RecordFilter,
        overwrite: bool,
    ) -> TrackerResult<BatchReport> {
        let records = self
            .select(filter, |s| {
                s == JobStatus::Completed || (overwrite && s == JobStatus::Downloaded)
            })
            .await?;

        let mut report = BatchReport::new();
        let mut transfers = stream::iter(records)
            .map(|record| async move {
                let name = record.name.clone();
                (name, self.download_one(record, overwrite).await)
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((name, result)) = transfers.next().await {
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                result => report.record(name, result),
            }
        }
        report.sort();
        Ok(report)
    }

    async fn download_one(
        &self,
        record: TrackingRecord,
        overwrite: bool,
    ) -> TrackerResult<RecordAction> {
        let name = &record.name;
        let source = record
            .output_location
            .as_deref()
            .ok_or_else(|| TrackerError::MissingOutput(name.to_string()))?;
        let destination = self.naming.destination_path(&record.parameters)?;
        let target = destination.as_str();

        let output = StagedOutput::new(source);
        let transfers: Vec<(String, String)> = self
            .staged_pieces(&output)
            .await?
            .iter()
            .map(|entry| (output.path(entry), output.destination_for(entry, target)))
            .collect();

        if !overwrite
            && record.status == JobStatus::Completed
            && self.adoptable(name, target, &transfers).await?
        {
            self.mark_downloaded(name, target).await?;
            tracing::info!(name = %name, destination = %target, "Adopted artifact already at destination");
            return Ok(RecordAction::Recovered { destination });
        }
        if transfers.is_empty() {
            return Err(StorageError::NotFound(source.to_string()).into());
        }

        let mut parents: Vec<&str> = transfers
            .iter()
            .filter_map(|(_, to)| to.rsplit_once('/').map(|(parent, _)| parent))
            .collect();
        parents.dedup();
        for parent in parents {
            self.retry
                .run("artifact.mkdir", || self.destination.mkdir_recursive(parent))
                .await?;
        }

        let mut bytes = 0;
        for (from, to) in &transfers {
            bytes += self
                .transfer_retry
                .run("artifact.transfer", || async move {
                    let data = self.staging.read_artifact(from).await?;
                    let written = self.destination.write_artifact(to, data).await?;
                    self.verify(name, to, written).await?;
                    Ok::<u64, TrackerError>(written)
                })
                .await?;
        }

        self.mark_downloaded(name, target).await?;
        let files = transfers.len();
        tracing::info!(name = %name, destination = %target, files, bytes, "Downloaded artifact");
        Ok(RecordAction::Downloaded {
            destination,
            files,
            bytes,
        })
    }

    /// Staging entries that make up `output`, sorted by name.
    async fn staged_pieces(&self, output: &StagedOutput) -> TrackerResult<Vec<String>> {
        let entries = self
            .retry
            .run("artifact.list", || self.staging.list_entries(output.dir()))
            .await?;
        Ok(entries.into_iter().filter(|e| output.matches(e)).collect())
    }

    /// Whether the artifacts left at the destination by an interrupted run
    /// are complete.
    async fn adoptable(
        &self,
        name: &TrackingName,
        primary: &str,
        transfers: &[(String, String)],
    ) -> TrackerResult<bool> {
        // Staged output already reclaimed; the destination copy is all there is.
        if transfers.is_empty() {
            return match self
                .retry
                .run("artifact.head", || self.destination.head(primary))
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e.into()),
            };
        }

        for (from, to) in transfers {
            let existing = match self
                .retry
                .run("artifact.head", || self.destination.head(to))
                .await
            {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            match self
                .retry
                .run("artifact.head", || self.staging.head(from))
                .await
            {
                Ok(staged) if staged.size == existing.size => {}
                Ok(staged) => {
                    tracing::warn!(
                        name = %name,
                        path = %to,
                        staged = staged.size,
                        existing = existing.size,
                        "Artifact at destination does not match staged output, transferring again"
                    );
                    return Ok(false);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    async fn verify(&self, name: &TrackingName, destination: &str, written: u64) -> TrackerResult<()> {
        let meta = match self.destination.head(destination).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                return Err(TrackerError::DownloadVerification {
                    name: name.to_string(),
                    reason: format!("{destination} missing after write"),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if meta.size != written {
            return Err(TrackerError::DownloadVerification {
                name: name.to_string(),
                reason: format!(
                    "{destination} holds {} bytes, {written} were written",
                    meta.size
                ),
            });
        }
        Ok(())
    }

    async fn mark_downloaded(&self, name: &TrackingName, destination: &str) -> TrackerResult<()> {
        let mut record = self.records.get(name).await?.ok_or_else(|| {
            TrackerError::InconsistentState(format!("record {name} disappeared during download"))
        })?;
        let event = JobEvent::Downloaded {
            destination_path: destination.to_string(),
        };
        record
            .apply(&event, self.now())
            .map_err(|e| TrackerError::transition(name, e))?;
        self.records.put(&record).await
    }

    // ------------------------------------------------------------------
    // Cleanup and cancellation
    // ------------------------------------------------------------------

    /// Remove terminal records past the retention period.
    #[instrument(skip(self, filter))]
    pub async fn clean(
        &self,
        filter: &RecordFilter,
        options: CleanOptions,
    ) -> TrackerResult<BatchReport> {
        let now = self.now();
        let retention = self.config.retention();
        let records = self
            .select(filter, |s| s.is_terminal())
            .await?
            .into_iter()
            .filter(|r| r.retention_elapsed(retention, now))
            .collect::<Vec<_>>();

        let mut report = BatchReport::new();
        let mut removals = stream::iter(records)
            .map(|record| async move {
                let name = record.name.clone();
                (name, self.clean_one(record, options).await)
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((name, result)) = removals.next().await {
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                result => report.record(name, result),
            }
        }
        report.sort();
        Ok(report)
    }

    async fn clean_one(
        &self,
        record: TrackingRecord,
        options: CleanOptions,
    ) -> TrackerResult<RecordAction> {
        // An overwrite submission may have reopened the name since listing.
        let Some(current) = self.records.get(&record.name).await? else {
            return Ok(RecordAction::Removed {
                artifact_removed: false,
            });
        };
        if !current.is_terminal() || current.remote_job_id != record.remote_job_id {
            return Ok(RecordAction::Stale);
        }

        let artifact_removed = options.remove_artifacts && self.remove_staged(&current).await;
        self.records.delete(&current.name).await?;
        tracing::info!(name = %current.name, status = %current.status, artifact_removed, "Removed tracking record");
        Ok(RecordAction::Removed { artifact_removed })
    }

    /// Remove every staged piece of the record's output. True when nothing
    /// is left behind.
    async fn remove_staged(&self, record: &TrackingRecord) -> bool {
        let Some(location) = record.output_location.as_deref() else {
            return false;
        };
        let output = StagedOutput::new(location);
        let pieces = match self.staged_pieces(&output).await {
            Ok(pieces) => pieces,
            Err(e) => {
                tracing::warn!(name = %record.name, location, error = %e, "Failed to list staged artifacts");
                return false;
            }
        };

        let mut removed = true;
        for entry in &pieces {
            let path = output.path(entry);
            match self
                .retry
                .run("artifact.remove", || self.staging.remove(&path))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(name = %record.name, path = %path, error = %e, "Failed to remove staged artifact");
                    removed = false;
                }
            }
        }
        removed
    }

    /// Cancel every non-terminal record matching `filter`.
    #[instrument(skip(self, filter))]
    pub async fn cancel(&self, filter: &RecordFilter) -> TrackerResult<BatchReport> {
        let records = self.select(filter, |s| !s.is_terminal()).await?;

        let mut report = BatchReport::new();
        let mut cancels = stream::iter(records)
            .map(|record| async move {
                let name = record.name.clone();
                (name, self.cancel_one(record).await)
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((name, result)) = cancels.next().await {
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                result => report.record(name, result),
            }
        }
        report.sort();
        Ok(report)
    }

    async fn cancel_one(&self, record: TrackingRecord) -> TrackerResult<RecordAction> {
        if record.status.is_open() {
            self.cancel_remote(&record.remote_job_id).await?;
        }

        let Some(mut current) = self.records.get(&record.name).await? else {
            return Ok(RecordAction::Stale);
        };
        if current.is_terminal() || current.remote_job_id != record.remote_job_id {
            return Ok(RecordAction::Stale);
        }
        current
            .apply(&JobEvent::Cancel, self.now())
            .map_err(|e| TrackerError::transition(&current.name, e))?;
        self.records.put(&current).await?;
        tracing::info!(name = %current.name, "Cancelled job");
        Ok(RecordAction::Cancelled)
    }
}
