//! In-memory remote service and failure-injecting store wrapper.

use ardtrack_core::config::TrackerConfig;
use ardtrack_core::{DateRange, JobParameters, RemoteJobId, SensorId, TileId};
use ardtrack_storage::{
    ByteStream, FilesystemBackend, ObjectMeta, ObjectStore, StorageError, StorageResult,
    WriteMode, bytes_stream,
};
use ardtrack_tracker::{JobSpec, RemoteError, RemoteJobService, RemoteJobStatus, RemoteState};
use ardtrack_tracker::{RetryPolicy, Tracker};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

pub fn params(tile: &str, start: &str, end: &str) -> JobParameters {
    JobParameters::new(
        TileId::new(tile).unwrap(),
        DateRange::parse_compact(start, end).unwrap(),
    )
}

pub fn params_with_sensor(sensor: &str, tile: &str, start: &str, end: &str) -> JobParameters {
    params(tile, start, end).with_sensor(SensorId::new(sensor).unwrap())
}

#[derive(Default)]
struct RemoteBook {
    next_id: u32,
    jobs: HashMap<RemoteJobId, RemoteJobStatus>,
    specs: Vec<JobSpec>,
    cancelled: Vec<RemoteJobId>,
    submit_errors: VecDeque<RemoteError>,
    status_errors: VecDeque<RemoteError>,
    batch_errors: VecDeque<RemoteError>,
}

/// Scriptable in-memory remote service.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteBook>,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, id: &RemoteJobId, status: RemoteJobStatus) {
        self.state.lock().unwrap().jobs.insert(id.clone(), status);
    }

    /// Forget a job, as a service with expiring history would.
    pub fn forget(&self, id: &RemoteJobId) {
        self.state.lock().unwrap().jobs.remove(id);
    }

    pub fn fail_next_submit(&self, err: RemoteError) {
        self.state.lock().unwrap().submit_errors.push_back(err);
    }

    pub fn fail_next_status(&self, err: RemoteError) {
        self.state.lock().unwrap().status_errors.push_back(err);
    }

    pub fn fail_next_batch(&self, err: RemoteError) {
        self.state.lock().unwrap().batch_errors.push_back(err);
    }

    pub fn specs(&self) -> Vec<JobSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn cancelled(&self) -> Vec<RemoteJobId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteJobService for FakeRemote {
    async fn submit(&self, spec: &JobSpec) -> Result<RemoteJobId, RemoteError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.submit_errors.pop_front() {
            return Err(err);
        }
        state.next_id += 1;
        let id = RemoteJobId::new(format!("op-{}", state.next_id));
        state
            .jobs
            .insert(id.clone(), RemoteJobStatus::new(RemoteState::Queued));
        state.specs.push(spec.clone());
        Ok(id)
    }

    async fn status(&self, id: &RemoteJobId) -> Result<RemoteJobStatus, RemoteError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.status_errors.pop_front() {
            return Err(err);
        }
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn status_batch(
        &self,
        ids: &[RemoteJobId],
    ) -> Result<HashMap<RemoteJobId, RemoteJobStatus>, RemoteError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.batch_errors.pop_front() {
            return Err(err);
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    async fn cancel(&self, id: &RemoteJobId) -> Result<(), RemoteError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(id.clone());
        if let Some(job) = state.jobs.get_mut(id)
            && matches!(job.state, RemoteState::Queued | RemoteState::Running)
        {
            job.state = RemoteState::Cancelled;
        }
        Ok(())
    }

    fn service_name(&self) -> &'static str {
        "fake"
    }
}

/// Wraps a store and fails selected operations on demand.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    /// Remaining failures for writes whose path contains the pattern.
    write_failures: Mutex<Vec<(String, u32)>>,
    /// Remaining failures for artifact reads.
    pub read_failures: AtomicU32,
    /// When set, artifact writes drop the final byte of the stream.
    pub truncate_artifacts: AtomicU32,
    /// When set, removals fail with a non-retryable error.
    pub deny_removals: AtomicU32,
    /// Delay before each chunk of an artifact read, in milliseconds.
    pub read_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            write_failures: Mutex::new(Vec::new()),
            read_failures: AtomicU32::new(0),
            truncate_artifacts: AtomicU32::new(0),
            deny_removals: AtomicU32::new(0),
            read_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn fail_writes(&self, pattern: &str, count: u32) {
        self.write_failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), count));
    }

    fn take_write_failure(&self, path: &str) -> StorageResult<()> {
        let mut failures = self.write_failures.lock().unwrap();
        for (pattern, remaining) in failures.iter_mut() {
            if *remaining > 0 && path.contains(pattern.as_str()) {
                *remaining -= 1;
                return Err(StorageError::Io(std::io::Error::other(format!(
                    "injected write failure for {path}"
                ))));
            }
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.exists(path).await
    }

    async fn head(&self, path: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(path).await
    }

    async fn mkdir_recursive(&self, path: &str) -> StorageResult<()> {
        self.inner.mkdir_recursive(path).await
    }

    async fn list_entries(&self, path: &str) -> StorageResult<Vec<String>> {
        self.inner.list_entries(path).await
    }

    async fn read_metadata(&self, path: &str) -> StorageResult<Bytes> {
        self.inner.read_metadata(path).await
    }

    async fn write_metadata(&self, path: &str, data: Bytes, mode: WriteMode) -> StorageResult<()> {
        self.take_write_failure(path)?;
        self.inner.write_metadata(path, data, mode).await
    }

    async fn read_artifact(&self, path: &str) -> StorageResult<ByteStream> {
        if Self::take(&self.read_failures) {
            return Err(StorageError::Io(std::io::Error::other("injected read failure")));
        }
        let data = self.inner.read_artifact(path).await?;
        let delay = Duration::from_millis(self.read_delay_ms.load(Ordering::SeqCst));
        if delay.is_zero() {
            return Ok(data);
        }
        Ok(Box::pin(data.then(move |chunk| async move {
            tokio::time::sleep(delay).await;
            chunk
        })))
    }

    async fn write_artifact(&self, path: &str, data: ByteStream) -> StorageResult<u64> {
        self.take_write_failure(path)?;
        let written = self.inner.write_artifact(path, data).await?;
        if Self::take(&self.truncate_artifacts) && written > 0 {
            // Simulate a backend that reports success for a short object.
            let full = ardtrack_storage::collect_stream(self.inner.read_artifact(path).await?).await?;
            let short = full.slice(..full.len() - 1);
            self.inner.write_artifact(path, bytes_stream(short)).await?;
        }
        Ok(written)
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        if self.deny_removals.load(Ordering::SeqCst) > 0 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "injected permission failure",
            )));
        }
        self.inner.remove(path).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// A tracker over a temp-dir store and a fake remote, with a settable clock.
pub struct Harness {
    _dir: TempDir,
    pub remote: Arc<FakeRemote>,
    pub store: Arc<FlakyStore>,
    pub backend: Arc<FilesystemBackend>,
    now: Arc<Mutex<OffsetDateTime>>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
        Self {
            _dir: dir,
            remote: FakeRemote::new(),
            store: FlakyStore::new(backend.clone()),
            backend,
            now: Arc::new(Mutex::new(time::macros::datetime!(2024-03-01 12:00 UTC))),
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            Duration::from_secs(5),
        )
    }

    pub fn tracker(&self) -> Tracker {
        self.tracker_with(TrackerConfig::default())
    }

    pub fn tracker_with(&self, config: TrackerConfig) -> Tracker {
        self.tracker_with_retry(config, Self::fast_retry())
    }

    pub fn tracker_with_retry(&self, config: TrackerConfig, retry: RetryPolicy) -> Tracker {
        let now = self.now.clone();
        Tracker::new(self.remote.clone(), self.store.clone(), config, retry)
        .unwrap()
        .with_clock(move || *now.lock().unwrap())
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Stage an output the way the remote service would.
    pub async fn stage_output(&self, path: &str, data: &[u8]) {
        self.backend
            .write_artifact(path, bytes_stream(Bytes::copy_from_slice(data)))
            .await
            .unwrap();
    }
}
