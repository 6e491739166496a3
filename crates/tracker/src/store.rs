//! Durable tracking records: one JSON document per job under the tracking prefix.

use crate::error::{TrackerError, TrackerResult};
use crate::retry::RetryPolicy;
use ardtrack_core::{TrackingName, TrackingRecord};
use ardtrack_storage::{ObjectStore, StorageError, WriteMode, join_path};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::instrument;

const RECORD_EXTENSION: &str = ".json";

/// Record store on top of an [`ObjectStore`].
///
/// Writes are whole-document and atomic; concurrent readers see either the
/// previous or the new document.
pub struct TrackingStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
    concurrency: usize,
    prefix_ready: OnceCell<()>,
}

impl TrackingStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
            concurrency: 8,
            prefix_ready: OnceCell::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn record_path(&self, name: &TrackingName) -> String {
        join_path(&self.prefix, &format!("{name}{RECORD_EXTENSION}"))
    }

    async fn ensure_prefix(&self) -> TrackerResult<()> {
        self.prefix_ready
            .get_or_try_init(|| async {
                self.retry
                    .run("tracking.mkdir", || self.store.mkdir_recursive(&self.prefix))
                    .await
            })
            .await?;
        Ok(())
    }

    /// Fetch a record. A missing document is `None`.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn get(&self, name: &TrackingName) -> TrackerResult<Option<TrackingRecord>> {
        let path = self.record_path(name);
        let data = match self
            .retry
            .run("tracking.read", || self.store.read_metadata(&path))
            .await
        {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode(name.as_str(), &data).map(Some)
    }

    /// Write a record, replacing any existing document.
    #[instrument(skip(self, record), fields(name = %record.name, status = %record.status))]
    pub async fn put(&self, record: &TrackingRecord) -> TrackerResult<()> {
        self.ensure_prefix().await?;
        let path = self.record_path(&record.name);
        let data = encode(record)?;
        self.retry
            .run("tracking.write", || {
                self.store
                    .write_metadata(&path, data.clone(), WriteMode::Overwrite)
            })
            .await?;
        Ok(())
    }

    /// Write a record only if none exists. Returns `false` when another
    /// writer got there first.
    #[instrument(skip(self, record), fields(name = %record.name))]
    pub async fn create(&self, record: &TrackingRecord) -> TrackerResult<bool> {
        self.ensure_prefix().await?;
        let path = self.record_path(&record.name);
        let data = encode(record)?;
        let result = self
            .retry
            .run("tracking.create", || {
                self.store
                    .write_metadata(&path, data.clone(), WriteMode::CreateNew)
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(StorageError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a record. Returns `false` if it was already gone.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &TrackingName) -> TrackerResult<bool> {
        let path = self.record_path(name);
        match self
            .retry
            .run("tracking.remove", || self.store.remove(&path))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every record.
    ///
    /// Unreadable documents are logged and skipped so that one corrupt file
    /// does not hide the rest. Documents removed between listing and reading
    /// are skipped silently.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn list(&self) -> TrackerResult<Vec<TrackingRecord>> {
        let entries = self
            .retry
            .run("tracking.list", || self.store.list_entries(&self.prefix))
            .await?;

        let names: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.ends_with('/'))
            .filter_map(|entry| entry.strip_suffix(RECORD_EXTENSION).map(str::to_string))
            .collect();

        let loaded: Vec<TrackerResult<Option<TrackingRecord>>> = stream::iter(names)
            .map(|stem| async move {
                let name = match TrackingName::new(stem.as_str()) {
                    Ok(name) => name,
                    Err(e) => {
                        return Err(TrackerError::CorruptRecord {
                            name: stem,
                            reason: e.to_string(),
                        });
                    }
                };
                self.get(&name).await
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::with_capacity(loaded.len());
        for result in loaded {
            match result {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(TrackerError::CorruptRecord { name, reason }) => {
                    tracing::warn!(name = %name, reason = %reason, "Skipping unreadable tracking record");
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

fn encode(record: &TrackingRecord) -> TrackerResult<Bytes> {
    serde_json::to_vec_pretty(record)
        .map(Bytes::from)
        .map_err(|e| TrackerError::CorruptRecord {
            name: record.name.to_string(),
            reason: e.to_string(),
        })
}

fn decode(name: &str, data: &[u8]) -> TrackerResult<TrackingRecord> {
    let record: TrackingRecord =
        serde_json::from_slice(data).map_err(|e| TrackerError::CorruptRecord {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    if record.name.as_str() != name {
        return Err(TrackerError::CorruptRecord {
            name: name.to_string(),
            reason: format!("document names a different job: {}", record.name),
        });
    }
    Ok(record)
}
