//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Marker embedded in the names of in-flight temporary objects.
pub(crate) const TEMP_MARKER: &str = ".tmp.";

/// Whether an entry name belongs to an in-flight atomic write.
pub fn is_temp_name(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}

/// Join two path fragments with a single `/`.
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// How a metadata write treats an existing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace any existing object.
    Overwrite,
    /// Fail with `AlreadyExists` if the object exists.
    CreateNew,
}

/// Uniform hierarchy and object operations over a storage backend.
///
/// Paths are `/`-separated and relative to the backend root. Directory
/// entries returned by [`ObjectStore::list_entries`] carry a trailing `/`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check whether an object or directory exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, path: &str) -> StorageResult<ObjectMeta>;

    /// Create a directory and all of its parents. Idempotent.
    async fn mkdir_recursive(&self, path: &str) -> StorageResult<()>;

    /// List one directory level. A missing directory lists as empty.
    ///
    /// Temporary objects from in-flight writes are never returned.
    async fn list_entries(&self, path: &str) -> StorageResult<Vec<String>>;

    /// Read a small object (a JSON document) in full.
    async fn read_metadata(&self, path: &str) -> StorageResult<Bytes>;

    /// Write a small object atomically.
    async fn write_metadata(&self, path: &str, data: Bytes, mode: WriteMode) -> StorageResult<()>;

    /// Open an object as a byte stream.
    async fn read_artifact(&self, path: &str) -> StorageResult<ByteStream>;

    /// Write a byte stream to an object, returning the number of bytes written.
    ///
    /// The object becomes visible only once the whole stream has been written.
    async fn write_artifact(&self, path: &str, data: ByteStream) -> StorageResult<u64>;

    /// Remove an object.
    async fn remove(&self, path: &str) -> StorageResult<()>;

    /// Static identifier of the backend type, used in logs.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
}

/// Incremental upload that is published on `finish`.
#[async_trait]
pub(crate) trait StreamingUpload: Send {
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the object and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Feed a stream into an upload, aborting the upload on any error.
pub(crate) async fn drain_into(
    mut upload: Box<dyn StreamingUpload>,
    mut data: ByteStream,
) -> StorageResult<u64> {
    while let Some(chunk) = data.next().await {
        let result = match chunk {
            Ok(bytes) => upload.write(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(error = %abort_err, "Failed to abort upload after write error");
            }
            return Err(e);
        }
    }
    upload.finish().await
}

/// Wrap a single buffer as a [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Collect a [`ByteStream`] into one buffer.
pub async fn collect_stream(mut data: ByteStream) -> StorageResult<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = data.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(out))
}
