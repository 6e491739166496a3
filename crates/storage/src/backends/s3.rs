//! Bucket-style storage backend on S3-compatible object storage.
//!
//! Buckets are flat, so directories are emulated: `mkdir_recursive` writes an
//! empty marker object `dir/` for each level, and `list_entries` lists with a
//! `/` delimiter, reporting common prefixes as directories.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ObjectMeta, ObjectStore, StreamingUpload, WriteMode, drain_into, is_temp_name,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Marker included in lazy-credentials errors so they map to config errors.
const CREDENTIALS_ERROR_MARKER: &str = "ardtrack-s3-lazy-credentials";

/// Resolves the AWS default credentials chain on first signed request.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_init(|| async {
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(aws_config::Region::new(self.region.clone()))
                    .build()
                    .await
            })
            .await;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
        _ => None,
    }
}

fn map_s3_error<E>(err: SdkError<E>, key: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match status_of(&err) {
        Some(404) => return StorageError::NotFound(key.to_string()),
        Some(412) => return StorageError::AlreadyExists(key.to_string()),
        _ => {}
    }
    if matches!(err, SdkError::TimeoutError(_)) {
        return StorageError::Timeout(format!("{key}: {err}"));
    }
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER) {
        return StorageError::Config(
            "S3 credential initialization failed. Configure credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects `endpoint/bucket/key` URLs, which MinIO needs.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .force_path_style(force_path_style);

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => builder.credentials_provider(
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "ardtrack-config"),
            ),
            (None, None) => {
                builder.credentials_provider(LazyDefaultCredentialsProvider::new(region.clone()))
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        if let Some(endpoint) = endpoint {
            // Bare host:port endpoints (e.g. "minio:9000") default to http.
            let lower = endpoint.to_ascii_lowercase();
            let url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint
            } else {
                format!("http://{endpoint}")
            };
            builder = builder.endpoint_url(url);
        }

        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// Object key for a path (applies the prefix if configured).
    fn full_key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{path}"),
            None => path.to_string(),
        }
    }

    /// Key prefix that lists the contents of directory `path`.
    fn dir_key(&self, path: &str) -> String {
        let key = self.full_key(path.trim_end_matches('/'));
        if key.is_empty() { key } else { format!("{key}/") }
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_s3_error(e, key))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.head(path).await {
            Ok(_) => return Ok(true),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        // A directory exists if anything lives under it, marker included.
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.dir_key(path))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;
        Ok(!output.contents().is_empty())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, path: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;

        Ok(ObjectMeta {
            size: u64::try_from(output.content_length().unwrap_or(0)).unwrap_or(0),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn mkdir_recursive(&self, path: &str) -> StorageResult<()> {
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = crate::traits::join_path(&current, component);
            let marker = self.dir_key(&current);
            self.put_bytes(&marker, Bytes::new()).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_entries(&self, path: &str) -> StorageResult<Vec<String>> {
        let dir = self.dir_key(path);
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir)
                .delimiter("/");
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request.send().await.map_err(|e| map_s3_error(e, path))?;

            for obj in output.contents() {
                if let Some(name) = obj.key().and_then(|k| k.strip_prefix(&dir))
                    // The directory's own marker lists as an empty name.
                    && !name.is_empty()
                    && !is_temp_name(name)
                {
                    names.push(name.to_string());
                }
            }
            for common in output.common_prefixes() {
                if let Some(name) = common.prefix().and_then(|p| p.strip_prefix(&dir)) {
                    names.push(name.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read_metadata(&self, path: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();
        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn write_metadata(&self, path: &str, data: Bytes, mode: WriteMode) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .body(data.into());
        if mode == WriteMode::CreateNew {
            // Conditional write: 412 Precondition Failed if the key exists.
            request = request.if_none_match("*");
        }
        request.send().await.map_err(|e| map_s3_error(e, path))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read_artifact(&self, path: &str) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "s3"))]
    async fn write_artifact(&self, path: &str, data: ByteStream) -> StorageResult<u64> {
        let key = self.full_key(path);
        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        let upload = S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
            settled: false,
        };
        drain_into(Box::new(upload), data).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn remove(&self, path: &str) -> StorageResult<()> {
        // delete_object succeeds on missing keys, so check first.
        self.head(path).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| map_s3_error(e, path))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.dir_key(""))
            .max_keys(1)
            .send();

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, request)
            .await
            .map_err(|_| StorageError::Timeout("S3 health check".to_string()))?
            .map_err(|e| map_s3_error(e, &self.bucket))?;
        Ok(())
    }
}

/// Multipart upload that buffers to S3's minimum part size.
///
/// An upload dropped before it completes or aborts (a caller timeout fired
/// mid-stream) aborts itself in the background.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: Vec<u8>,
    /// Completed or aborted; nothing left to clean up.
    settled: bool,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_s3_error(e, &self.key))?;

        self.parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(self.part_number)
                .build(),
        );
        self.part_number += 1;
        Ok(())
    }

    async fn abort_multipart(&self) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| map_s3_error(e, &self.key))?;
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() >= MIN_PART_SIZE {
            let part: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            self.upload_part(Bytes::from(part)).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if !self.buffer.is_empty() {
            let last = std::mem::take(&mut self.buffer);
            self.upload_part(Bytes::from(last)).await?;
        }

        // Multipart uploads need at least one non-empty part.
        if self.parts.is_empty() {
            match self.abort_multipart().await {
                Ok(()) => self.settled = true,
                Err(e) => tracing::warn!(
                    key = %self.key,
                    error = %e,
                    "Failed to abort multipart upload for empty object"
                ),
            }
            let client = self.client.clone();
            client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(|e| map_s3_error(e, &self.key))?;
            return Ok(0);
        }

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_s3_error(e, &self.key))?;

        self.settled = true;
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.abort_multipart().await?;
        self.settled = true;
        Ok(())
    }
}

impl Drop for S3Upload {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "Multipart upload dropped outside a runtime, leaving it incomplete"
            );
            return;
        };
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id);
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::warn!(key = %key, error = %e, "Failed to abort dropped multipart upload");
            }
        });
    }
}
