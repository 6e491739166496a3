//! Shared-drive storage backend over a local or mounted directory.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ObjectMeta, ObjectStore, StreamingUpload, TEMP_MARKER, WriteMode, drain_into,
    is_temp_name,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Directory-backed object store.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
}

fn not_found_or_io(path: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, rejecting traversal.
    ///
    /// Canonicalization touches the filesystem, so it runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        let name = path
            .file_name()
            .map(|n| format!("{}{suffix}", n.to_string_lossy()))
            .unwrap_or(suffix);
        path.with_file_name(name)
    }
}

/// Map `key` to a path under `root`.
///
/// Rejects `..`, absolute keys and any existing path (or nearest existing
/// ancestor, for new keys) whose canonical form leaves the root through a
/// symlink.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    let key = key.trim_end_matches('/');
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize()?;

    // Walk from the path itself up to the first ancestor that exists.
    let mut ancestor = Some(path.as_path());
    while let Some(candidate) = ancestor {
        match std::fs::symlink_metadata(candidate) {
            Ok(meta) => {
                let canonical = candidate.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("symlink target missing: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => ancestor = candidate.parent(),
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
    Ok(path)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let full = self.key_path(path).await?;
        fs::try_exists(&full).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, path: &str) -> StorageResult<ObjectMeta> {
        let full = self.key_path(path).await?;
        let metadata = fs::metadata(&full).await.map_err(not_found_or_io(path))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(ObjectMeta {
            size: metadata.len(),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn mkdir_recursive(&self, path: &str) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_entries(&self, path: &str) -> StorageResult<Vec<String>> {
        let full = self.key_path(path).await?;
        let mut entries = match fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_name(&name) {
                continue;
            }
            // file_type() does not follow symlinks; links are never listed.
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                names.push(format!("{name}/"));
            } else if file_type.is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_metadata(&self, path: &str) -> StorageResult<Bytes> {
        let full = self.key_path(path).await?;
        let data = fs::read(&full).await.map_err(not_found_or_io(path))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn write_metadata(&self, path: &str, data: Bytes, mode: WriteMode) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        self.ensure_parent(&full).await?;

        let mut temp = TempFile::new(Self::temp_sibling(&full));
        {
            let mut file = fs::File::create(temp.path()).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }

        let publish = match mode {
            WriteMode::Overwrite => {
                let renamed = fs::rename(temp.path(), &full).await;
                if renamed.is_ok() {
                    temp.persisted();
                }
                renamed
            }
            // hard_link refuses to replace an existing target, which makes the
            // create atomic against concurrent writers. The temp name is
            // removed by the guard either way.
            WriteMode::CreateNew => fs::hard_link(temp.path(), &full).await,
        };

        match publish {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_artifact(&self, path: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let full = self.key_path(path).await?;
        let file = fs::File::open(&full).await.map_err(not_found_or_io(path))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem"))]
    async fn write_artifact(&self, path: &str, data: ByteStream) -> StorageResult<u64> {
        let full = self.key_path(path).await?;
        self.ensure_parent(&full).await?;

        let temp = TempFile::new(Self::temp_sibling(&full));
        let file = fs::File::create(temp.path()).await?;
        let upload = FilesystemUpload {
            file,
            temp,
            final_path: full,
            bytes_written: 0,
        };
        drain_into(Box::new(upload), data).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, path: &str) -> StorageResult<()> {
        let full = self.key_path(path).await?;
        fs::remove_file(&full).await.map_err(not_found_or_io(path))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// Temp sibling that is deleted on drop unless it was published.
///
/// Uploads are dropped mid-stream when a caller's timeout fires, so cleanup
/// cannot wait for an explicit abort.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

/// Streams into a temp sibling, then renames over the final path.
// Field order matters: the file handle closes before the temp guard runs.
struct FilesystemUpload {
    file: fs::File,
    temp: TempFile,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let Self {
            file,
            mut temp,
            final_path,
            bytes_written,
        } = *self;
        file.sync_all().await?;
        drop(file);
        fs::rename(temp.path(), &final_path).await?;
        temp.persisted();
        Ok(bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        // Dropping closes the file, then removes the temp sibling.
        drop(self);
        Ok(())
    }
}
