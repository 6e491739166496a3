//! Object storage abstraction and backends for ardtrack.
//!
//! This crate provides:
//! - A uniform `ObjectStore` interface for tracking documents and artifacts
//! - Atomic metadata writes with create-only semantics
//! - Backends: shared-drive (filesystem) and bucket (S3-compatible)

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, ObjectMeta, ObjectStore, WriteMode, bytes_stream, collect_stream, is_temp_name,
    join_path,
};

use ardtrack_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
