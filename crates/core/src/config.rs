//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Object store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Shared-drive style storage rooted at a local or mounted directory.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// Bucket style storage (S3 or compatible).
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Falls back to AWS_ACCESS_KEY_ID if not set.
        access_key_id: Option<String>,
        /// Falls back to AWS_SECRET_ACCESS_KEY if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a non-empty path".to_string());
                }
                Ok(())
            }
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 storage requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Remote job service client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the job service API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token. Prefer ARDTRACK_REMOTE__TOKEN over storing it in a file.
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!(
                "remote.base_url must be an http(s) URL, got {:?}",
                self.base_url
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err("remote.request_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Tracker behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Directory holding one JSON document per tracked job.
    #[serde(default = "default_tracking_prefix")]
    pub tracking_prefix: String,
    /// Directory the remote service stages outputs into.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Destination template used when a job carries none.
    #[serde(default = "default_destination_template")]
    pub default_destination_template: String,
    /// Maximum concurrent per-record remote calls or transfers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a job may be absent from the remote service before it is
    /// resolved to FAILED.
    #[serde(default = "default_missing_grace_period_secs")]
    pub missing_grace_period_secs: u64,
    /// Minimum age of a terminal record before `clean` removes it.
    #[serde(default)]
    pub retention_secs: u64,
}

fn default_tracking_prefix() -> String {
    "ARD_TRACKING".to_string()
}

fn default_output_prefix() -> String {
    "ARD_PREARD".to_string()
}

fn default_destination_template() -> String {
    "{tile}/{name}.tif".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_missing_grace_period_secs() -> u64 {
    3600 // 1 hour
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tracking_prefix: default_tracking_prefix(),
            output_prefix: default_output_prefix(),
            default_destination_template: default_destination_template(),
            concurrency: default_concurrency(),
            missing_grace_period_secs: default_missing_grace_period_secs(),
            retention_secs: 0,
        }
    }
}

impl TrackerConfig {
    pub fn missing_grace_period(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        Duration::seconds(i64::try_from(self.missing_grace_period_secs).unwrap_or(i64::MAX))
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        for (field, prefix) in [
            ("tracking_prefix", &self.tracking_prefix),
            ("output_prefix", &self.output_prefix),
        ] {
            if prefix.is_empty() || prefix.starts_with('/') || prefix.split('/').any(|c| c == "..")
            {
                return Err(format!(
                    "tracker.{field} must be a non-empty relative path, got {prefix:?}"
                ));
            }
        }
        if self.concurrency == 0 {
            return Err("tracker.concurrency cannot be 0".to_string());
        }
        crate::naming::PathTemplate::parse(&self.default_destination_template)
            .map_err(|e| format!("tracker.default_destination_template: {e}"))?;
        Ok(())
    }
}

/// Retry policy for remote and store calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Timeout applied to each attempt of a remote or metadata call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for each attempt at copying one artifact, stream included.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_transfer_timeout_secs() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            timeout_secs: default_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("retry.max_backoff_ms cannot be below initial_backoff_ms".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("retry.timeout_secs cannot be 0".to_string());
        }
        if self.transfer_timeout_secs == 0 {
            return Err("retry.transfer_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Staging store: remote outputs and tracking documents live here.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Where downloaded artifacts are written. Defaults to the staging store.
    #[serde(default)]
    pub destination: Option<StorageConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Validate every section, prefixing errors with the section name.
    pub fn validate(&self) -> Result<(), String> {
        self.storage
            .validate()
            .map_err(|e| format!("storage: {e}"))?;
        if let Some(destination) = &self.destination {
            destination
                .validate()
                .map_err(|e| format!("destination: {e}"))?;
        }
        self.remote.validate()?;
        self.tracker.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}
