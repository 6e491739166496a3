//! Core domain types and shared logic for ardtrack.
//!
//! This crate defines the data model used across all other crates:
//! - Job parameters (sensor, tile, date range)
//! - Tracking names and destination templates
//! - Tracking records and the job state machine
//! - Record filters
//! - Configuration

pub mod config;
pub mod error;
pub mod filter;
pub mod job;
pub mod naming;
pub mod record;

pub use error::{Error, Result};
pub use filter::RecordFilter;
pub use job::{DateRange, JobParameters, SensorId, TileId};
pub use naming::{NameParts, NamingScheme, PathTemplate, TrackingName};
pub use record::{
    JobEvent, JobStatus, MISSING_JOB_REASON, MissingOutcome, RemoteJobId, TrackingRecord,
    next_status,
};
