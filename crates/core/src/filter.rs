//! Record selection filters shared by list, update, download, clean and cancel.

use crate::job::{DateRange, SensorId, TileId};
use crate::naming::TrackingName;
use crate::record::{JobStatus, TrackingRecord};

/// Selects tracking records. Empty criteria match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub statuses: Vec<JobStatus>,
    pub tile: Option<TileId>,
    pub sensor: Option<SensorId>,
    /// Matches records whose date range overlaps this one.
    pub date_range: Option<DateRange>,
    pub names: Vec<TrackingName>,
}

impl RecordFilter {
    /// A filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_tile(mut self, tile: TileId) -> Self {
        self.tile = Some(tile);
        self
    }

    pub fn with_sensor(mut self, sensor: SensorId) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_name(mut self, name: TrackingName) -> Self {
        self.names.push(name);
        self
    }

    /// Whether a status passes the status criterion.
    pub fn allows_status(&self, status: JobStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }

    pub fn matches(&self, record: &TrackingRecord) -> bool {
        let params = &record.parameters;
        self.allows_status(record.status)
            && (self.names.is_empty() || self.names.contains(&record.name))
            && self.tile.as_ref().is_none_or(|t| *t == params.tile)
            && self
                .sensor
                .as_ref()
                .is_none_or(|s| params.sensor.as_ref() == Some(s))
            && self
                .date_range
                .as_ref()
                .is_none_or(|r| r.overlaps(&params.date_range))
    }
}
