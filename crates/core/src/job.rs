//! Job parameter types: sensor, tile, date range.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::Date;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Identifier of the sensor / image collection a job reads from.
///
/// Earth Engine style collection ids (`LANDSAT/LC08/C01/T1_SR`) are accepted.
/// `.` is reserved because it encodes `/` in tracking names.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorId(String);

impl SensorId {
    /// Create from a string, validating format.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidSensor(
                "sensor id cannot be empty".to_string(),
            ));
        }
        if id.starts_with('/') || id.ends_with('/') || id.contains("//") {
            return Err(crate::Error::InvalidSensor(format!(
                "sensor id has an empty path segment: {id}"
            )));
        }
        for c in id.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '/') {
                return Err(crate::Error::InvalidSensor(format!(
                    "invalid character in sensor id: {c}"
                )));
            }
        }
        Ok(Self(id))
    }

    /// Get the sensor id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key-safe form used inside tracking names (`/` becomes `.`).
    pub fn encoded(&self) -> String {
        self.0.replace('/', ".")
    }

    /// Inverse of [`SensorId::encoded`].
    pub fn decode(encoded: &str) -> crate::Result<Self> {
        Self::new(encoded.replace('.', "/"))
    }
}

impl TryFrom<String> for SensorId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<SensorId> for String {
    fn from(value: SensorId) -> Self {
        value.0
    }
}

impl fmt::Debug for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorId({})", self.0)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tile in the processing grid.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId(String);

impl TileId {
    /// Create from a string. Only ASCII alphanumerics and `-` are allowed.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidTile(
                "tile id cannot be empty".to_string(),
            ));
        }
        for c in id.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-') {
                return Err(crate::Error::InvalidTile(format!(
                    "invalid character in tile id: {c}"
                )));
            }
        }
        Ok(Self(id))
    }

    /// Tile label for a grid cell, e.g. `h012v034`.
    pub fn from_grid(horizontal: u32, vertical: u32) -> Self {
        Self(format!("h{horizontal:03}v{vertical:03}"))
    }

    /// Get the tile id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TileId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<TileId> for String {
    fn from(value: TileId) -> Self {
        value.0
    }
}

impl fmt::Debug for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileId({})", self.0)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive date range covered by a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    #[serde(with = "iso_date")]
    start: Date,
    #[serde(with = "iso_date")]
    end: Date,
}

#[derive(Deserialize)]
struct RawDateRange {
    #[serde(with = "iso_date")]
    start: Date,
    #[serde(with = "iso_date")]
    end: Date,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = crate::Error;

    fn try_from(raw: RawDateRange) -> crate::Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl DateRange {
    /// Create a range, requiring `start <= end` and four-digit years.
    pub fn new(start: Date, end: Date) -> crate::Result<Self> {
        if start > end {
            return Err(crate::Error::InvalidDateRange(format!(
                "start {start} is after end {end}"
            )));
        }
        for date in [start, end] {
            if !(1..=9999).contains(&date.year()) {
                return Err(crate::Error::InvalidDateRange(format!(
                    "year out of range: {}",
                    date.year()
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Parse from two compact (`YYYYMMDD`) date strings.
    pub fn parse_compact(start: &str, end: &str) -> crate::Result<Self> {
        Self::new(parse_compact_date(start)?, parse_compact_date(end)?)
    }

    pub fn start(&self) -> Date {
        self.start
    }

    pub fn end(&self) -> Date {
        self.end
    }

    /// Whether two inclusive ranges share at least one day.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Start date as `YYYYMMDD`.
    pub fn start_compact(&self) -> String {
        compact_date(self.start)
    }

    /// End date as `YYYYMMDD`.
    pub fn end_compact(&self) -> String {
        compact_date(self.end)
    }

    /// Split into consecutive periods of `months` calendar months.
    ///
    /// Each period starts on the same day-of-month as the range (clamped to
    /// the month length) and ends the day before the next period starts. The
    /// final period is truncated to the range end.
    pub fn split_months(&self, months: u32) -> crate::Result<Vec<DateRange>> {
        if months == 0 {
            return Err(crate::Error::InvalidDateRange(
                "period length must be at least one month".to_string(),
            ));
        }
        let mut periods = Vec::new();
        let mut start = self.start;
        let mut step = 1;
        while start <= self.end {
            let next = add_months(self.start, months * step);
            let end = match next.and_then(|d| d.previous_day()) {
                Some(day) if day < self.end => day,
                _ => self.end,
            };
            periods.push(DateRange { start, end });
            match next {
                Some(next) => start = next,
                None => break,
            }
            step += 1;
        }
        Ok(periods)
    }
}

fn add_months(date: Date, months: u32) -> Option<Date> {
    let index = date.year() * 12 + i32::from(u8::from(date.month())) - 1 + months as i32;
    let year = index.div_euclid(12);
    if year > 9999 {
        return None;
    }
    let month = time::Month::try_from((index.rem_euclid(12) + 1) as u8).ok()?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).ok()
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

fn compact_date(date: Date) -> String {
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

fn parse_compact_date(s: &str) -> crate::Result<Date> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(crate::Error::InvalidDateRange(format!(
            "expected YYYYMMDD, got {s:?}"
        )));
    }
    let invalid = |e: &dyn fmt::Display| crate::Error::InvalidDateRange(format!("{s}: {e}"));
    let year: i32 = s[..4].parse().map_err(|e| invalid(&e))?;
    let month: u8 = s[4..6].parse().map_err(|e| invalid(&e))?;
    let day: u8 = s[6..].parse().map_err(|e| invalid(&e))?;
    let month = time::Month::try_from(month).map_err(|e| invalid(&e))?;
    Date::from_calendar_date(year, month, day).map_err(|e| invalid(&e))
}

/// Immutable specification of one requested job.
///
/// Only `sensor`, `tile` and `date_range` feed the tracking name; the remaining
/// fields travel with the job but do not distinguish submissions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorId>,
    pub tile: TileId,
    pub date_range: DateRange,
    /// Band selection; empty means all bands.
    #[serde(default)]
    pub bands: Vec<String>,
    /// Destination path template overriding the tracker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_template: Option<String>,
    /// Extra export options forwarded verbatim to the remote service (scale, crs, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub export_options: BTreeMap<String, serde_json::Value>,
}

impl JobParameters {
    /// Create parameters for a tile and date range.
    pub fn new(tile: TileId, date_range: DateRange) -> Self {
        Self {
            sensor: None,
            tile,
            date_range,
            bands: Vec::new(),
            destination_template: None,
            export_options: BTreeMap::new(),
        }
    }

    pub fn with_sensor(mut self, sensor: SensorId) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn with_bands<I, S>(mut self, bands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bands = bands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_destination_template(mut self, template: impl Into<String>) -> Self {
        self.destination_template = Some(template.into());
        self
    }

    pub fn with_export_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.export_options.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_sensor_id_validation() {
        assert!(SensorId::new("LC08").is_ok());
        assert!(SensorId::new("LANDSAT/LC08/C01/T1_SR").is_ok());
        assert!(SensorId::new("").is_err());
        assert!(SensorId::new("/LC08").is_err());
        assert!(SensorId::new("LC08/").is_err());
        assert!(SensorId::new("a//b").is_err());
        assert!(SensorId::new("LC.08").is_err());
        assert!(SensorId::new("LC 08").is_err());
    }

    #[test]
    fn test_sensor_id_encoding_is_reversible() {
        let sensor = SensorId::new("LANDSAT/LC08/C01/T1_SR").unwrap();
        assert_eq!(sensor.encoded(), "LANDSAT.LC08.C01.T1_SR");
        assert_eq!(SensorId::decode(&sensor.encoded()).unwrap(), sensor);
    }

    #[test]
    fn test_tile_id_rejects_separator() {
        assert!(TileId::new("T1").is_ok());
        assert!(TileId::new("h012v034").is_ok());
        assert!(TileId::new("T_1").is_err());
        assert!(TileId::new("").is_err());
        assert_eq!(TileId::from_grid(12, 3).as_str(), "h012v003");
    }

    #[test]
    fn test_date_range_ordering() {
        assert!(DateRange::new(date!(2020 - 01 - 31), date!(2020 - 01 - 01)).is_err());
        let single = DateRange::new(date!(2020 - 01 - 01), date!(2020 - 01 - 01)).unwrap();
        assert_eq!(single.start_compact(), "20200101");
        assert_eq!(single.end_compact(), "20200101");
    }

    #[test]
    fn test_date_range_overlap() {
        let jan = DateRange::new(date!(2020 - 01 - 01), date!(2020 - 01 - 31)).unwrap();
        let feb = DateRange::new(date!(2020 - 02 - 01), date!(2020 - 02 - 29)).unwrap();
        let edge = DateRange::new(date!(2020 - 01 - 31), date!(2020 - 02 - 01)).unwrap();
        assert!(!jan.overlaps(&feb));
        assert!(jan.overlaps(&edge));
        assert!(feb.overlaps(&edge));
        assert!(jan.overlaps(&jan));
    }

    #[test]
    fn test_split_months() {
        let year = DateRange::new(date!(2020 - 01 - 01), date!(2020 - 12 - 31)).unwrap();
        let quarters = year.split_months(3).unwrap();
        assert_eq!(quarters.len(), 4);
        assert_eq!(quarters[0].end(), date!(2020 - 03 - 31));
        assert_eq!(quarters[3].start(), date!(2020 - 10 - 01));
        assert_eq!(quarters[3].end(), date!(2020 - 12 - 31));

        let ragged = DateRange::new(date!(2020 - 01 - 31), date!(2020 - 04 - 15)).unwrap();
        let months = ragged.split_months(1).unwrap();
        assert_eq!(months[0].end(), date!(2020 - 02 - 28));
        assert_eq!(months[1].start(), date!(2020 - 02 - 29));
        assert_eq!(months[1].end(), date!(2020 - 03 - 30));
        assert_eq!(months.last().unwrap().end(), date!(2020 - 04 - 15));

        let short = DateRange::new(date!(2020 - 01 - 01), date!(2020 - 01 - 10)).unwrap();
        assert_eq!(short.split_months(6).unwrap(), vec![short]);
        assert!(short.split_months(0).is_err());
    }

    #[test]
    fn test_parse_compact() {
        let range = DateRange::parse_compact("20200101", "20200131").unwrap();
        assert_eq!(range.start(), date!(2020 - 01 - 01));
        assert_eq!(range.end(), date!(2020 - 01 - 31));
        assert!(DateRange::parse_compact("2020011", "20200131").is_err());
        assert!(DateRange::parse_compact("20201301", "20201331").is_err());
    }

    #[test]
    fn test_parameters_json_shape() {
        let params = JobParameters::new(
            TileId::new("T1").unwrap(),
            DateRange::new(date!(2020 - 01 - 01), date!(2020 - 01 - 31)).unwrap(),
        )
        .with_bands(["B4", "B5"]);

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["tile"], "T1");
        assert_eq!(json["dateRange"]["start"], "2020-01-01");
        assert_eq!(json["dateRange"]["end"], "2020-01-31");
        assert!(json.get("sensor").is_none());

        let decoded: JobParameters = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_parameters_reject_inverted_range_on_decode() {
        let json = r#"{"tile":"T1","dateRange":{"start":"2020-02-01","end":"2020-01-01"}}"#;
        assert!(serde_json::from_str::<JobParameters>(json).is_err());
    }
}
