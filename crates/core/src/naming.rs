//! Deterministic tracking names and destination path templates.
//!
//! A tracking name is the canonical encoding `[sensor_]tile_YYYYMMDD_YYYYMMDD`
//! of the parameters that identify a job. Two processes deriving the name for the
//! same request always agree byte-for-byte, which is what makes submission
//! idempotent.

use crate::job::{DateRange, JobParameters, SensorId, TileId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key-safe unique name of a tracked job.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrackingName(String);

impl TrackingName {
    /// Validate an existing name (e.g. read back from a store listing).
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidName("name cannot be empty".to_string()));
        }
        if name.starts_with('.') {
            return Err(crate::Error::InvalidName(format!(
                "name cannot start with '.': {name}"
            )));
        }
        for c in name.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.') {
                return Err(crate::Error::InvalidName(format!(
                    "invalid character in name: {c}"
                )));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TrackingName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<TrackingName> for String {
    fn from(value: TrackingName) -> Self {
        value.0
    }
}

impl fmt::Debug for TrackingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingName({})", self.0)
    }
}

impl fmt::Display for TrackingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifying components recovered from a tracking name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameParts {
    pub sensor: Option<SensorId>,
    pub tile: TileId,
    pub date_range: DateRange,
}

/// Derives tracking names and destination paths from job parameters.
#[derive(Clone, Debug)]
pub struct NamingScheme {
    default_template: PathTemplate,
}

impl NamingScheme {
    /// Create a scheme with the template used when parameters carry none.
    pub fn new(default_template: &str) -> crate::Result<Self> {
        Ok(Self {
            default_template: PathTemplate::parse(default_template)?,
        })
    }

    /// Canonical tracking name for a parameter set.
    pub fn name(&self, params: &JobParameters) -> TrackingName {
        let mut name = String::new();
        if let Some(sensor) = &params.sensor {
            name.push_str(&sensor.encoded());
            name.push('_');
        }
        name.push_str(params.tile.as_str());
        name.push('_');
        name.push_str(&params.date_range.start_compact());
        name.push('_');
        name.push_str(&params.date_range.end_compact());
        // Every component is validated, so the result is always key-safe.
        TrackingName(name)
    }

    /// Decode a tracking name back into its components.
    ///
    /// Dates are fixed width and tile ids carry no `_`, so the name is
    /// split from the right.
    pub fn parse_name(name: &str) -> crate::Result<NameParts> {
        let invalid = || crate::Error::InvalidName(name.to_string());

        let (rest, end) = name.rsplit_once('_').ok_or_else(invalid)?;
        let (rest, start) = rest.rsplit_once('_').ok_or_else(invalid)?;
        let date_range = DateRange::parse_compact(start, end)?;

        let (sensor, tile) = match rest.rsplit_once('_') {
            Some((sensor, tile)) => (Some(SensorId::decode(sensor)?), tile),
            None => (None, rest),
        };

        Ok(NameParts {
            sensor,
            tile: TileId::new(tile)?,
            date_range,
        })
    }

    /// Check that the parameters can be rendered into a destination path.
    pub fn validate(&self, params: &JobParameters) -> crate::Result<()> {
        self.destination_path(params).map(|_| ())
    }

    /// Render the destination path for a job's downloaded artifact.
    pub fn destination_path(&self, params: &JobParameters) -> crate::Result<String> {
        let name = self.name(params);
        match &params.destination_template {
            Some(template) => PathTemplate::parse(template)?.render(params, &name),
            None => self.default_template.render(params, &name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placeholder {
    Name,
    Sensor,
    Tile,
    Start,
    End,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A parsed destination template such as `{tile}/{name}.tif`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template, rejecting unknown placeholders and unbalanced braces.
    pub fn parse(template: &str) -> crate::Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(crate::Error::InvalidTemplate(format!(
                                    "unbalanced '{{' in {template:?}"
                                )));
                            }
                            Some(c) => key.push(c),
                        }
                    }
                    let placeholder = match key.as_str() {
                        "name" => Placeholder::Name,
                        "sensor" => Placeholder::Sensor,
                        "tile" => Placeholder::Tile,
                        "start" => Placeholder::Start,
                        "end" => Placeholder::End,
                        other => {
                            return Err(crate::Error::InvalidTemplate(format!(
                                "unknown placeholder {{{other}}}"
                            )));
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(placeholder));
                }
                '}' => {
                    return Err(crate::Error::InvalidTemplate(format!(
                        "unbalanced '}}' in {template:?}"
                    )));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err(crate::Error::InvalidTemplate(
                "template cannot be empty".to_string(),
            ));
        }
        Ok(Self { segments })
    }

    /// Render for a parameter set. The result is a relative path without `..`.
    pub fn render(&self, params: &JobParameters, name: &TrackingName) -> crate::Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Placeholder(Placeholder::Name) => out.push_str(name.as_str()),
                Segment::Placeholder(Placeholder::Tile) => out.push_str(params.tile.as_str()),
                Segment::Placeholder(Placeholder::Start) => {
                    out.push_str(&params.date_range.start_compact())
                }
                Segment::Placeholder(Placeholder::End) => {
                    out.push_str(&params.date_range.end_compact())
                }
                Segment::Placeholder(Placeholder::Sensor) => match &params.sensor {
                    Some(sensor) => out.push_str(&sensor.encoded()),
                    None => {
                        return Err(crate::Error::InvalidTemplate(
                            "{sensor} used for a job without a sensor".to_string(),
                        ));
                    }
                },
            }
        }
        validate_relative_path(&out)?;
        Ok(out)
    }
}

fn validate_relative_path(path: &str) -> crate::Result<()> {
    if path.starts_with('/') || path.contains('\\') {
        return Err(crate::Error::InvalidTemplate(format!(
            "destination must be a relative path: {path}"
        )));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(crate::Error::InvalidTemplate(format!(
                "invalid path component in destination: {path}"
            )));
        }
    }
    Ok(())
}
