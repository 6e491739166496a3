//! Staged outputs that span several objects.
//!
//! A large export is written as tiled pieces (`NAME-0000000000-0000000000.tif`)
//! and may carry a `NAME.json` sidecar next to them. All of them share the
//! staging directory and the file stem of the requested output path.

use ardtrack_storage::join_path;

const PIECE_EXTENSIONS: [&str; 2] = [".tif", ".json"];

/// The set of staging entries produced for one output location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StagedOutput {
    dir: String,
    stem: String,
}

impl StagedOutput {
    pub(crate) fn new(location: &str) -> Self {
        let (dir, file) = location.rsplit_once('/').unwrap_or(("", location));
        let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
        Self {
            dir: dir.to_string(),
            stem: stem.to_string(),
        }
    }

    /// Directory to list for pieces.
    pub(crate) fn dir(&self) -> &str {
        &self.dir
    }

    /// Whether a listing entry belongs to this output.
    pub(crate) fn matches(&self, entry: &str) -> bool {
        if entry.ends_with('/') {
            return false;
        }
        let Some(suffix) = entry.strip_prefix(self.stem.as_str()) else {
            return false;
        };
        (suffix.starts_with('.') || suffix.starts_with('-'))
            && PIECE_EXTENSIONS.iter().any(|ext| suffix.ends_with(ext))
    }

    /// Staging path of a listing entry.
    pub(crate) fn path(&self, entry: &str) -> String {
        join_path(&self.dir, entry)
    }

    /// Destination of a piece, derived from the destination of the whole
    /// output: the primary `.tif` lands on `primary`, every other piece keeps
    /// its suffix next to it.
    pub(crate) fn destination_for(&self, entry: &str, primary: &str) -> String {
        let suffix = entry.strip_prefix(self.stem.as_str()).unwrap_or(entry);
        if suffix == ".tif" {
            return primary.to_string();
        }
        let (dir, file) = match primary.rsplit_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, primary),
        };
        let base = file.rsplit_once('.').map_or(file, |(base, _)| base);
        let name = format!("{base}{suffix}");
        match dir {
            Some(dir) => join_path(dir, &name),
            None => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATION: &str = "ARD_PREARD/T1_20200101_20200131.tif";

    #[test]
    fn test_matches_pieces_and_sidecar() {
        let output = StagedOutput::new(LOCATION);
        assert_eq!(output.dir(), "ARD_PREARD");

        assert!(output.matches("T1_20200101_20200131.tif"));
        assert!(output.matches("T1_20200101_20200131.json"));
        assert!(output.matches("T1_20200101_20200131-0000000000-0000032768.tif"));

        assert!(!output.matches("T1_20200101_20200229.tif"));
        assert!(!output.matches("T1_20200101_20200131_extra.tif"));
        assert!(!output.matches("T1_20200101_20200131.txt"));
        assert!(!output.matches("T1_20200101_20200131-dir/"));
    }

    #[test]
    fn test_destination_for_pieces() {
        let output = StagedOutput::new(LOCATION);
        let primary = "T1/T1_20200101_20200131.tif";

        assert_eq!(output.destination_for("T1_20200101_20200131.tif", primary), primary);
        assert_eq!(
            output.destination_for("T1_20200101_20200131.json", primary),
            "T1/T1_20200101_20200131.json"
        );
        assert_eq!(
            output.destination_for("T1_20200101_20200131-0000000000-0000032768.tif", primary),
            "T1/T1_20200101_20200131-0000000000-0000032768.tif"
        );
        assert_eq!(
            output.path("T1_20200101_20200131.json"),
            "ARD_PREARD/T1_20200101_20200131.json"
        );
    }

    #[test]
    fn test_location_without_directory() {
        let output = StagedOutput::new("scene.tif");
        assert_eq!(output.dir(), "");
        assert!(output.matches("scene-0-0.tif"));
        assert_eq!(output.path("scene.json"), "scene.json");
        assert_eq!(output.destination_for("scene.json", "out.tif"), "out.json");
    }
}
