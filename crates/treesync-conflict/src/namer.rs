//! Conflict naming
//!
//! Generates names for conflict copies, following the pattern:
//! `filename (conflict_YYYY-MM-DD_HH-MM-SS).ext`

use chrono::{DateTime, TimeZone};
use treesync_core::domain::newtypes::RelPath;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Generates unique conflict file names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Generates a conflict copy path next to `path`
    ///
    /// Given "docs/report.docx", produces something like:
    /// "docs/report (conflict_2026-02-07_14-03-59).docx"
    pub fn generate<Tz>(path: &RelPath, timestamp: &DateTime<Tz>) -> RelPath
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        Self::with_suffix(path, &format!("conflict_{stamp}"))
    }

    /// Generates a conflict copy path that does not exist yet
    ///
    /// If the plain name already exists, appends an incrementing counter
    /// after the timestamp: `report (conflict_<ts>_2).docx`, `_3`, ...
    pub fn generate_unique<Tz, F>(path: &RelPath, timestamp: &DateTime<Tz>, mut exists: F) -> RelPath
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
        F: FnMut(&RelPath) -> bool,
    {
        let candidate = Self::generate(path, timestamp);
        if !exists(&candidate) {
            return candidate;
        }

        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        for i in 2..=99 {
            let numbered = Self::with_suffix(path, &format!("conflict_{stamp}_{i}"));
            if !exists(&numbered) {
                return numbered;
            }
        }

        // Last resort: random suffix
        let short_uuid = Uuid::new_v4().simple().to_string();
        Self::with_suffix(path, &format!("conflict_{stamp}_{}", &short_uuid[..8]))
    }

    fn with_suffix(path: &RelPath, suffix: &str) -> RelPath {
        let name = path.file_name().unwrap_or_default();
        let renamed = match name.rfind('.') {
            // A leading dot marks a hidden file, not an extension.
            Some(dot_pos) if dot_pos > 0 => {
                let (stem, ext) = name.split_at(dot_pos);
                format!("{stem} ({suffix}){ext}")
            }
            _ => format!("{name} ({suffix})"),
        };

        let parent = path.parent().unwrap_or_else(RelPath::root);
        // The renamed segment contains no separator, so joining cannot fail.
        parent.join(&renamed).unwrap_or(parent)
    }
}
