use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, Timelike};

use crate::errors::{BackupError, FailureKind};

pub const ARCHIVE_EXTENSION: &str = "tar.xz";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// A named directory tree that its owner can checkpoint on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub root_path: PathBuf,
}

impl Source {
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), root_path: root_path.into() }
    }
}

/// Where an archive for `source_name` taken at `created_at` will be written.
#[derive(Debug, Clone)]
pub struct ArchiveTarget {
    pub source_name: String,
    pub created_at: DateTime<Local>,
    pub path: PathBuf,
}

impl ArchiveTarget {
    pub fn new(directory: &Path, source_name: &str, created_at: DateTime<Local>) -> Self {
        // second resolution, matching the filename
        let created_at = created_at.with_nanosecond(0).unwrap_or(created_at);
        Self {
            source_name: source_name.to_string(),
            path: directory.join(archive_file_name(source_name, &created_at)),
            created_at,
        }
    }
}

/// A completed archive on disk.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub source_name: String,
    pub created_at: DateTime<Local>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct SourceFailure {
    pub source_name: String,
    pub error: BackupError,
}

impl SourceFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

/// Outcome of one pass over every registered source.
#[derive(Debug, Default)]
pub struct BackupRunResult {
    pub archived: Vec<ArchiveRecord>,
    pub failures: Vec<SourceFailure>,
}

impl BackupRunResult {
    pub fn succeeded(&self) -> usize {
        self.archived.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_for(&self, source_name: &str) -> Option<&SourceFailure> {
        self.failures.iter().find(|f| f.source_name == source_name)
    }
}

/// `world` at 2024-05-01 13:04:05 -> `world-2024-05-01_13-04-05.tar.xz`
pub fn archive_file_name(source_name: &str, created_at: &DateTime<Local>) -> String {
    format!(
        "{source_name}-{}.{ARCHIVE_EXTENSION}",
        created_at.format(TIMESTAMP_FORMAT)
    )
}

/// Returns the timestamp embedded in `file_name` when it is an archive of
/// exactly `source_name`. Archives of other sources, including ones whose name
/// starts with `source_name`, yield `None`.
pub fn parse_archive_file_name(file_name: &str, source_name: &str) -> Option<NaiveDateTime> {
    let rest = file_name.strip_prefix(source_name)?.strip_prefix('-')?;
    let stamp = rest.strip_suffix(ARCHIVE_EXTENSION)?.strip_suffix('.')?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_deterministic_and_parses_back() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let name = archive_file_name("world", &at);
        assert_eq!(name, "world-2024-05-01_13-04-05.tar.xz");
        assert_eq!(parse_archive_file_name(&name, "world"), Some(at.naive_local()));
    }

    #[test]
    fn parsing_is_scoped_to_the_exact_source_name() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let nether = archive_file_name("world_nether", &at);
        let old = archive_file_name("world-old", &at);
        assert!(parse_archive_file_name(&nether, "world").is_none());
        assert!(parse_archive_file_name(&old, "world").is_none());
        assert!(parse_archive_file_name(&old, "world-old").is_some());
        assert!(parse_archive_file_name("world-notes.txt", "world").is_none());
    }

    #[test]
    fn target_truncates_to_whole_seconds() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap()
            + chrono::TimeDelta::milliseconds(750);
        let target = ArchiveTarget::new(Path::new("/backups"), "world", at);
        assert_eq!(target.created_at.nanosecond(), 0);
        assert_eq!(
            target.path,
            PathBuf::from("/backups/world-2024-05-01_12-00-01.tar.xz")
        );
    }
}
