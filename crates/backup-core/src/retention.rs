use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::errors::BackupError;
use crate::model::parse_archive_file_name;

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

/// Delete the oldest archives of `source_name` in `directory` until at most
/// `max_archives` remain. Age is the filesystem mtime, not the filename stamp.
///
/// Deletions are best effort: a file that cannot be removed is logged and
/// skipped. Returns the number of archives actually removed.
pub fn prune(directory: &Path, source_name: &str, max_archives: usize) -> Result<usize, BackupError> {
    prune_with(directory, source_name, max_archives, |path| fs::remove_file(path))
}

fn prune_with<R>(
    directory: &Path,
    source_name: &str,
    max_archives: usize,
    mut remove: R,
) -> Result<usize, BackupError>
where
    R: FnMut(&Path) -> io::Result<()>,
{
    let mut candidates = list_archives(directory, source_name)?;
    if candidates.len() <= max_archives {
        debug!(
            "retention: {} has {} archive(s), limit {}",
            source_name,
            candidates.len(),
            max_archives
        );
        return Ok(0);
    }

    // ties fall back to the name so the order is stable
    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let excess = candidates.len() - max_archives;
    let mut evicted = 0;
    for candidate in candidates.into_iter().take(excess) {
        match remove(&candidate.path) {
            Ok(()) => {
                info!("deleted old backup: {}", candidate.path.display());
                evicted += 1;
            }
            Err(err) => {
                warn!(
                    "failed to delete old backup {}: {}",
                    candidate.path.display(),
                    err
                );
            }
        }
    }

    Ok(evicted)
}

fn list_archives(directory: &Path, source_name: &str) -> Result<Vec<Candidate>, BackupError> {
    let entries =
        fs::read_dir(directory).map_err(|e| BackupError::io("listing archives", directory, e))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io("listing archives", directory, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if parse_archive_file_name(name, source_name).is_none() {
            continue;
        }

        // an archive may be evicted concurrently by another process; skip it
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        out.push(Candidate { path: entry.path(), modified });
    }
    Ok(out)
}
