use fs2::FileExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::{fs, fs::File, fs::OpenOptions};

pub const LOCK_FILE_NAME: &str = ".atlas-backupd.lock";

/// Held for the daemon's lifetime; the lock is released when dropped.
pub struct LockGuard {
    _file: File,
}

pub fn acquire_lock(backup_dir: &Path) -> std::io::Result<LockGuard> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(backup_dir.join(LOCK_FILE_NAME))?;

    file.try_lock_exclusive()?;
    Ok(LockGuard { _file: file })
}

/// Lock every directory in `dirs`, all or nothing. Different spellings of the
/// same directory are locked once.
pub fn acquire_locks<'a>(dirs: impl IntoIterator<Item = &'a Path>) -> std::io::Result<Vec<LockGuard>> {
    let unique: BTreeSet<PathBuf> = dirs
        .into_iter()
        .map(|dir| fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
        .collect();
    // an early return drops the guards taken so far
    unique.iter().map(|dir| acquire_lock(dir)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("atlas-backupd-{prefix}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn second_lock_on_the_same_directory_fails() {
        let dir = unique_temp_dir("lock");
        let guard = acquire_lock(&dir).expect("first lock");
        assert!(acquire_lock(&dir).is_err());
        drop(guard);
        acquire_lock(&dir).expect("lock after release");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn locks_cover_every_directory_once() {
        let base = unique_temp_dir("locks");
        let global = base.join("backups");
        let nether = base.join("nether-backups");
        std::fs::create_dir_all(&global).expect("create global");
        std::fs::create_dir_all(&nether).expect("create nether");

        // the same directory twice, once through a `..` detour
        let detour = nether.join("..").join("nether-backups");
        let guards = acquire_locks([global.as_path(), nether.as_path(), detour.as_path()])
            .expect("lock all");
        assert_eq!(guards.len(), 2);

        // a second daemon with another global directory still collides on the shared one
        let other = base.join("other-backups");
        std::fs::create_dir_all(&other).expect("create other");
        let err = acquire_locks([other.as_path(), nether.as_path()])
            .err()
            .expect("shared directory is held");
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

        drop(guards);
        acquire_locks([other.as_path(), nether.as_path()]).expect("lock after release");
        let _ = std::fs::remove_dir_all(base);
    }
}
