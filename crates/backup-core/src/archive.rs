use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use tar::{EntryType, Header, HeaderMode};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};
use xz2::write::XzEncoder;

use crate::errors::BackupError;
use crate::model::{ArchiveRecord, ArchiveTarget};

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Streams a directory tree into a `tar.xz` file in a single pass.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveWriter {
    level: u32,
}

impl Default for ArchiveWriter {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl ArchiveWriter {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Archive `source_root` into `target.path`.
    ///
    /// Directories are stored as payload-less entries ending in `/`, regular
    /// files with their relative path, size, mode and mtime. Symlinks and other
    /// special files are skipped, as are files that vanish mid-walk. The
    /// destination must not exist yet; if anything fails after it has been
    /// created, it is removed again before the error is returned.
    pub fn write_archive(
        &self,
        source_root: &Path,
        target: &ArchiveTarget,
    ) -> Result<ArchiveRecord, BackupError> {
        self.write_archive_with(source_root, target, |file| file)
    }

    fn write_archive_with<W, F>(
        &self,
        source_root: &Path,
        target: &ArchiveTarget,
        wrap: F,
    ) -> Result<ArchiveRecord, BackupError>
    where
        W: Write,
        F: FnOnce(File) -> W,
    {
        let meta = fs::metadata(source_root).map_err(|e| BackupError::archive_io(source_root, e))?;
        if !meta.is_dir() {
            return Err(BackupError::archive_io(
                source_root,
                io::Error::new(io::ErrorKind::InvalidInput, "source root is not a directory"),
            ));
        }

        // create_new: an existing file at the destination is an error, never overwritten
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target.path)
            .map_err(|e| BackupError::archive_io(&target.path, e))?;

        if let Err(err) = self.stream_tree(source_root, &target.path, wrap(file)) {
            if let Err(rm_err) = fs::remove_file(&target.path) {
                warn!(
                    "failed to remove partial archive {}: {}",
                    target.path.display(),
                    rm_err
                );
            }
            return Err(err);
        }

        let size_bytes = fs::metadata(&target.path)
            .map_err(|e| BackupError::archive_io(&target.path, e))?
            .len();

        Ok(ArchiveRecord {
            source_name: target.source_name.clone(),
            created_at: target.created_at,
            path: target.path.clone(),
            size_bytes,
        })
    }

    fn stream_tree<W: Write>(&self, root: &Path, dest: &Path, sink: W) -> Result<(), BackupError> {
        let mut builder = tar::Builder::new(XzEncoder::new(sink, self.level));

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    if walk_not_found(&err) {
                        warn!("skipping {}: vanished during walk", path.display());
                        continue;
                    }
                    return Err(BackupError::archive_io(&path, err.into()));
                }
            };

            let Ok(rel) = entry.path().strip_prefix(root) else {
                return Err(BackupError::Internal(format!(
                    "walked outside of {}: {}",
                    root.display(),
                    entry.path().display()
                )));
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                append_dir(&mut builder, &entry, rel)?;
            } else if file_type.is_file() {
                append_file(&mut builder, &entry, rel)?;
            } else {
                debug!("skipping non-regular entry {}", entry.path().display());
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| BackupError::archive_io(dest, e))?;
        let mut sink = encoder
            .finish()
            .map_err(|e| BackupError::archive_io(dest, e))?;
        sink.flush().map_err(|e| BackupError::archive_io(dest, e))?;
        Ok(())
    }
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &DirEntry,
    rel: &Path,
) -> Result<(), BackupError> {
    let meta = match entry.metadata() {
        Ok(meta) => meta,
        Err(err) if walk_not_found(&err) => {
            warn!("skipping {}: vanished during walk", entry.path().display());
            return Ok(());
        }
        Err(err) => return Err(BackupError::archive_io(entry.path(), err.into())),
    };

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&meta, HeaderMode::Complete);
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);

    let mut name = rel.as_os_str().to_os_string();
    name.push("/");

    builder
        .append_data(&mut header, Path::new(&name), io::empty())
        .map_err(|e| BackupError::archive_io(entry.path(), e))
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &DirEntry,
    rel: &Path,
) -> Result<(), BackupError> {
    let path = entry.path();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!("skipping {}: vanished before it could be read", path.display());
            return Ok(());
        }
        Err(err) => return Err(BackupError::archive_io(path, err)),
    };

    // stat the open handle so the header matches what we are about to read
    let meta = file.metadata().map_err(|e| BackupError::archive_io(path, e))?;
    let len = meta.len();

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&meta, HeaderMode::Complete);
    header.set_size(len);

    // exactly `len` bytes: truncated if the file grew, zero-padded if it shrank
    let data = file.take(len).chain(io::repeat(0)).take(len);

    builder
        .append_data(&mut header, rel, data)
        .map_err(|e| BackupError::archive_io(path, e))
}

fn walk_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
