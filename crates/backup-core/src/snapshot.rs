use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use tracing::{info, warn};

use crate::archive::ArchiveWriter;
use crate::checkpoint::CheckpointHandle;
use crate::errors::BackupError;
use crate::model::{ArchiveRecord, ArchiveTarget, BackupRunResult, Source, SourceFailure};

/// A source wired to its owner and to the directory its archives live in.
#[derive(Debug, Clone)]
pub struct RegisteredSource {
    pub source: Source,
    pub owner: CheckpointHandle,
    pub archive_dir: PathBuf,
    /// Overrides the scheduler-wide retention limit for this source.
    pub max_archives: Option<usize>,
}

impl RegisteredSource {
    pub fn new(source: Source, owner: CheckpointHandle, archive_dir: impl Into<PathBuf>) -> Self {
        Self { source, owner, archive_dir: archive_dir.into(), max_archives: None }
    }

    pub fn with_max_archives(mut self, max_archives: usize) -> Self {
        self.max_archives = Some(max_archives);
        self
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }
}

/// Checkpoints and archives sources one after the other.
#[derive(Debug, Clone)]
pub struct SnapshotCoordinator {
    writer: ArchiveWriter,
    checkpoint_timeout: Duration,
}

impl SnapshotCoordinator {
    pub fn new(writer: ArchiveWriter, checkpoint_timeout: Duration) -> Self {
        Self { writer, checkpoint_timeout }
    }

    /// Back up every source in order. A failing source is recorded in the
    /// result and never stops the others.
    pub async fn backup_all(&self, sources: &[RegisteredSource]) -> BackupRunResult {
        info!("starting world backup of {} source(s)", sources.len());
        let mut result = BackupRunResult::default();

        for entry in sources {
            match self.backup_one(entry).await {
                Ok(record) => {
                    info!(
                        "backup for '{}' created: {} ({} bytes)",
                        record.source_name,
                        record.path.display(),
                        record.size_bytes
                    );
                    result.archived.push(record);
                }
                Err(error) => {
                    warn!("backup of '{}' failed: {}", entry.name(), error);
                    result.failures.push(SourceFailure {
                        source_name: entry.name().to_string(),
                        error,
                    });
                }
            }
        }

        if result.succeeded() > 0 {
            info!("backup complete, {} source(s) backed up", result.succeeded());
        } else {
            warn!("no sources were backed up, check the log for errors");
        }
        result
    }

    async fn backup_one(&self, entry: &RegisteredSource) -> Result<ArchiveRecord, BackupError> {
        let name = entry.name();

        info!("saving '{}'...", name);
        entry.owner.checkpoint(name, self.checkpoint_timeout).await?;
        info!("'{}' saved", name);

        let outcome = self.archive(entry).await;

        if let Err(err) = entry.owner.resume(name, self.checkpoint_timeout).await {
            warn!("resuming '{}' after backup failed: {}", name, err);
        }
        outcome
    }

    async fn archive(&self, entry: &RegisteredSource) -> Result<ArchiveRecord, BackupError> {
        let root = entry.source.root_path.clone();
        let is_dir = tokio::fs::metadata(&root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(BackupError::SourceMissing {
                source_name: entry.name().to_string(),
                path: root,
            });
        }

        let target = ArchiveTarget::new(&entry.archive_dir, entry.name(), Local::now());
        let writer = self.writer;
        tokio::task::spawn_blocking(move || writer.write_archive(&root, &target))
            .await
            .map_err(|e| BackupError::Internal(format!("archive task failed: {e}")))?
    }
}
