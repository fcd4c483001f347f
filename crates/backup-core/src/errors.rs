use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("checkpoint failed for source {source_name}: {reason}")]
    Checkpoint { source_name: String, reason: String },

    #[error("checkpoint for source {source_name} timed out after {}s", timeout.as_secs_f32())]
    CheckpointTimeout { source_name: String, timeout: Duration },

    #[error("source {source_name} directory is missing: {}", path.display())]
    SourceMissing { source_name: String, path: PathBuf },

    #[error("archive I/O failed at {}: {source}", path.display())]
    ArchiveIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {context} ({}): {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used when reporting per-source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConfigInvalid,
    CheckpointFailure,
    SourceMissing,
    ArchiveIoFailure,
    Internal,
}

impl BackupError {
    pub fn archive_io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::ArchiveIo { path: path.as_ref().to_path_buf(), source }
    }

    pub fn io(context: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io { context, path: path.as_ref().to_path_buf(), source }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            BackupError::ConfigInvalid(_) => FailureKind::ConfigInvalid,
            BackupError::Checkpoint { .. } | BackupError::CheckpointTimeout { .. } => {
                FailureKind::CheckpointFailure
            }
            BackupError::SourceMissing { .. } => FailureKind::SourceMissing,
            BackupError::ArchiveIo { .. } | BackupError::Io { .. } => FailureKind::ArchiveIoFailure,
            BackupError::AlreadyRunning | BackupError::Internal(_) => FailureKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_checkpoint_errors_share_a_kind() {
        let timeout = BackupError::CheckpointTimeout {
            source_name: "world".into(),
            timeout: Duration::from_secs(5),
        };
        let failed = BackupError::Checkpoint {
            source_name: "world".into(),
            reason: "rcon refused".into(),
        };
        assert_eq!(timeout.kind(), FailureKind::CheckpointFailure);
        assert_eq!(failed.kind(), FailureKind::CheckpointFailure);
        assert!(timeout.to_string().contains("timed out"));
    }

    #[test]
    fn archive_errors_carry_the_offending_path() {
        let err = BackupError::archive_io(
            "/srv/backups/world.tar.xz",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), FailureKind::ArchiveIoFailure);
        assert!(err.to_string().contains("/srv/backups/world.tar.xz"));
    }
}
