//! Periodic world snapshots packed into `tar.xz` archives, with a bounded
//! retention window per source.
//!
//! Data flow for one tick: [`BackupScheduler`] -> [`SnapshotCoordinator`]
//! (checkpoint, then archive, per source) -> [`retention::prune`].

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod model;
pub mod retention;
pub mod scheduler;
pub mod snapshot;

pub use archive::ArchiveWriter;
pub use checkpoint::{CheckpointHandle, Checkpointer, NoopCheckpointer};
pub use config::{BackupConfig, MessagesConfig, ServerConfig, SourceConfig};
pub use errors::{BackupError, FailureKind};
pub use model::{ArchiveRecord, ArchiveTarget, BackupRunResult, Source, SourceFailure};
pub use scheduler::{BackupScheduler, NoopObserver, RunObserver, TickActivity, TickReport};
pub use snapshot::{RegisteredSource, SnapshotCoordinator};
