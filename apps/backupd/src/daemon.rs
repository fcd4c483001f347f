use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use backup_core::{
    ArchiveWriter, BackupConfig, BackupScheduler, CheckpointHandle, NoopCheckpointer,
    NoopObserver, RegisteredSource, RunObserver, SnapshotCoordinator, Source,
};
use backup_rcon::{RconCheckpointer, RconClient, resolve_settings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autosave::spawn_autosave;
use crate::lock;
use crate::notify::BroadcastObserver;

/// Everything the daemon builds from a validated config.
struct Wiring {
    scheduler: BackupScheduler,
    sources: Vec<RegisteredSource>,
    rcon: Option<RconClient>,
}

async fn wire(config: &BackupConfig) -> Result<Wiring> {
    let rcon = match &config.server {
        Some(server) => {
            let settings = resolve_settings(server)
                .await
                .context("Failed to resolve RCON settings")?;
            Some(RconClient::from_settings(settings).with_io_timeout(config.checkpoint_timeout()))
        }
        None => None,
    };

    let owner = match (&rcon, &config.server) {
        (Some(client), Some(server)) => CheckpointHandle::spawn(
            client.address(),
            RconCheckpointer::new(client.clone(), server.hold_saves),
        ),
        _ => {
            warn!("no [server] configured, worlds will be archived without a save checkpoint");
            CheckpointHandle::spawn("unmanaged", NoopCheckpointer)
        }
    };

    let sources = config
        .sources
        .iter()
        .map(|s| {
            let registered = RegisteredSource::new(
                Source::new(s.name.clone(), s.path.clone()),
                owner.clone(),
                config.archive_dir_for(s),
            );
            match s.max_archives() {
                Some(max) => registered.with_max_archives(max),
                None => registered,
            }
        })
        .collect();

    let observer: Arc<dyn RunObserver> = match (&rcon, &config.server) {
        (Some(client), Some(server)) if server.broadcast => Arc::new(BroadcastObserver::new(
            client.clone(),
            config.messages.clone(),
        )),
        _ => Arc::new(NoopObserver),
    };

    let coordinator = SnapshotCoordinator::new(
        ArchiveWriter::new(config.compression_level()),
        config.checkpoint_timeout(),
    );
    let scheduler = BackupScheduler::new(coordinator).with_observer(observer);

    Ok(Wiring { scheduler, sources, rcon })
}

/// Lock every directory archives are written to or pruned from.
fn take_lock(config: &BackupConfig) -> Result<Option<Vec<lock::LockGuard>>> {
    config.ensure_directories()?;
    let dirs = config.archive_dirs();
    match lock::acquire_locks(dirs.iter().map(PathBuf::as_path)) {
        Ok(guards) => Ok(Some(guards)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to take the backup directory locks")),
    }
}

/// Run until Ctrl-C, then let an in-flight backup finish.
pub async fn run(config: BackupConfig) -> Result<()> {
    let Some(_guard) = take_lock(&config)? else {
        warn!("another backupd already owns one of the backup directories, exiting");
        return Ok(());
    };

    let Wiring { mut scheduler, sources, rcon } = wire(&config).await?;

    info!("backupd enabled");
    info!("backup interval set to {}s", config.backup_interval().as_secs());
    info!("max backups set to {}", config.max_archives());
    info!("backup directory set to {}", config.backup_directory.display());
    for source in &sources {
        info!(
            "source '{}' at {} -> {}",
            source.name(),
            source.source.root_path.display(),
            source.archive_dir.display()
        );
    }

    scheduler.start(config.backup_interval(), sources, config.max_archives())?;

    let cancel = CancellationToken::new();
    let autosave = match (config.autosave_interval(), rcon) {
        (Some(period), Some(client)) => {
            info!("autosave interval set to {}s", period.as_secs());
            let broadcast = config.server.as_ref().is_some_and(|s| s.broadcast);
            Some(spawn_autosave(
                client,
                period,
                broadcast.then(|| config.messages.clone()),
                scheduler.activity(),
                cancel.clone(),
            ))
        }
        (Some(_), None) => {
            warn!("autosave_interval_seconds is set but no [server] is configured, ignoring");
            None
        }
        _ => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");

    cancel.cancel();
    if let Some(handle) = autosave {
        let _ = handle.await;
    }
    scheduler.stop().await;
    if scheduler.activity().in_progress() {
        info!("waiting for the running backup to finish");
    }
    scheduler.wait_idle().await;
    info!("backupd disabled");
    Ok(())
}

/// Run a single tick now. Returns whether every source was backed up.
pub async fn once(config: BackupConfig) -> Result<bool> {
    let Some(_guard) = take_lock(&config)? else {
        anyhow::bail!("another backupd already owns one of the backup directories");
    };

    let Wiring { scheduler, sources, .. } = wire(&config).await?;
    let report = scheduler
        .run_once(sources, config.max_archives())
        .await
        .context("a backup is already running")?;

    for record in &report.run.archived {
        println!("{}  {} bytes", record.path.display(), record.size_bytes);
    }
    for failure in &report.run.failures {
        eprintln!("{}: {}", failure.source_name, failure.error);
    }
    if report.evicted > 0 {
        println!("evicted {} old archive(s)", report.evicted);
    }
    Ok(report.run.is_clean())
}

pub fn check(path: &Path, config: &BackupConfig) {
    println!("config {} is valid", path.display());
    println!("  backup interval: {}s", config.backup_interval().as_secs());
    println!("  max backups:     {}", config.max_archives());
    println!("  backup dir:      {}", config.backup_directory.display());
    println!("  compression:     xz level {}", config.compression_level());
    match config.autosave_interval() {
        Some(period) => println!("  autosave:        every {}s", period.as_secs()),
        None => println!("  autosave:        off"),
    }
    match &config.server {
        Some(server) => println!(
            "  server:          rcon (hold saves: {}, broadcast: {})",
            server.hold_saves, server.broadcast
        ),
        None => println!("  server:          none (no checkpoint)"),
    }
    for source in &config.sources {
        println!(
            "  source {:<16} {} -> {}",
            source.name,
            source.path.display(),
            config.archive_dir_for(source).display()
        );
    }
}
