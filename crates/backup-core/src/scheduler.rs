use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::BackupError;
use crate::model::BackupRunResult;
use crate::retention;
use crate::snapshot::{RegisteredSource, SnapshotCoordinator};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub run: BackupRunResult,
    pub evicted: usize,
}

/// Hooks around each tick, e.g. for in-game announcements.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn tick_started(&self) {}
    async fn tick_finished(&self, _report: &TickReport) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {}

/// Cloneable view of whether a tick is in flight.
#[derive(Clone)]
pub struct TickActivity(Arc<Mutex<()>>);

impl TickActivity {
    pub fn in_progress(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

struct TickContext {
    coordinator: Arc<SnapshotCoordinator>,
    observer: Arc<dyn RunObserver>,
    sources: Vec<RegisteredSource>,
    max_archives: usize,
}

enum State {
    Idle,
    Running {
        cancel: CancellationToken,
        driver: JoinHandle<()>,
    },
}

/// Process-wide periodic driver: backup every source, then prune.
///
/// At most one tick is ever in flight. A tick that comes due while the previous
/// one is still running is skipped, not queued.
pub struct BackupScheduler {
    coordinator: Arc<SnapshotCoordinator>,
    observer: Arc<dyn RunObserver>,
    tick_lock: Arc<Mutex<()>>,
    state: State,
}

impl BackupScheduler {
    pub fn new(coordinator: SnapshotCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            observer: Arc::new(NoopObserver),
            tick_lock: Arc::new(Mutex::new(())),
            state: State::Idle,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Start ticking every `interval`; the first tick fires one interval from now.
    pub fn start(
        &mut self,
        interval: Duration,
        sources: Vec<RegisteredSource>,
        max_archives: usize,
    ) -> Result<(), BackupError> {
        if self.is_running() {
            return Err(BackupError::AlreadyRunning);
        }
        if interval.is_zero() {
            return Err(BackupError::config("backup interval must be greater than zero"));
        }
        if max_archives == 0 {
            return Err(BackupError::config("max backups must be greater than zero"));
        }
        let Some(first_tick) = Instant::now().checked_add(interval) else {
            return Err(BackupError::config(format!(
                "backup interval of {}s is too large",
                interval.as_secs()
            )));
        };

        let ctx = Arc::new(TickContext {
            coordinator: Arc::clone(&self.coordinator),
            observer: Arc::clone(&self.observer),
            sources,
            max_archives,
        });
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            ctx,
            Arc::clone(&self.tick_lock),
            first_tick,
            interval,
            cancel.clone(),
        ));

        info!("backup scheduler started, interval {}s", interval.as_secs());
        self.state = State::Running { cancel, driver };
        Ok(())
    }

    /// Stop scheduling. Once this returns no new tick will begin; a tick that
    /// is already running is left to finish (see [`Self::wait_idle`]).
    pub async fn stop(&mut self) {
        let State::Running { cancel, driver } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return;
        };
        cancel.cancel();
        if let Err(err) = driver.await {
            warn!("backup scheduler driver ended abnormally: {}", err);
        }
        info!("backup scheduler stopped");
    }

    pub fn activity(&self) -> TickActivity {
        TickActivity(Arc::clone(&self.tick_lock))
    }

    /// Wait until no tick is in flight.
    pub async fn wait_idle(&self) {
        let _guard = self.tick_lock.lock().await;
    }

    /// Run one tick right now, unless one is already in flight.
    pub async fn run_once(
        &self,
        sources: Vec<RegisteredSource>,
        max_archives: usize,
    ) -> Option<TickReport> {
        let Ok(guard) = Arc::clone(&self.tick_lock).try_lock_owned() else {
            warn!("a backup is already in progress, not starting another");
            return None;
        };
        let ctx = TickContext {
            coordinator: Arc::clone(&self.coordinator),
            observer: Arc::clone(&self.observer),
            sources,
            max_archives,
        };
        Some(run_tick(&ctx, guard).await)
    }
}

async fn drive(
    ctx: Arc<TickContext>,
    tick_lock: Arc<Mutex<()>>,
    first_tick: Instant,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // the guard is taken here, before spawning, so stop() can never race a tick start
        let Ok(guard) = Arc::clone(&tick_lock).try_lock_owned() else {
            warn!("previous backup is still running, skipping this tick");
            continue;
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            run_tick(&ctx, guard).await;
        });
    }
    debug!("backup scheduler driver exiting");
}

async fn run_tick(ctx: &TickContext, _guard: OwnedMutexGuard<()>) -> TickReport {
    ctx.observer.tick_started().await;

    // archive first, then prune, so a prune never races this tick's archives
    let run = ctx.coordinator.backup_all(&ctx.sources).await;

    let mut evicted = 0;
    for entry in &ctx.sources {
        let dir = entry.archive_dir.clone();
        let name = entry.name().to_string();
        let max = entry.max_archives.unwrap_or(ctx.max_archives);
        let pruned = tokio::task::spawn_blocking(move || retention::prune(&dir, &name, max)).await;
        match pruned {
            Ok(Ok(count)) => evicted += count,
            Ok(Err(err)) => warn!("retention for '{}' failed: {}", entry.name(), err),
            Err(err) => warn!("retention task for '{}' failed: {}", entry.name(), err),
        }
    }

    let report = TickReport { run, evicted };
    ctx.observer.tick_finished(&report).await;
    report
}
