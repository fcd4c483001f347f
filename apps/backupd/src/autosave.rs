use std::time::Duration;

use backup_core::{MessagesConfig, TickActivity};
use backup_rcon::{RconClient, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically run `save-all` so worlds on disk never lag far behind the
/// server, independently of backups.
pub fn spawn_autosave(
    client: RconClient,
    period: Duration,
    messages: Option<MessagesConfig>,
    backups: TickActivity,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(first) = Instant::now().checked_add(period) else {
            warn!("autosave interval of {}s is too large, autosave disabled", period.as_secs());
            return;
        };
        let mut ticker = interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // a save while a world is being archived would defeat save-off
            if backups.in_progress() {
                debug!("backup in progress, skipping autosave");
                continue;
            }

            info!("starting server autosave...");
            announce(&client, messages.as_ref().map(|m| m.autosave_start.as_str())).await;
            match client.execute("save-all").await {
                Ok(_) => {
                    info!("server autosave complete");
                    announce(&client, messages.as_ref().map(|m| m.autosave_complete.as_str()))
                        .await;
                }
                Err(err) => warn!("autosave failed: {err:#}"),
            }
        }
        debug!("autosave loop stopped");
    })
}

async fn announce(client: &RconClient, line: Option<&str>) {
    let Some(line) = line.filter(|l| !l.trim().is_empty()) else {
        return;
    };
    if let Err(err) = broadcast(client, line).await {
        warn!("chat broadcast failed: {err:#}");
    }
}
