use async_trait::async_trait;
use backup_core::{MessagesConfig, RunObserver, TickReport};
use backup_rcon::{RconClient, broadcast};
use tracing::warn;

/// Announces backup ticks in game chat.
pub struct BroadcastObserver {
    client: RconClient,
    messages: MessagesConfig,
}

impl BroadcastObserver {
    pub fn new(client: RconClient, messages: MessagesConfig) -> Self {
        Self { client, messages }
    }

    async fn say(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if let Err(err) = broadcast(&self.client, line).await {
            warn!("chat broadcast failed: {err:#}");
        }
    }
}

#[async_trait]
impl RunObserver for BroadcastObserver {
    async fn tick_started(&self) {
        self.say(&self.messages.backup_start).await;
    }

    async fn tick_finished(&self, report: &TickReport) {
        let count = report.run.succeeded();
        let failed = report.run.failures.len();
        self.say(&render(&self.messages.backup_complete, count, failed)).await;
        if failed > 0 {
            self.say(&render(&self.messages.backup_failed, count, failed)).await;
        }
    }
}

pub fn render(template: &str, count: usize, failed: usize) -> String {
    template
        .replace("{count}", &count.to_string())
        .replace("{failed}", &failed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_filled() {
        let messages = MessagesConfig::default();
        assert_eq!(
            render(&messages.backup_complete, 3, 0),
            "&6[Backup] &aBackup complete, 3 world(s) saved."
        );
        assert_eq!(render("{failed}/{count}", 2, 1), "1/2");
        assert_eq!(render("no placeholders", 2, 1), "no placeholders");
    }
}
