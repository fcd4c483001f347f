use anyhow::{Context, Result};
use async_trait::async_trait;
use backup_core::Checkpointer;
use tracing::{debug, warn};

use crate::RconClient;

/// Checkpoints worlds of a running server over RCON.
///
/// With `hold_saves`, autosave is switched off (`save-off`) before the flush
/// and back on (`save-on`) in [`Checkpointer::resume`], so the server does not
/// rewrite region files while they are being archived.
pub struct RconCheckpointer {
    client: RconClient,
    hold_saves: bool,
}

impl RconCheckpointer {
    pub fn new(client: RconClient, hold_saves: bool) -> Self {
        Self { client, hold_saves }
    }
}

#[async_trait]
impl Checkpointer for RconCheckpointer {
    async fn checkpoint(&self, source: &str) -> Result<()> {
        if self.hold_saves {
            self.client
                .execute("save-off")
                .await
                .context("rcon save-off failed")?;
        }
        let reply = match self.client.execute("save-all flush").await {
            Ok(reply) => reply,
            Err(err) => {
                if self.hold_saves {
                    if let Err(on_err) = self.client.execute("save-on").await {
                        warn!("rcon save-on after failed flush failed: {on_err}");
                    }
                }
                return Err(err.context("rcon save-all failed"));
            }
        };
        debug!("save-all for {source}: {}", reply.trim());
        Ok(())
    }

    async fn resume(&self, _source: &str) -> Result<()> {
        if self.hold_saves {
            self.client
                .execute("save-on")
                .await
                .context("rcon save-on failed")?;
        }
        Ok(())
    }
}
