//! Source owners and the request/response channel used to reach them.
//!
//! An owner (a running game server, usually) is the only party allowed to
//! touch its world's in-memory state, so checkpoint requests are handed to a
//! task dedicated to that owner and the caller waits on a oneshot reply with
//! a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::errors::BackupError;

/// Implemented by whatever owns a source's live state.
#[async_trait]
pub trait Checkpointer: Send + Sync + 'static {
    /// Bring `source` to a consistent on-disk state.
    async fn checkpoint(&self, source: &str) -> anyhow::Result<()>;

    /// Called once archival of `source` is over, whatever its outcome.
    async fn resume(&self, _source: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Owner for trees nothing else writes to; every checkpoint succeeds at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointer;

#[async_trait]
impl Checkpointer for NoopCheckpointer {
    async fn checkpoint(&self, _source: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

enum OwnerRequest {
    Checkpoint {
        source: String,
        limit: Duration,
        deadline: Option<Instant>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Resume {
        source: String,
        deadline: Option<Instant>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Cloneable handle to an owner task.
#[derive(Clone)]
pub struct CheckpointHandle {
    owner: Arc<str>,
    tx: mpsc::Sender<OwnerRequest>,
}

impl std::fmt::Debug for CheckpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointHandle")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl CheckpointHandle {
    /// Spawn the owner task on the current tokio runtime. It runs until every
    /// handle has been dropped.
    ///
    /// The owner works through requests one at a time, but every request is
    /// bounded by its caller's deadline: a checkpoint that overruns is
    /// abandoned so requests queued behind it still get their turn, and one
    /// whose caller has already given up is never started.
    pub fn spawn<C: Checkpointer>(owner: impl Into<String>, checkpointer: C) -> Self {
        let owner: Arc<str> = Arc::from(owner.into());
        let (tx, mut rx) = mpsc::channel::<OwnerRequest>(8);

        let task_owner = Arc::clone(&owner);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    OwnerRequest::Checkpoint { source, limit, deadline, reply } => {
                        if reply.is_closed() {
                            debug!("owner {task_owner}: dropping stale checkpoint of {source}");
                            continue;
                        }
                        match before(deadline, checkpointer.checkpoint(&source)).await {
                            Some(result) => {
                                let succeeded = result.is_ok();
                                if reply.send(result).is_err() && succeeded {
                                    warn!("owner {task_owner}: checkpoint of {source} finished after the caller gave up, resuming");
                                    release(&checkpointer, &task_owner, &source, limit).await;
                                }
                            }
                            None => {
                                warn!("owner {task_owner}: checkpoint of {source} overran its deadline, resuming");
                                release(&checkpointer, &task_owner, &source, limit).await;
                            }
                        }
                    }
                    OwnerRequest::Resume { source, deadline, reply } => {
                        let result = before(deadline, checkpointer.resume(&source))
                            .await
                            .unwrap_or_else(|| Err(anyhow::anyhow!("resume of {source} overran its deadline")));
                        let _ = reply.send(result);
                    }
                }
            }
            debug!("owner {task_owner}: all handles dropped, stopping");
        });

        Self { owner, tx }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Ask the owner to checkpoint `source` and wait at most `limit` for it.
    pub async fn checkpoint(&self, source: &str, limit: Duration) -> Result<(), BackupError> {
        self.request(source, limit, |source, deadline, reply| OwnerRequest::Checkpoint {
            source,
            limit,
            deadline,
            reply,
        })
        .await
    }

    /// Tell the owner archival of `source` is done.
    pub async fn resume(&self, source: &str, limit: Duration) -> Result<(), BackupError> {
        self.request(source, limit, |source, deadline, reply| OwnerRequest::Resume {
            source,
            deadline,
            reply,
        })
        .await
    }

    async fn request<F>(&self, source: &str, limit: Duration, make: F) -> Result<(), BackupError>
    where
        F: FnOnce(String, Option<Instant>, oneshot::Sender<anyhow::Result<()>>) -> OwnerRequest,
    {
        // None when the limit is too large to represent, i.e. wait forever
        let deadline = Instant::now().checked_add(limit);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = make(source.to_string(), deadline, reply_tx);

        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| format!("owner {} is not running", self.owner))?;
            reply_rx
                .await
                .map_err(|_| format!("owner {} dropped the request", self.owner))
        };

        match before(deadline, exchange).await {
            None => Err(BackupError::CheckpointTimeout {
                source_name: source.to_string(),
                timeout: limit,
            }),
            Some(Err(reason)) => Err(BackupError::Checkpoint {
                source_name: source.to_string(),
                reason,
            }),
            Some(Ok(Err(err))) => Err(BackupError::Checkpoint {
                source_name: source.to_string(),
                reason: format!("{err:#}"),
            }),
            Some(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// Runs `fut` to completion unless `deadline` passes first.
async fn before<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Resume a source whose checkpoint nobody is waiting for any more, so the
/// owner is not left holding it.
async fn release<C: Checkpointer>(checkpointer: &C, owner: &str, source: &str, limit: Duration) {
    match before(Instant::now().checked_add(limit), checkpointer.resume(source)).await {
        Some(Ok(())) => debug!("owner {owner}: released {source}"),
        Some(Err(err)) => warn!("owner {owner}: releasing {source} failed: {err:#}"),
        None => warn!("owner {owner}: releasing {source} timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use std::sync::Mutex;

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Checkpointer for Recording {
        async fn checkpoint(&self, source: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("checkpoint:{source}"));
            if source == "broken" {
                anyhow::bail!("save-all failed");
            }
            Ok(())
        }

        async fn resume(&self, source: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("resume:{source}"));
            Ok(())
        }
    }

    struct Silent;

    #[async_trait]
    impl Checkpointer for Silent {
        async fn checkpoint(&self, _source: &str) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Takes `delay` to checkpoint `slow`, answers everything else at once.
    struct Sluggish {
        slow: &'static str,
        delay: Duration,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Checkpointer for Sluggish {
        async fn checkpoint(&self, source: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("checkpoint:{source}"));
            if source == self.slow {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }

        async fn resume(&self, source: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("resume:{source}"));
            Ok(())
        }
    }

    fn sluggish(slow: &'static str, delay_ms: u64) -> (Sluggish, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let owner = Sluggish { slow, delay: Duration::from_millis(delay_ms), seen: Arc::clone(&seen) };
        (owner, seen)
    }

    #[tokio::test]
    async fn requests_run_on_the_owner_task_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = CheckpointHandle::spawn("server", Recording { seen: Arc::clone(&seen) });

        handle
            .checkpoint("world", Duration::from_secs(5))
            .await
            .expect("checkpoint world");
        handle
            .resume("world", Duration::from_secs(5))
            .await
            .expect("resume world");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["checkpoint:world".to_string(), "resume:world".to_string()]
        );
    }

    #[tokio::test]
    async fn owner_errors_become_checkpoint_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = CheckpointHandle::spawn("server", Recording { seen });

        let err = handle
            .checkpoint("broken", Duration::from_secs(5))
            .await
            .expect_err("owner error");
        assert_eq!(err.kind(), FailureKind::CheckpointFailure);
        assert!(err.to_string().contains("save-all failed"));
    }

    #[tokio::test]
    async fn unresponsive_owner_times_out() {
        let handle = CheckpointHandle::spawn("server", Silent);

        let err = handle
            .checkpoint("world", Duration::from_millis(50))
            .await
            .expect_err("owner never answers");
        assert!(matches!(err, BackupError::CheckpointTimeout { .. }));
        assert_eq!(err.kind(), FailureKind::CheckpointFailure);
    }

    #[tokio::test]
    async fn noop_owner_always_succeeds() {
        let handle = CheckpointHandle::spawn("offline", NoopCheckpointer);
        handle
            .checkpoint("world", Duration::from_secs(1))
            .await
            .expect("noop checkpoint");
        handle
            .resume("world", Duration::from_secs(1))
            .await
            .expect("noop resume");
    }

    #[tokio::test]
    async fn overrunning_checkpoint_is_abandoned_and_released() {
        let (owner, seen) = sluggish("world", 300);
        let handle = CheckpointHandle::spawn("server", owner);

        let err = handle
            .checkpoint("world", Duration::from_millis(100))
            .await
            .expect_err("checkpoint overruns");
        assert!(matches!(err, BackupError::CheckpointTimeout { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["checkpoint:world".to_string(), "resume:world".to_string()]
        );
    }

    #[tokio::test]
    async fn late_checkpoint_with_no_caller_is_released() {
        let (owner, seen) = sluggish("world", 300);
        let handle = CheckpointHandle::spawn("server", owner);

        // the caller goes away long before its own limit
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), handle.checkpoint("world", Duration::from_secs(5)))
                .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["checkpoint:world".to_string(), "resume:world".to_string()]
        );
    }

    #[tokio::test]
    async fn hung_source_does_not_starve_the_next_one() {
        let (owner, seen) = sluggish("world", 600);
        let handle = CheckpointHandle::spawn("server", owner);
        let limit = Duration::from_millis(200);

        let err = handle.checkpoint("world", limit).await.expect_err("world hangs");
        assert_eq!(err.kind(), FailureKind::CheckpointFailure);
        handle
            .checkpoint("world_nether", limit)
            .await
            .expect("nether answers at once");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "checkpoint:world".to_string(),
                "resume:world".to_string(),
                "checkpoint:world_nether".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn queued_request_whose_caller_left_is_never_run() {
        let (owner, seen) = sluggish("world", 300);
        let handle = CheckpointHandle::spawn("server", owner);

        let busy = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.checkpoint("world", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            handle.checkpoint("world_nether", Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());

        busy.await.expect("join").expect("world checkpoint");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["checkpoint:world".to_string()]);
    }

    #[tokio::test]
    async fn unrepresentable_limit_waits_without_a_deadline() {
        let handle = CheckpointHandle::spawn("offline", NoopCheckpointer);
        handle
            .checkpoint("world", Duration::MAX)
            .await
            .expect("checkpoint with no deadline");
    }
}
