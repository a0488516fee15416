//! Stale-lock sweeper.
//!
//! A claimed step whose worker died stays `in_progress` forever unless
//! someone notices. The sweeper periodically resets any step whose lock is
//! older than the TTL back to `waiting`, preserving the attempt counter.
//! The TTL should exceed the largest per-step timeout plus a safety margin
//! so an honest slow worker is never preempted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::StepStore;

/// Periodic stale-lock release, run outside the scheduler.
pub struct LockSweeper {
    steps: Arc<dyn StepStore>,
    ttl: Duration,
    interval: Duration,
}

impl LockSweeper {
    pub fn new(steps: Arc<dyn StepStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            steps,
            ttl,
            interval,
        }
    }

    /// Spawn the sweep loop; runs until the token is cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.steps.release_stale_locks(self.ttl).await {
                    Ok(0) => {}
                    Ok(released) => {
                        tracing::warn!(released, "released stale step locks");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "stale lock sweep failed");
                    }
                }
            }
            tracing::debug!("lock sweeper stopped");
        })
    }
}
