//! Background eviction of idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::orchestrator::QueryOrchestrator;

pub struct IdleReaper {
    orchestrator: Arc<QueryOrchestrator>,
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(orchestrator: Arc<QueryOrchestrator>, idle_timeout: Duration, interval: Duration) -> Self {
        Self {
            orchestrator,
            idle_timeout,
            interval,
        }
    }

    /// One sweep at the current instant. Returns the number evicted.
    pub async fn sweep_once(&self) -> usize {
        let evicted = self
            .orchestrator
            .evict_idle(Instant::now(), self.idle_timeout)
            .await;
        if evicted > 0 {
            info!(evicted, remaining = self.orchestrator.registry().len(), "idle sweep");
        }
        evicted
    }

    /// Sweep every `interval` until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;

            debug!(
                interval_secs = self.interval.as_secs(),
                idle_timeout_secs = self.idle_timeout.as_secs(),
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.sweep_once().await;
                    }
                }
            }
            debug!("idle reaper stopped");
        })
    }
}
