use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::store::JobStore;

/// Keeps a claimed job's heartbeat fresh until told to stop.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTicker {
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatTicker {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Refresh the heartbeat of `job_id` every interval until `stop` fires or
    /// the row is reclaimed under a newer version.
    ///
    /// The claim itself already wrote a fresh heartbeat, so the first write
    /// happens one full interval later.
    pub async fn run(
        &self,
        store: Arc<dyn JobStore>,
        job_id: i64,
        version: i64,
        stop: CancellationToken,
    ) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let beat = store.update_heartbeat(job_id, version);
                    match tokio::time::timeout(self.timeout, beat).await {
                        Ok(Ok(())) => tracing::trace!(job_id, "Heartbeat refreshed"),
                        Ok(Err(SchedulerError::LeaseLost(_))) => {
                            tracing::warn!(job_id, version, "Job was reclaimed by another worker");
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::error!(job_id, error = %e, "Failed to refresh job heartbeat");
                        }
                        Err(_) => {
                            tracing::error!(job_id, timeout = ?self.timeout, "Job heartbeat timed out");
                        }
                    }
                }
            }
        }
        tracing::debug!(job_id, "Heartbeat stopped");
    }
}
