//! Fixed-interval runner for in-process periodic jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::metrics::PeriodicMetrics;

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;

    /// Called once when the runner stops.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct PeriodicRunner {
    job: Arc<dyn PeriodicJob>,
    interval: Duration,
    metrics: PeriodicMetrics,
}

impl PeriodicRunner {
    pub fn new(job: Arc<dyn PeriodicJob>, interval: Duration, metrics: PeriodicMetrics) -> Self {
        Self {
            job,
            interval,
            metrics,
        }
    }

    /// Run the job every interval until `shutdown` fires, then close it.
    ///
    /// The first run happens immediately. A run that overruns the interval
    /// delays the next one instead of bunching ticks. Every completed run is
    /// recorded in the runner's metrics; a run cut short by shutdown is not.
    pub async fn run(&self, shutdown: CancellationToken) {
        let name = self.job.name();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(job = name, interval = ?self.interval, "Periodic job started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            tracing::debug!(job = name, "Periodic run starting");
            let result = tokio::select! {
                result = self.job.run() => result,
                _ = shutdown.cancelled() => break,
            };
            let elapsed = started.elapsed();
            self.metrics.record_run(name, result.is_ok(), elapsed);
            match result {
                Ok(()) => tracing::debug!(job = name, elapsed = ?elapsed, "Periodic run finished"),
                Err(e) => {
                    tracing::error!(job = name, elapsed = ?elapsed, error = %e, "Periodic run failed")
                }
            }
        }

        if let Err(e) = self.job.close().await {
            tracing::warn!(job = name, error = %e, "Failed to close periodic job");
        }
        tracing::info!(job = name, "Periodic job stopped");
    }
}
