//! Prometheus metrics for periodic jobs.
//!
//! Metrics are registered on a caller-supplied [`Registry`] so that several
//! nodes in one process (and tests) never share series.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};

use crate::error::{Result, SchedulerError};

/// Metric name prefix for all lease-cron metrics
const PREFIX: &str = "lease_cron";

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

/// Per-run latency of periodic jobs, labelled by job name and outcome.
#[derive(Clone)]
pub struct PeriodicMetrics {
    run_duration: HistogramVec,
}

impl PeriodicMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let run_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{PREFIX}_periodic_run_duration_seconds"),
                "Periodic job run duration in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
            &["job", "outcome"],
        )?;
        registry.register(Box::new(run_duration.clone()))?;
        Ok(Self { run_duration })
    }

    pub fn record_run(&self, job: &str, succeeded: bool, elapsed: Duration) {
        let outcome = if succeeded {
            OUTCOME_SUCCESS
        } else {
            OUTCOME_FAILURE
        };
        self.run_duration
            .with_label_values(&[job, outcome])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of runs recorded for `job` with `outcome`.
    pub fn run_count(&self, job: &str, outcome: &str) -> u64 {
        self.run_duration
            .with_label_values(&[job, outcome])
            .get_sample_count()
    }
}

/// Render every metric in `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| SchedulerError::Internal(format!("metrics are not UTF-8: {}", e)))
}
