//! Job leases: a claimed job plus the heartbeat that keeps the claim alive.
//!
//! [`JobLeaser::preempt`] claims a job from the store and starts its
//! heartbeat ticker. The returned [`JobLease`] carries the version the claim
//! produced and is the only way to end the claim. Every way of ending it
//! stops the ticker:
//!
//! - [`JobLeaser::release`] stops the ticker and hands the row back (waiting)
//! - [`JobLeaser::abandon`] stops the ticker but leaves the row running, so
//!   the claim simply goes stale
//! - dropping the lease stops the ticker as well
//!
//! [`JobLeaser::preempt_within`] bounds the claim by a deadline. A store call
//! that outlives it keeps running in the background, and if it ends up
//! claiming a row that row is released straight away.

mod heartbeat;

pub use heartbeat::HeartbeatTicker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, NextTime};
use crate::store::JobStore;

/// Proof of a claim on one job.
#[must_use = "a lease must be released or abandoned"]
pub struct JobLease {
    job_id: i64,
    version: i64,
    ticker: JoinHandle<()>,
    stop: DropGuard,
}

impl JobLease {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Row version written by the claim.
    pub fn version(&self) -> i64 {
        self.version
    }

    async fn stop_heartbeat(self) -> (i64, i64) {
        let JobLease {
            job_id,
            version,
            ticker,
            stop,
        } = self;
        drop(stop);
        if let Err(e) = ticker.await {
            tracing::warn!(job_id, error = %e, "Heartbeat task ended abnormally");
        }
        (job_id, version)
    }
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLease")
            .field("job_id", &self.job_id)
            .field("version", &self.version)
            .finish()
    }
}

/// Claims jobs and manages the lifetime of their leases.
pub struct JobLeaser {
    store: Arc<dyn JobStore>,
    next_time: Arc<dyn NextTime>,
    heartbeat: HeartbeatTicker,
    release_timeout: Duration,
    active_heartbeats: Arc<AtomicUsize>,
    late_claims: TaskTracker,
}

impl JobLeaser {
    pub fn new(
        store: Arc<dyn JobStore>,
        next_time: Arc<dyn NextTime>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            next_time,
            heartbeat: HeartbeatTicker::new(config.heartbeat_interval, config.heartbeat_timeout),
            release_timeout: config.release_timeout,
            active_heartbeats: Arc::new(AtomicUsize::new(0)),
            late_claims: TaskTracker::new(),
        }
    }

    /// Number of heartbeat tickers currently running.
    pub fn active_heartbeats(&self) -> usize {
        self.active_heartbeats.load(Ordering::SeqCst)
    }

    /// Claim one due job and start keeping its lease alive.
    pub async fn preempt(&self) -> Result<(Job, JobLease)> {
        let job = self.store.preempt().await?;
        Ok(self.start_lease(job))
    }

    /// Like [`preempt`](Self::preempt), but give up after `deadline` or once
    /// `shutdown` fires.
    ///
    /// Giving up does not stop the store call. It is left to finish in the
    /// background and any job it claims is handed back at once, so a claim
    /// nobody is waiting for never leaves a row running.
    pub async fn preempt_within(
        &self,
        deadline: Duration,
        shutdown: &CancellationToken,
    ) -> Result<(Job, JobLease)> {
        let store = Arc::clone(&self.store);
        let mut claim = tokio::spawn(async move { store.preempt().await });

        let gave_up = tokio::select! {
            biased;
            _ = shutdown.cancelled() => SchedulerError::Cancelled,
            joined = tokio::time::timeout(deadline, &mut claim) => match joined {
                Ok(joined) => {
                    let job = joined??;
                    return Ok(self.start_lease(job));
                }
                Err(_) => SchedulerError::Timeout("claim"),
            },
        };
        self.hand_back_late_claim(claim);
        Err(gave_up)
    }

    /// Wait until every claim that outlived its deadline has been handed back.
    pub async fn drain_late_claims(&self) {
        self.late_claims.close();
        if !self.late_claims.is_empty() {
            tracing::info!(pending = self.late_claims.len(), "Waiting for late claims to settle");
        }
        self.late_claims.wait().await;
        self.late_claims.reopen();
    }

    fn hand_back_late_claim(&self, claim: JoinHandle<Result<Job>>) {
        let store = Arc::clone(&self.store);
        self.late_claims.spawn(async move {
            let job = match claim.await {
                Ok(Ok(job)) => job,
                Ok(Err(SchedulerError::NoClaimableJob)) => return,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Abandoned claim failed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Abandoned claim task ended abnormally");
                    return;
                }
            };
            tracing::warn!(job_id = job.id, version = job.version, "Claim completed after its deadline, handing job back");
            if let Err(e) = store.release(job.id, job.version).await {
                tracing::error!(job_id = job.id, error = %e, "Failed to hand back late claim");
            }
        });
    }

    fn start_lease(&self, job: Job) -> (Job, JobLease) {
        let stop = CancellationToken::new();
        let ticker = self.heartbeat;
        let store = Arc::clone(&self.store);
        let active = Arc::clone(&self.active_heartbeats);
        let token = stop.clone();
        let (job_id, version) = (job.id, job.version);

        active.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            ticker.run(store, job_id, version, token).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });

        let lease = JobLease {
            job_id,
            version,
            ticker: handle,
            stop: stop.drop_guard(),
        };
        (job, lease)
    }

    /// End the claim: stop the heartbeat and put the job back to waiting.
    ///
    /// Store failures are logged; the job then stays running until its
    /// heartbeat goes stale. A row reclaimed by another worker is left alone.
    pub async fn release(&self, lease: JobLease) {
        let (job_id, version) = lease.stop_heartbeat().await;
        let release = self.store.release(job_id, version);
        match tokio::time::timeout(self.release_timeout, release).await {
            Ok(Ok(())) => tracing::debug!(job_id, "Job released"),
            Ok(Err(SchedulerError::LeaseLost(_))) => {
                tracing::warn!(job_id, version, "Job was reclaimed by another worker, not releasing");
            }
            Ok(Err(e)) => tracing::error!(job_id, error = %e, "Failed to release job"),
            Err(_) => {
                tracing::error!(job_id, timeout = ?self.release_timeout, "Releasing job timed out")
            }
        }
    }

    /// Stop the heartbeat without handing the job back.
    pub async fn abandon(&self, lease: JobLease) {
        let (job_id, _) = lease.stop_heartbeat().await;
        tracing::debug!(job_id, "Job lease abandoned");
    }

    /// Advance the job's schedule pointer past now. `job` must be the row as
    /// returned by the claim.
    pub async fn reset_next_time(&self, job: &Job) -> Result<()> {
        let after = job.next_time.max(Utc::now());
        let next = self.next_time.next_time(job, after)?;
        self.store
            .update_next_execution(job.id, job.version, next)
            .await
    }
}
