use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::lease::{JobLease, JobLeaser};
use crate::scheduler::{Job, NextTime};
use crate::store::JobStore;
use crate::worker::{Executor, ExecutorRegistry};

/// Polls the job store and runs due jobs under a fixed concurrency budget.
///
/// Any number of schedulers may share one store; the store's claim protocol
/// guarantees a job runs on at most one of them at a time.
pub struct Scheduler {
    config: SchedulerConfig,
    leaser: Arc<JobLeaser>,
    executors: ExecutorRegistry,
    permits: Arc<Semaphore>,
    max_permits: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        next_time: Arc<dyn NextTime>,
        config: SchedulerConfig,
    ) -> Self {
        let max_permits = config.max_concurrency.max(1);
        Self {
            leaser: Arc::new(JobLeaser::new(store, next_time, &config)),
            executors: ExecutorRegistry::new(),
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            config,
        }
    }

    pub fn register_executor(&mut self, executor: Arc<dyn Executor>) {
        self.executors.register(executor);
    }

    pub fn leaser(&self) -> &JobLeaser {
        &self.leaser
    }

    /// Number of concurrency permits currently held.
    pub fn in_flight(&self) -> usize {
        self.max_permits - self.permits.available_permits()
    }

    /// Run the poll loop until `shutdown` is cancelled.
    ///
    /// Cancellation also reaches every running job. Before returning, the
    /// loop waits for in-flight jobs to go through their release path and for
    /// claims that missed their deadline to be handed back.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            max_concurrency = self.max_permits,
            executors = ?self.executors.names(),
            "Starting job scheduler"
        );
        let tracker = TaskTracker::new();

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(SchedulerError::Internal("semaphore closed".to_string())),
                },
            };

            let claim = self
                .leaser
                .preempt_within(self.config.claim_timeout, &shutdown)
                .await;

            let (job, lease) = match claim {
                Ok(claimed) => claimed,
                Err(SchedulerError::Cancelled) => break Ok(()),
                Err(SchedulerError::NoClaimableJob) => {
                    drop(permit);
                    tracing::trace!("No claimable job");
                    self.backoff(&shutdown).await;
                    continue;
                }
                Err(SchedulerError::Timeout(_)) => {
                    drop(permit);
                    tracing::warn!(timeout = ?self.config.claim_timeout, "Preempting job timed out");
                    self.backoff(&shutdown).await;
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "Failed to preempt job");
                    self.backoff(&shutdown).await;
                    continue;
                }
            };

            let Some(executor) = self.executors.get(&job.executor) else {
                // Leave the row running; handing it back would only make this
                // node claim the same misconfigured job again right away.
                tracing::error!(job_id = job.id, executor = %job.executor, "No executor registered for job");
                self.leaser.abandon(lease).await;
                drop(permit);
                continue;
            };

            tracing::debug!(job_id = job.id, name = %job.name, executor = %job.executor, "Dispatching job");
            tracker.spawn(run_job(
                Arc::clone(&self.leaser),
                executor,
                shutdown.clone(),
                job,
                lease,
                permit,
            ));
        };

        tracker.close();
        if !tracker.is_empty() {
            tracing::info!(in_flight = tracker.len(), "Waiting for running jobs to finish");
        }
        tracker.wait().await;
        self.leaser.drain_late_claims().await;
        tracing::info!("Job scheduler stopped");
        result
    }

    async fn backoff(&self, shutdown: &CancellationToken) {
        if self.config.poll_backoff == Duration::ZERO {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_backoff) => {}
        }
    }
}

async fn run_job(
    leaser: Arc<JobLeaser>,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
    job: Job,
    lease: JobLease,
    permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(executor.exec(&cancel, &job))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            tracing::info!(job_id = job.id, name = %job.name, elapsed = ?started.elapsed(), "Job completed");
            if let Err(e) = leaser.reset_next_time(&job).await {
                tracing::error!(job_id = job.id, error = %e, "Failed to update next execution time");
            }
        }
        Ok(Err(e)) => {
            tracing::error!(job_id = job.id, executor = %job.executor, error = %e, "Job execution failed");
        }
        Err(_) => {
            tracing::error!(job_id = job.id, executor = %job.executor, "Job execution panicked");
        }
    }

    leaser.release(lease).await;
    drop(permit);
}
