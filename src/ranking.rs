//! Singleton ranking computation guarded by a distributed lock.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::LockLeaseConfig;
use crate::error::{Result, SchedulerError};
use crate::lock::{LockBackend, LockLease};
use crate::periodic::PeriodicJob;

/// Computes and publishes the top-N ranking.
#[async_trait]
pub trait RankingService: Send + Sync {
    async fn top_n(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Stand-in service for nodes without a ranking back end wired in.
#[derive(Debug, Default)]
pub struct LoggingRankingService;

#[async_trait]
impl RankingService for LoggingRankingService {
    async fn top_n(&self, _cancel: &CancellationToken) -> Result<()> {
        tracing::info!("Computing ranking");
        Ok(())
    }
}

/// Runs the ranking service on whichever node holds the ranking lock.
pub struct RankingJob {
    service: Arc<dyn RankingService>,
    lease: LockLease,
}

impl RankingJob {
    pub fn new(
        service: Arc<dyn RankingService>,
        backend: Arc<dyn LockBackend>,
        config: LockLeaseConfig,
    ) -> Self {
        Self {
            service,
            lease: LockLease::new(backend, config),
        }
    }

    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    /// Compute the ranking if this node holds (or can take) the lock.
    ///
    /// Losing the lock race is not a failure. A lock lost mid-run does not
    /// interrupt the computation.
    pub async fn run(&self) -> Result<()> {
        if !self.lease.ensure_held().await {
            tracing::debug!(key = %self.lease.config().key, "Ranking lock held elsewhere, skipping");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let timeout = self.lease.config().lease_timeout;
        tokio::time::timeout(timeout, self.service.top_n(&cancel))
            .await
            .map_err(|_| SchedulerError::Timeout("ranking computation"))?
    }

    /// Release the ranking lock.
    pub async fn close(&self) -> Result<()> {
        self.lease.close().await
    }
}

#[async_trait]
impl PeriodicJob for RankingJob {
    fn name(&self) -> &str {
        "ranking"
    }

    async fn run(&self) -> Result<()> {
        RankingJob::run(self).await
    }

    async fn close(&self) -> Result<()> {
        RankingJob::close(self).await
    }
}
