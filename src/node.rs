use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::db::Database;
use crate::error::Result;
use crate::lock::SqliteLockBackend;
use crate::metrics::PeriodicMetrics;
use crate::periodic::PeriodicRunner;
use crate::ranking::{LoggingRankingService, RankingJob, RankingService};
use crate::scheduler::{CronNextTime, Scheduler};
use crate::store::SqliteJobStore;
use crate::worker::{LocalFuncExecutor, ShellExecutor};

/// Main node that wires the store, the scheduler and the periodic tasks
/// around one SQLite database.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<SqliteJobStore>,
    pub local: Arc<LocalFuncExecutor>,
    scheduler: Scheduler,
    ranking: Option<(Arc<RankingJob>, PeriodicRunner)>,
    registry: Registry,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_ranking_service(config, Arc::new(LoggingRankingService))
    }

    pub fn with_ranking_service(
        config: NodeConfig,
        ranking_service: Arc<dyn RankingService>,
    ) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        let store = Arc::new(
            SqliteJobStore::new(db.clone())?.with_stale_after(config.scheduler.stale_after),
        );

        let local = Arc::new(LocalFuncExecutor::new());
        let mut scheduler = Scheduler::new(
            store.clone(),
            Arc::new(CronNextTime),
            config.scheduler.clone(),
        );
        scheduler.register_executor(local.clone());
        scheduler.register_executor(Arc::new(ShellExecutor::new()));

        let registry = Registry::new();
        let ranking = match &config.ranking {
            Some(ranking) => {
                let backend = Arc::new(SqliteLockBackend::new(db)?);
                let job = Arc::new(RankingJob::new(
                    ranking_service,
                    backend,
                    ranking.lease.clone(),
                ));
                let metrics = PeriodicMetrics::new(&registry)?;
                let runner = PeriodicRunner::new(job.clone(), ranking.interval, metrics);
                Some((job, runner))
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            local,
            scheduler,
            ranking,
            registry,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ranking_job(&self) -> Option<&Arc<RankingJob>> {
        self.ranking.as_ref().map(|(job, _)| job)
    }

    /// Registry holding this node's metrics. Clones share the same series.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// The scheduler loop and the ranking task (if configured) run side by
    /// side; both drain before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            db = ?self.config.db_path,
            ranking = self.ranking.is_some(),
            "Starting node"
        );

        let scheduler = self.scheduler.run(shutdown.clone());
        let result = match &self.ranking {
            Some((_, runner)) => {
                let (result, ()) = tokio::join!(scheduler, runner.run(shutdown.clone()));
                result
            }
            None => scheduler.await,
        };

        tracing::info!("Node stopped");
        result
    }
}
