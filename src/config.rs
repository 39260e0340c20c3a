use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the job scheduler poll loop and the leases it hands out.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of jobs allowed to execute at the same time on this node.
    pub max_concurrency: usize,

    /// Deadline for a single claim round-trip against the job store.
    /// Kept short so a slow store cannot stall the poll loop.
    pub claim_timeout: Duration,

    /// How long the loop waits after a failed claim before trying again.
    /// Zero retries immediately (the loop still yields once).
    pub poll_backoff: Duration,

    /// Period of the per-claim heartbeat ticker.
    pub heartbeat_interval: Duration,

    /// Deadline for a single heartbeat write.
    pub heartbeat_timeout: Duration,

    /// Deadline for the store release issued when a job finishes.
    pub release_timeout: Duration,

    /// When set, running jobs whose heartbeat is older than this are
    /// considered abandoned and may be claimed again.
    pub stale_after: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            claim_timeout: Duration::from_secs(1),
            poll_backoff: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(1),
            release_timeout: Duration::from_secs(1),
            stale_after: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Reclaim running jobs after `heartbeats` missed heartbeat periods.
    pub fn with_stale_reclaim(mut self, heartbeats: u32) -> Self {
        self.stale_after = Some(self.heartbeat_interval * heartbeats);
        self
    }
}

/// Configuration for a singleton task guarded by a distributed TTL lock.
#[derive(Debug, Clone)]
pub struct LockLeaseConfig {
    /// Lock key shared by every process competing for the task.
    pub key: String,

    /// Lock TTL. Also bounds a single run of the guarded computation.
    pub lease_timeout: Duration,

    /// Pause between acquisition attempts.
    pub retry_interval: Duration,

    /// Maximum number of retries after the first attempt.
    pub retry_max: u32,

    /// Deadline for each individual acquisition attempt.
    pub attempt_timeout: Duration,

    /// Deadline for the whole acquisition, retries included.
    pub acquire_timeout: Duration,

    /// Deadline for the remote unlock issued on close.
    pub unlock_timeout: Duration,
}

impl Default for LockLeaseConfig {
    fn default() -> Self {
        Self {
            key: "job:ranking".to_string(),
            lease_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            retry_max: 3,
            attempt_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(4),
            unlock_timeout: Duration::from_secs(1),
        }
    }
}

impl LockLeaseConfig {
    pub fn new(key: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            key: key.into(),
            lease_timeout,
            ..Default::default()
        }
    }

    /// The lock is refreshed at half its TTL.
    pub fn refresh_interval(&self) -> Duration {
        self.lease_timeout / 2
    }

    pub fn with_retry(mut self, interval: Duration, max: u32) -> Self {
        self.retry_interval = interval;
        self.retry_max = max;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Node-level configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// SQLite database holding the job table and the lock table.
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
    /// Ranking task settings; `None` disables the task on this node.
    pub ranking: Option<RankingConfig>,
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub interval: Duration,
    pub lease: LockLeaseConfig,
}

impl NodeConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            scheduler: SchedulerConfig::default(),
            ranking: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_ranking(mut self, interval: Duration, lease: LockLeaseConfig) -> Self {
        self.ranking = Some(RankingConfig { interval, lease });
        self
    }
}
