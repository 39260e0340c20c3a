use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, JobStatus, NewJob};
use crate::store::{stale_cutoff, JobStore};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, Job>,
    next_id: i64,
}

/// In-process job table.
///
/// Finding a candidate and swapping its version happen in separate critical
/// sections, exactly like two SQL statements would, so concurrent claimers
/// genuinely race on the version column.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<Table>,
    stale_after: Option<Duration>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also claim running jobs whose heartbeat is older than `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Insert a job in the waiting state and return its id.
    pub fn insert(&self, job: NewJob) -> Result<i64> {
        let mut table = self.table.lock()?;
        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(id, job.into_job(id, Utc::now()));
        Ok(id)
    }

    /// Overwrite a row as-is. Used to stage states such as crashed workers.
    pub fn put(&self, job: Job) -> Result<()> {
        let mut table = self.table.lock()?;
        table.next_id = table.next_id.max(job.id);
        table.rows.insert(job.id, job);
        Ok(())
    }

    /// All rows ordered by id.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.table.lock()?.rows.values().cloned().collect())
    }

    fn candidate(&self, now: DateTime<Utc>) -> Result<Option<(i64, i64)>> {
        let cutoff = stale_cutoff(self.stale_after, now);
        let table = self.table.lock()?;
        Ok(table
            .rows
            .values()
            .filter(|j| j.is_due(now) || cutoff.is_some_and(|c| j.is_stale(c)))
            .min_by_key(|j| j.next_time)
            .map(|j| (j.id, j.version)))
    }

    fn compare_and_claim(&self, id: i64, version: i64, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut table = self.table.lock()?;
        match table.rows.get_mut(&id) {
            Some(job) if job.version == version => {
                job.status = JobStatus::Running;
                job.version += 1;
                job.heartbeat_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    fn update<F>(&self, id: i64, version: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut table = self.table.lock()?;
        let job = table
            .rows
            .get_mut(&id)
            .ok_or(SchedulerError::JobNotFound(id))?;
        if job.version != version {
            return Err(SchedulerError::LeaseLost(id));
        }
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn preempt(&self) -> Result<Job> {
        loop {
            let now = Utc::now();
            let Some((id, version)) = self.candidate(now)? else {
                return Err(SchedulerError::NoClaimableJob);
            };
            if let Some(job) = self.compare_and_claim(id, version, now)? {
                tracing::debug!(job_id = id, version = job.version, "Job preempted");
                return Ok(job);
            }
            tracing::debug!(job_id = id, version, "Lost claim race, looking again");
            tokio::task::yield_now().await;
        }
    }

    async fn release(&self, id: i64, version: i64) -> Result<()> {
        self.update(id, version, |job| {
            job.status = JobStatus::Waiting;
            job.heartbeat_at = Utc::now();
        })
    }

    async fn update_heartbeat(&self, id: i64, version: i64) -> Result<()> {
        self.update(id, version, |job| job.heartbeat_at = Utc::now())
    }

    async fn update_next_execution(
        &self,
        id: i64,
        version: i64,
        next_time: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, version, |job| {
            job.next_time = job.next_time.max(next_time);
            job.heartbeat_at = Utc::now();
        })
    }

    async fn find(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.table.lock()?.rows.get(&id).cloned())
    }
}
