//! Job persistence and the preemption protocol.
//!
//! A [`JobStore`] owns the job table and arbitrates which worker runs which
//! job. Claiming is a compare-and-swap on the row's `version` column, so any
//! number of schedulers can poll the same store concurrently:
//!
//! 1. find one due row (`status = waiting AND next_time <= now`)
//! 2. `UPDATE .. SET status = running, version = version + 1 WHERE id = ? AND version = ?`
//! 3. zero rows affected means another worker won; go back to 1
//!
//! Stores are only ever touched through this trait by the scheduler. Seeding
//! rows (`insert`) is an inherent method of each implementation.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::scheduler::Job;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim one due job. Returns the row as it is after the claim, or
    /// [`SchedulerError::NoClaimableJob`](crate::error::SchedulerError::NoClaimableJob)
    /// when nothing is due.
    async fn preempt(&self) -> Result<Job>;

    /// Hand a claimed job back: status returns to waiting and the heartbeat
    /// is refreshed. Releasing a job that is already waiting is a no-op.
    ///
    /// Every write on a claimed row is guarded by the `version` the claim
    /// produced. Once another worker has reclaimed the row the write affects
    /// nothing and fails with
    /// [`SchedulerError::LeaseLost`](crate::error::SchedulerError::LeaseLost).
    async fn release(&self, id: i64, version: i64) -> Result<()>;

    /// Refresh the heartbeat of a claimed job.
    async fn update_heartbeat(&self, id: i64, version: i64) -> Result<()>;

    /// Advance the schedule pointer after a successful run. The pointer never
    /// moves backwards.
    async fn update_next_execution(
        &self,
        id: i64,
        version: i64,
        next_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn find(&self, id: i64) -> Result<Option<Job>>;
}

/// Heartbeat cutoff for stale-lease reclaim, if enabled.
pub(crate) fn stale_cutoff(
    stale_after: Option<std::time::Duration>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    stale_after
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| now - d)
}
