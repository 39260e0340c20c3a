use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{from_millis, to_millis, Database};
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, JobStatus, NewJob};
use crate::store::{stale_cutoff, JobStore};

const CREATE_JOBS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    executor TEXT NOT NULL,
    expression TEXT NOT NULL,
    config TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    next_time INTEGER NOT NULL,
    heartbeat_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status_next_time ON jobs (status, next_time);
";

const JOB_COLUMNS: &str =
    "id, name, executor, expression, config, status, version, next_time, heartbeat_at, created_at";

/// Job table in a SQLite database. Timestamps are stored as UNIX millis.
///
/// Several stores, in one process or many, may open the same database file;
/// the version CAS keeps claims exclusive across all of them.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
    stale_after: Option<Duration>,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Result<Self> {
        db.execute_batch(CREATE_JOBS_TABLE)?;
        Ok(Self {
            db,
            stale_after: None,
        })
    }

    /// Also claim running jobs whose heartbeat is older than `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Insert a job in the waiting state and return its id.
    pub async fn insert(&self, job: NewJob) -> Result<i64> {
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (name, executor, expression, config, status, version,
                                       next_time, heartbeat_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
                    params![
                        job.name,
                        job.executor,
                        job.expression,
                        job.config,
                        JobStatus::Waiting.as_str(),
                        to_millis(job.next_time),
                        to_millis(Utc::now()),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status: String = row.get("status")?;
        let status = JobStatus::parse(&status).ok_or_else(|| {
            conversion_failure(row, "status", Type::Text, format!("unknown job status {status:?}"))
        })?;
        Ok(Job {
            id: row.get("id")?,
            name: row.get("name")?,
            executor: row.get("executor")?,
            expression: row.get("expression")?,
            config: row.get("config")?,
            status,
            version: row.get("version")?,
            next_time: millis_column(row, "next_time")?,
            heartbeat_at: millis_column(row, "heartbeat_at")?,
            created_at: millis_column(row, "created_at")?,
        })
    }

    /// Map a guarded write that touched nothing to the reason it missed.
    fn expect_row(conn: &Connection, id: i64, affected: usize) -> Result<()> {
        if affected > 0 {
            return Ok(());
        }
        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Err(SchedulerError::LeaseLost(id))
        } else {
            Err(SchedulerError::JobNotFound(id))
        }
    }
}

fn millis_column(row: &rusqlite::Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(name)?;
    from_millis(ms).ok_or_else(|| {
        conversion_failure(row, name, Type::Integer, format!("timestamp out of range: {ms}"))
    })
}

fn conversion_failure(row: &rusqlite::Row, name: &str, ty: Type, msg: String) -> rusqlite::Error {
    let idx = row.as_ref().column_index(name).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn preempt(&self) -> Result<Job> {
        let stale_after = self.stale_after;
        self.db
            .with_conn(move |conn| loop {
                let now = Utc::now();
                let cutoff = stale_cutoff(stale_after, now).map(to_millis);
                let candidate: Option<(i64, i64)> = conn
                    .query_row(
                        "SELECT id, version FROM jobs
                         WHERE (status = ?1 AND next_time <= ?2)
                            OR (?3 IS NOT NULL AND status = ?4 AND heartbeat_at < ?3)
                         ORDER BY next_time
                         LIMIT 1",
                        params![
                            JobStatus::Waiting.as_str(),
                            to_millis(now),
                            cutoff,
                            JobStatus::Running.as_str(),
                        ],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((id, version)) = candidate else {
                    return Err(SchedulerError::NoClaimableJob);
                };

                let claimed = conn
                    .query_row(
                        &format!(
                            "UPDATE jobs SET status = ?1, version = version + 1, heartbeat_at = ?2
                             WHERE id = ?3 AND version = ?4
                             RETURNING {}",
                            JOB_COLUMNS
                        ),
                        params![JobStatus::Running.as_str(), to_millis(now), id, version],
                        Self::row_to_job,
                    )
                    .optional()?;
                match claimed {
                    Some(job) => {
                        tracing::debug!(job_id = id, version = job.version, "Job preempted");
                        return Ok(job);
                    }
                    None => tracing::debug!(job_id = id, version, "Lost claim race, looking again"),
                }
            })
            .await
    }

    async fn release(&self, id: i64, version: i64) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                let affected = conn.execute(
                    "UPDATE jobs SET status = ?1, heartbeat_at = ?2 WHERE id = ?3 AND version = ?4",
                    params![JobStatus::Waiting.as_str(), to_millis(Utc::now()), id, version],
                )?;
                Self::expect_row(conn, id, affected)
            })
            .await
    }

    async fn update_heartbeat(&self, id: i64, version: i64) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                let affected = conn.execute(
                    "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2 AND version = ?3",
                    params![to_millis(Utc::now()), id, version],
                )?;
                Self::expect_row(conn, id, affected)
            })
            .await
    }

    async fn update_next_execution(
        &self,
        id: i64,
        version: i64,
        next_time: DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .with_conn(move |conn| {
                let affected = conn.execute(
                    "UPDATE jobs SET next_time = MAX(next_time, ?1), heartbeat_at = ?2
                     WHERE id = ?3 AND version = ?4",
                    params![to_millis(next_time), to_millis(Utc::now()), id, version],
                )?;
                Self::expect_row(conn, id, affected)
            })
            .await
    }

    async fn find(&self, id: i64) -> Result<Option<Job>> {
        self.db
            .with_conn(move |conn| {
                let job = conn
                    .query_row(
                        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                        params![id],
                        Self::row_to_job,
                    )
                    .optional()?;
                Ok(job)
            })
            .await
    }
}
