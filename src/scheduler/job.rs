use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Nobody holds the job; it can be claimed once due.
    Waiting,
    /// Claimed by exactly one worker.
    Running,
    /// No longer scheduled.
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row of the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    /// Name of the executor that knows how to run this job.
    pub executor: String,
    /// Schedule expression, interpreted by a [`NextTime`](super::NextTime).
    pub expression: String,
    /// Opaque executor-specific payload.
    pub config: String,
    pub status: JobStatus,
    /// CAS guard, bumped on every successful claim.
    pub version: i64,
    pub next_time: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A job is due when it is waiting and its next execution time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.next_time <= now
    }

    /// A running job whose last heartbeat is older than `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.heartbeat_at < cutoff
    }
}

/// Seed shape for inserting a job into a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub executor: String,
    pub expression: String,
    pub config: String,
    pub next_time: DateTime<Utc>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: executor.into(),
            expression: String::new(),
            config: String::new(),
            next_time: Utc::now(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = expression.into();
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn with_next_time(mut self, next_time: DateTime<Utc>) -> Self {
        self.next_time = next_time;
        self
    }

    /// Materialize the row a store keeps for this seed.
    pub fn into_job(self, id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            name: self.name,
            executor: self.executor,
            expression: self.expression,
            config: self.config,
            status: JobStatus::Waiting,
            version: 0,
            next_time: self.next_time,
            heartbeat_at: now,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_text() {
        for status in [JobStatus::Waiting, JobStatus::Running, JobStatus::Paused] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("done"), None);
        assert_eq!(JobStatus::Running.to_string(), "running");
    }

    #[test]
    fn new_job_starts_waiting_at_version_zero() {
        let now = Utc::now();
        let job = NewJob::new("ranking", "local")
            .with_expression("0 * * * * *")
            .with_config("{}")
            .with_next_time(now)
            .into_job(7, now);
        assert_eq!(job.id, 7);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.version, 0);
        assert_eq!(job.expression, "0 * * * * *");
        assert_eq!(job.created_at, now);
    }

    #[test]
    fn due_only_when_waiting_and_past() {
        let now = Utc::now();
        let mut job = NewJob::new("a", "local").with_next_time(now).into_job(1, now);
        assert!(job.is_due(now));
        assert!(!job.is_due(now - Duration::seconds(1)));

        job.status = JobStatus::Paused;
        assert!(!job.is_due(now));
    }

    #[test]
    fn stale_only_when_running_with_old_heartbeat() {
        let now = Utc::now();
        let mut job = NewJob::new("a", "local").into_job(1, now - Duration::minutes(5));
        assert!(!job.is_stale(now));

        job.status = JobStatus::Running;
        assert!(job.is_stale(now - Duration::minutes(1)));
        assert!(!job.is_stale(now - Duration::minutes(10)));
    }
}
