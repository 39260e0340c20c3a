use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;

/// Computes when a job should run next.
///
/// Expression parsing lives behind this trait; the scheduler only needs the
/// resulting timestamp.
pub trait NextTime: Send + Sync {
    fn next_time(&self, job: &Job, after: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// Interprets the job expression as a cron expression with a seconds column.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronNextTime;

impl NextTime for CronNextTime {
    fn next_time(&self, job: &Job, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = cron::Schedule::from_str(&job.expression)
            .map_err(|e| SchedulerError::InvalidSchedule(format!("{}: {}", job.expression, e)))?;
        schedule.after(&after).next().ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{}: no upcoming time", job.expression))
        })
    }
}

/// Ignores the expression and runs every job at a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl NextTime for FixedInterval {
    fn next_time(&self, _job: &Job, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let period = chrono::Duration::from_std(self.0)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
        Ok(after + period)
    }
}
