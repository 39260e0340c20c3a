pub mod core;
pub mod job;
pub mod schedule;

pub use self::core::Scheduler;
pub use job::{Job, JobStatus, NewJob};
pub use schedule::{CronNextTime, FixedInterval, NextTime};
