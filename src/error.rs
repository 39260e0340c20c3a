use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No claimable job")]
    NoClaimableJob,

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Unregistered local function: {0}")]
    UnregisteredFunction(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("Job lease lost: {0}")]
    LeaseLost(i64),

    #[error("Lock not acquired: {0}")]
    LockNotAcquired(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl<T> From<std::sync::PoisonError<T>> for SchedulerError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SchedulerError::Internal(format!("mutex poisoned: {}", e))
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(e: tokio::task::JoinError) -> Self {
        SchedulerError::Internal(format!("blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
