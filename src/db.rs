//! Shared SQLite connection used by the job store and the lock backend.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// How long a statement waits on a database locked by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite connection that can be cloned into async code.
///
/// Statements run on tokio's blocking pool. Separate processes coordinate
/// through the database file itself.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        tracing::info!(path = ?path, "Opening database");
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run statements that must complete before the handle is usable.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run blocking SQL off the async workers.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock()?;
            f(&conn)
        })
        .await?
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// `None` when `ms` is outside chrono's representable range.
pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
