use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use crate::db::{to_millis, Database};
use crate::error::{Result, SchedulerError};
use crate::lock::LockBackend;

const CREATE_LOCKS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS distributed_locks (
    key TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

/// Lock service backed by a SQLite table, usable across processes that open
/// the same database file.
#[derive(Clone)]
pub struct SqliteLockBackend {
    db: Database,
}

impl SqliteLockBackend {
    pub fn new(db: Database) -> Result<Self> {
        db.execute_batch(CREATE_LOCKS_TABLE)?;
        Ok(Self { db })
    }
}

fn ttl_millis(ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_millis())
        .map_err(|_| SchedulerError::Internal(format!("lock ttl too large: {:?}", ttl)))
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let token = token.to_string();
        let ttl = ttl_millis(ttl)?;
        self.db
            .with_conn(move |conn| {
                let now = to_millis(Utc::now());
                let affected = conn.execute(
                    "INSERT INTO distributed_locks (key, token, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
                     WHERE distributed_locks.expires_at <= ?4 OR distributed_locks.token = excluded.token",
                    params![key, token, now + ttl, now],
                )?;
                Ok(affected > 0)
            })
            .await
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let token = token.to_string();
        let ttl = ttl_millis(ttl)?;
        self.db
            .with_conn(move |conn| {
                let now = to_millis(Utc::now());
                let affected = conn.execute(
                    "UPDATE distributed_locks SET expires_at = ?1
                     WHERE key = ?2 AND token = ?3 AND expires_at > ?4",
                    params![now + ttl, key, token, now],
                )?;
                Ok(affected > 0)
            })
            .await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let key = key.to_string();
        let token = token.to_string();
        self.db
            .with_conn(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM distributed_locks WHERE key = ?1 AND token = ?2",
                    params![key, token],
                )?;
                Ok(affected > 0)
            })
            .await
    }
}
