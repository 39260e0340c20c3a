//! Distributed TTL locks.
//!
//! A [`LockBackend`] is the external lock service: it stores `key -> (token,
//! deadline)` and offers three token-checked primitives. [`LockClient`] adds
//! bounded-retry acquisition on top, and [`Lock`] is the handle a holder uses
//! to keep the lock alive and give it back.
//!
//! [`LockLease`] is the piece singleton tasks use: it keeps one lock handle per
//! process, refreshes it in the background, and forgets it when a refresh
//! fails so that the next run acquires again.

mod lease;
mod memory;
mod sqlite;

pub use lease::LockLease;
pub use memory::MemoryLockBackend;
pub use sqlite::SqliteLockBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Number of consecutive timed-out refreshes tolerated before giving up.
const MAX_REFRESH_TIMEOUTS: u32 = 3;

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `key` for `token` unless another token holds an unexpired lock.
    /// Taking a key already held by the same token succeeds.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lock if `token` still holds it.
    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete the lock if `token` holds it.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Retry at a fixed interval, at most `max` times after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedIntervalRetry {
    pub interval: Duration,
    pub max: u32,
}

impl FixedIntervalRetry {
    pub fn new(interval: Duration, max: u32) -> Self {
        Self { interval, max }
    }

    pub fn attempts(&self) -> u32 {
        self.max.saturating_add(1)
    }
}

/// Acquires locks from a backend.
#[derive(Clone)]
pub struct LockClient {
    backend: Arc<dyn LockBackend>,
}

impl LockClient {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Acquire `key` for `ttl`, trying up to `retry.attempts()` times with
    /// each attempt bounded by `attempt_timeout`.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: FixedIntervalRetry,
        attempt_timeout: Duration,
    ) -> Result<Lock> {
        // One token for all attempts, so an attempt that timed out but did
        // land is picked up by the next one.
        let token = Uuid::new_v4().to_string();
        let mut last_error = None;

        for attempt in 0..retry.attempts() {
            if attempt > 0 {
                tokio::time::sleep(retry.interval).await;
            }
            match tokio::time::timeout(
                attempt_timeout,
                self.backend.try_acquire(key, &token, ttl),
            )
            .await
            {
                Ok(Ok(true)) => {
                    tracing::debug!(key, attempt, "Lock acquired");
                    return Ok(Lock {
                        backend: Arc::clone(&self.backend),
                        key: key.to_string(),
                        token,
                        ttl,
                        unlocked: CancellationToken::new(),
                    });
                }
                Ok(Ok(false)) => last_error = None,
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => last_error = Some(SchedulerError::Timeout("lock acquire attempt")),
            }
        }

        Err(last_error.unwrap_or_else(|| SchedulerError::LockNotAcquired(key.to_string())))
    }
}

/// A held lock.
pub struct Lock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
    unlocked: CancellationToken,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.is_cancelled()
    }

    /// Extend the lock by its TTL.
    pub async fn refresh(&self) -> Result<()> {
        if self.backend.refresh(&self.key, &self.token, self.ttl).await? {
            Ok(())
        } else {
            Err(SchedulerError::LockLost(self.key.clone()))
        }
    }

    /// Refresh every `interval`, each refresh bounded by `timeout`.
    ///
    /// Returns `Ok(())` once the lock is unlocked through this handle, and an
    /// error as soon as the lock cannot be kept.
    pub async fn auto_refresh(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.unlocked.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let mut timeouts = 0;
            loop {
                match tokio::time::timeout(timeout, self.refresh()).await {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => return Err(e),
                    Err(_) if timeouts < MAX_REFRESH_TIMEOUTS => {
                        timeouts += 1;
                        tracing::warn!(key = %self.key, timeouts, "Lock refresh timed out, retrying");
                    }
                    Err(_) => return Err(SchedulerError::Timeout("lock refresh")),
                }
            }
        }
    }

    /// Give the lock back and stop any `auto_refresh` running on it.
    pub async fn unlock(&self) -> Result<()> {
        self.unlocked.cancel();
        if self.backend.release(&self.key, &self.token).await? {
            tracing::debug!(key = %self.key, "Lock released");
            Ok(())
        } else {
            Err(SchedulerError::LockLost(self.key.clone()))
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}
