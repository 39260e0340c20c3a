use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::LockLeaseConfig;
use crate::error::{Result, SchedulerError};
use crate::lock::{FixedIntervalRetry, Lock, LockBackend, LockClient};

/// Keeps at most one lock handle for a singleton task in this process.
///
/// The handle slot is written by [`ensure_held`](Self::ensure_held), by the
/// refresh task when the lock is lost, and by [`close`](Self::close).
pub struct LockLease {
    client: LockClient,
    config: LockLeaseConfig,
    held: Arc<Mutex<Option<Arc<Lock>>>>,
}

impl LockLease {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockLeaseConfig) -> Self {
        Self {
            client: LockClient::new(backend),
            config,
            held: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &LockLeaseConfig {
        &self.config
    }

    pub async fn is_held(&self) -> bool {
        self.held.lock().await.is_some()
    }

    /// Make sure this process holds the lock, acquiring it if needed.
    ///
    /// Returns `false` when another process holds it or the lock service could
    /// not be reached. The slot stays locked during acquisition, so concurrent
    /// callers in one process trigger a single remote acquisition.
    pub async fn ensure_held(&self) -> bool {
        let mut slot = self.held.lock().await;
        if slot.is_some() {
            return true;
        }

        let key = self.config.key.as_str();
        let retry = FixedIntervalRetry::new(self.config.retry_interval, self.config.retry_max);
        let acquired = tokio::time::timeout(
            self.config.acquire_timeout,
            self.client.acquire(
                key,
                self.config.lease_timeout,
                retry,
                self.config.attempt_timeout,
            ),
        )
        .await
        .unwrap_or(Err(SchedulerError::Timeout("lock acquire")));

        let lock = match acquired {
            Ok(lock) => Arc::new(lock),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to acquire lock");
                return false;
            }
        };

        tracing::info!(key, "Lock acquired, this node runs the task");
        *slot = Some(Arc::clone(&lock));
        drop(slot);

        self.spawn_refresh(lock);
        true
    }

    fn spawn_refresh(&self, lock: Arc<Lock>) {
        let held = Arc::clone(&self.held);
        let interval = self.config.refresh_interval();
        let timeout = self.config.attempt_timeout;

        tokio::spawn(async move {
            let Err(e) = lock.auto_refresh(interval, timeout).await else {
                return;
            };
            tracing::error!(key = %lock.key(), error = %e, "Lock refresh failed");

            let mut slot = held.lock().await;
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &lock)) {
                *slot = None;
            }
        });
    }

    /// Give the lock back if this process holds it.
    pub async fn close(&self) -> Result<()> {
        let Some(lock) = self.held.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.unlock_timeout, lock.unlock()).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout("lock unlock")),
        }
    }
}
