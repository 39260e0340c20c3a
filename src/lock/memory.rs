use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;
use crate::lock::LockBackend;

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

/// In-process lock service. Clients sharing one backend behave like separate
/// processes talking to the same lock server.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    locks: Mutex<HashMap<String, Entry>>,
    acquisitions: AtomicUsize,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `try_acquire` calls so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Current holder of `key`, if the lock is live.
    pub fn holder(&self, key: &str) -> Result<Option<String>> {
        let locks = self.locks.lock()?;
        let now = Instant::now();
        Ok(locks
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.token.clone()))
    }

    /// Drop `key` regardless of holder, as a lock server losing state would.
    pub fn evict(&self, key: &str) -> Result<()> {
        self.locks.lock()?.remove(key);
        Ok(())
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock()?;
        let now = Instant::now();
        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now && entry.token != token {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn refresh(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock()?;
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.lock()?;
        match locks.get(key) {
            Some(entry) if entry.token == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
