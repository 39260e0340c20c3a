use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::Job;

/// A named capability that knows how to run one class of job.
///
/// `exec` runs under the scheduler's cancellation token and must return
/// promptly once it fires; the scheduler holds a concurrency permit for as
/// long as `exec` runs.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn exec(&self, cancel: &CancellationToken, job: &Job) -> Result<()>;
}

/// Executors by name, populated at startup.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `executor` under its own name, replacing any previous binding.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        let name = executor.name().to_string();
        if self.executors.insert(name.clone(), executor).is_some() {
            tracing::warn!(executor = %name, "Executor replaced");
        } else {
            tracing::info!(executor = %name, "Executor registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}
