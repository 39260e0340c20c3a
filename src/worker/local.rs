use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::scheduler::Job;
use crate::worker::Executor;

type LocalFunc = Arc<dyn Fn(CancellationToken, Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs jobs by calling in-process functions registered under the job name.
#[derive(Default)]
pub struct LocalFuncExecutor {
    funcs: RwLock<HashMap<String, LocalFunc>>,
}

impl LocalFuncExecutor {
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` for jobs named `name`.
    pub fn register_func<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(CancellationToken, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let func: LocalFunc = Arc::new(move |cancel, job| func(cancel, job).boxed());
        self.funcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, func);
    }

    // A panic elsewhere cannot leave the map half-written, so a poisoned lock
    // is still safe to use.
    fn lookup(&self, name: &str) -> Result<LocalFunc> {
        let func = self
            .funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        func.ok_or_else(|| SchedulerError::UnregisteredFunction(name.to_string()))
    }
}

#[async_trait]
impl Executor for LocalFuncExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn exec(&self, cancel: &CancellationToken, job: &Job) -> Result<()> {
        let func = self.lookup(&job.name)?;
        func(cancel.clone(), job.clone()).await
    }
}
