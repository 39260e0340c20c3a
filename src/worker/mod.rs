//! Executors: the capabilities that actually run claimed jobs.
//!
//! The scheduler looks up an [`Executor`] by the job's `executor` field in an
//! [`ExecutorRegistry`]. Some executors dispatch a second time:
//!
//! - [`LocalFuncExecutor`] (`"local"`): in-process functions keyed by job name
//! - [`ShellExecutor`] (`"shell"`): runs the job's config payload via `sh -c`

pub mod executor;
pub mod local;
pub mod shell;

pub use executor::{Executor, ExecutorRegistry};
pub use local::LocalFuncExecutor;
pub use shell::{ShellExecutor, ShellOutput};
