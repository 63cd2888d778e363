//! Job runtime boundary.
//!
//! ## Components
//!
//! - `JobRuntime`: what the engine consumes (schedule, delayed schedule,
//!   group queries, job lookup, execution logs)
//! - `InMemoryJobRuntime`: in-process queue for tests/dev
//! - `HookRegistry`: explicit `(sync, phase) -> handler` table built at startup
//! - `JobExecutor`: claims jobs, runs handlers, emits lifecycle events

pub mod executor;
pub mod registry;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome};
pub use registry::{HookRegistry, JobHandler};
pub use store::{InMemoryJobRuntime, JobQueue, JobRuntime, RuntimeError};
pub use types::{Job, JobStatus};
