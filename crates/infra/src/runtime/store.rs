//! Job runtime contract and the in-process implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use chunkflow_core::{Clock, GroupName, JobId, SyncError};
use chunkflow_events::{HookName, JobArgs, JobDescriptor};

use super::types::{Job, JobStatus};

/// Operations the engine consumes from an asynchronous job runtime.
pub trait JobRuntime: Send + Sync {
    /// Enqueue a job that runs as soon as a worker is free.
    fn schedule(&self, hook: HookName, args: JobArgs, group: GroupName) -> Result<JobId, RuntimeError>;

    /// Enqueue a job that does not run before `at`.
    fn schedule_delayed(
        &self,
        at: DateTime<Utc>,
        hook: HookName,
        args: JobArgs,
        group: GroupName,
    ) -> Result<JobId, RuntimeError>;

    /// Ids of the group's jobs currently in one of `statuses`, oldest first.
    fn query_actions(
        &self,
        group: &GroupName,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<JobId>, RuntimeError>;

    fn fetch_job(&self, job_id: JobId) -> Result<Option<JobDescriptor>, RuntimeError>;

    fn job_logs(&self, job_id: JobId) -> Result<Vec<String>, RuntimeError>;

    fn append_log(&self, job_id: JobId, message: &str) -> Result<(), RuntimeError>;
}

/// Worker-side operations used by the executor.
pub trait JobQueue: JobRuntime {
    /// Claim the oldest ready pending job and mark it running.
    fn claim_next(&self) -> Result<Option<Job>, RuntimeError>;

    fn complete(&self, job_id: JobId) -> Result<(), RuntimeError>;

    fn fail(&self, job_id: JobId, error: String) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("runtime error: {0}")]
    Storage(String),
}

impl From<RuntimeError> for SyncError {
    fn from(value: RuntimeError) -> Self {
        SyncError::SchedulingFailure(value.to_string())
    }
}

impl<R> JobRuntime for Arc<R>
where
    R: JobRuntime + ?Sized,
{
    fn schedule(&self, hook: HookName, args: JobArgs, group: GroupName) -> Result<JobId, RuntimeError> {
        (**self).schedule(hook, args, group)
    }

    fn schedule_delayed(
        &self,
        at: DateTime<Utc>,
        hook: HookName,
        args: JobArgs,
        group: GroupName,
    ) -> Result<JobId, RuntimeError> {
        (**self).schedule_delayed(at, hook, args, group)
    }

    fn query_actions(
        &self,
        group: &GroupName,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<JobId>, RuntimeError> {
        (**self).query_actions(group, statuses, limit)
    }

    fn fetch_job(&self, job_id: JobId) -> Result<Option<JobDescriptor>, RuntimeError> {
        (**self).fetch_job(job_id)
    }

    fn job_logs(&self, job_id: JobId) -> Result<Vec<String>, RuntimeError> {
        (**self).job_logs(job_id)
    }

    fn append_log(&self, job_id: JobId, message: &str) -> Result<(), RuntimeError> {
        (**self).append_log(job_id, message)
    }
}

impl<R> JobQueue for Arc<R>
where
    R: JobQueue + ?Sized,
{
    fn claim_next(&self) -> Result<Option<Job>, RuntimeError> {
        (**self).claim_next()
    }

    fn complete(&self, job_id: JobId) -> Result<(), RuntimeError> {
        (**self).complete(job_id)
    }

    fn fail(&self, job_id: JobId, error: String) -> Result<(), RuntimeError> {
        (**self).fail(job_id, error)
    }
}

#[derive(Debug, Default)]
struct JobTable {
    by_id: HashMap<JobId, Job>,
    /// Insertion order, used for FIFO claiming.
    order: Vec<JobId>,
}

impl JobTable {
    fn ordered(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}

/// In-process job runtime for tests/dev.
pub struct InMemoryJobRuntime {
    jobs: RwLock<JobTable>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobRuntime {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(JobTable::default()),
            clock,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().ok()?.by_id.get(&job_id).cloned()
    }

    /// Every job ever scheduled, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .read()
            .map(|table| table.ordered().cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs scheduled for `hook`, oldest first.
    pub fn jobs_for(&self, hook: &HookName) -> Vec<Job> {
        self.jobs().into_iter().filter(|job| &job.hook == hook).collect()
    }

    fn enqueue(&self, job: Job) -> Result<JobId, RuntimeError> {
        let mut table = self.jobs.write().map_err(|_| poisoned())?;
        let id = job.id;
        debug!(job_id = %id, hook = %job.hook, group = %job.group, "job scheduled");
        table.order.push(id);
        table.by_id.insert(id, job);
        Ok(id)
    }

    fn with_job<T>(&self, job_id: JobId, f: impl FnOnce(&mut Job) -> T) -> Result<T, RuntimeError> {
        let mut table = self.jobs.write().map_err(|_| poisoned())?;
        let job = table.by_id.get_mut(&job_id).ok_or(RuntimeError::NotFound(job_id))?;
        Ok(f(job))
    }
}

fn poisoned() -> RuntimeError {
    RuntimeError::Storage("job table lock poisoned".to_string())
}

impl JobRuntime for InMemoryJobRuntime {
    fn schedule(&self, hook: HookName, args: JobArgs, group: GroupName) -> Result<JobId, RuntimeError> {
        self.enqueue(Job::new(hook, args, group, self.clock.now()))
    }

    fn schedule_delayed(
        &self,
        at: DateTime<Utc>,
        hook: HookName,
        args: JobArgs,
        group: GroupName,
    ) -> Result<JobId, RuntimeError> {
        self.enqueue(Job::new(hook, args, group, self.clock.now()).scheduled_at(at))
    }

    fn query_actions(
        &self,
        group: &GroupName,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<JobId>, RuntimeError> {
        let table = self.jobs.read().map_err(|_| poisoned())?;
        Ok(table
            .ordered()
            .filter(|job| &job.group == group && statuses.contains(&job.status))
            .map(|job| job.id)
            .take(limit)
            .collect())
    }

    fn fetch_job(&self, job_id: JobId) -> Result<Option<JobDescriptor>, RuntimeError> {
        let table = self.jobs.read().map_err(|_| poisoned())?;
        Ok(table.by_id.get(&job_id).map(Job::descriptor))
    }

    fn job_logs(&self, job_id: JobId) -> Result<Vec<String>, RuntimeError> {
        let table = self.jobs.read().map_err(|_| poisoned())?;
        table
            .by_id
            .get(&job_id)
            .map(|job| job.logs.clone())
            .ok_or(RuntimeError::NotFound(job_id))
    }

    fn append_log(&self, job_id: JobId, message: &str) -> Result<(), RuntimeError> {
        self.with_job(job_id, |job| job.logs.push(message.to_string()))
    }
}

impl JobQueue for InMemoryJobRuntime {
    fn claim_next(&self) -> Result<Option<Job>, RuntimeError> {
        let now = self.clock.now();
        let mut table = self.jobs.write().map_err(|_| poisoned())?;
        let next = table
            .ordered()
            .find(|job| job.status == JobStatus::Pending && job.is_ready(now))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            table.by_id.get_mut(&id).map(|job| {
                job.mark_running(now);
                job.clone()
            })
        }))
    }

    fn complete(&self, job_id: JobId) -> Result<(), RuntimeError> {
        let now = self.clock.now();
        self.with_job(job_id, |job| job.mark_completed(now))
    }

    fn fail(&self, job_id: JobId, error: String) -> Result<(), RuntimeError> {
        let now = self.clock.now();
        self.with_job(job_id, |job| job.mark_failed(error, now))
    }
}
