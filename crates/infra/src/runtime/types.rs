//! Job records kept by the in-process job runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkflow_core::{GroupName, JobId};
use chunkflow_events::{HookName, JobArgs, JobDescriptor};

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up (possibly not before `scheduled_at`)
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Handler raised or no handler was registered
    Failed,
    /// Cancelled by user/system
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Statuses that still count as remaining work for a group.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];
}

/// A job scheduled onto the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub hook: HookName,
    pub group: GroupName,
    pub args: JobArgs,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Not executed before this instant (delayed jobs)
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Execution log, oldest first
    pub logs: Vec<String>,
}

impl Job {
    pub fn new(hook: HookName, args: JobArgs, group: GroupName, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            hook,
            group,
            args,
            status: JobStatus::Pending,
            created_at: now,
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            last_error: None,
            logs: Vec::new(),
        }
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(now);
        self.last_error = Some(error);
    }

    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            id: self.id,
            hook: self.hook.clone(),
            group: self.group.clone(),
            args: self.args.clone(),
        }
    }
}
