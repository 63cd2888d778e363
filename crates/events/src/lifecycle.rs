//! Job lifecycle notifications.
//!
//! A runtime emits `BeforeExecute` when a worker picks a job up, then exactly
//! one of `Completed` or `Failed`. Delivery is at-least-once: a redelivered job
//! produces the same events again, so listeners must be idempotent.

use serde::{Deserialize, Serialize};

use chunkflow_core::{JobId, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    BeforeExecute { job_id: JobId },
    Completed { job_id: JobId },
    Failed { job_id: JobId, error: String },
}

impl LifecycleEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            LifecycleEvent::BeforeExecute { job_id }
            | LifecycleEvent::Completed { job_id }
            | LifecycleEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Subscriber to runtime lifecycle events.
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), SyncError>;
}

impl<L> LifecycleListener for std::sync::Arc<L>
where
    L: LifecycleListener + ?Sized,
{
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), SyncError> {
        (**self).on_event(event)
    }
}
