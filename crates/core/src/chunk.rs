//! Chunk entity and its status state machine.
//!
//! ```text
//! Scheduled --start--> Started --run--> Running --finish--> Finished
//!                         |                 |
//!                         +------fail-------+--> Failed
//! ```
//!
//! `Finished` and `Failed` are terminal. Status, timestamps and `job_id` change
//! only through [`Chunk::apply`]; the payload never changes after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::id::{ChunkId, GroupName, JobId, SyncName};
use crate::payload::ChunkPayload;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Scheduled,
    Started,
    Running,
    Finished,
    Failed,
}

impl ChunkStatus {
    pub const ALL: [ChunkStatus; 5] = [
        ChunkStatus::Scheduled,
        ChunkStatus::Started,
        ChunkStatus::Running,
        ChunkStatus::Finished,
        ChunkStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Finished | ChunkStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Scheduled, Started)
                | (Started, Running)
                | (Running, Finished)
                | (Started, Failed)
                | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Scheduled => "scheduled",
            ChunkStatus::Started => "started",
            ChunkStatus::Running => "running",
            ChunkStatus::Finished => "finished",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ChunkStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChunkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SyncError::validation(format!("unknown chunk status '{s}'")))
    }
}

/// A lifecycle step applied to a chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The runtime began executing the chunk's job.
    Start { job_id: JobId, at: DateTime<Utc> },
    /// The handler began consuming the payload.
    Run,
    /// The handler returned normally.
    Finish { at: DateTime<Utc> },
    /// The handler raised or the runtime reported a failure.
    Fail { at: DateTime<Utc> },
}

impl Transition {
    pub fn target(&self) -> ChunkStatus {
        match self {
            Transition::Start { .. } => ChunkStatus::Started,
            Transition::Run => ChunkStatus::Running,
            Transition::Finish { .. } => ChunkStatus::Finished,
            Transition::Fail { .. } => ChunkStatus::Failed,
        }
    }
}

/// One persisted, independently schedulable unit of a run's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Owning sync definition.
    pub name: SyncName,
    pub group: GroupName,
    pub status: ChunkStatus,
    pub payload: ChunkPayload,
    pub job_id: Option<JobId>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Chunk {
    /// A freshly persisted chunk, waiting for its job to start.
    pub fn scheduled(id: ChunkId, name: SyncName, group: GroupName, payload: ChunkPayload) -> Self {
        Self {
            id,
            name,
            group,
            status: ChunkStatus::Scheduled,
            payload,
            job_id: None,
            start: None,
            end: None,
        }
    }

    /// Apply a lifecycle step, enforcing the state machine.
    ///
    /// An `end` earlier than `start` (clock skew between workers) is clamped to
    /// `start` so that `end >= start` always holds.
    pub fn apply(&mut self, transition: Transition) -> SyncResult<()> {
        let next = transition.target();
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                chunk_id: self.id,
                from: self.status,
                to: next,
            });
        }

        match transition {
            Transition::Start { job_id, at } => {
                self.job_id = Some(job_id);
                self.start = Some(at);
            }
            Transition::Run => {}
            Transition::Finish { at } | Transition::Fail { at } => {
                let at = match self.start {
                    Some(start) if at < start => start,
                    _ => at,
                };
                self.end = Some(at);
            }
        }
        self.status = next;
        Ok(())
    }

    /// `end - start`, or `None` while either timestamp is missing.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Duration in seconds with microsecond precision.
    pub fn duration_secs(&self) -> Option<f64> {
        self.duration()
            .and_then(|d| d.num_microseconds())
            .map(|micros| micros as f64 / 1_000_000.0)
    }
}
