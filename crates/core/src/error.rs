//! Engine error model.

use thiserror::Error;

use crate::chunk::ChunkStatus;
use crate::id::ChunkId;

/// Result type used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine-level error.
///
/// Failures local to one chunk (`ChunkHandlerFailure`) are recorded on that
/// chunk and never abort its siblings. Orchestration-level failures
/// (`SchedulingFailure`, `LockTimeout`, `EmptyFetch`) are fatal to the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Input source is missing or unreadable.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Persisting a chunk or enqueueing its job failed.
    #[error("scheduling failed: {0}")]
    SchedulingFailure(String),

    /// A shared-state lock is currently held by another execution context.
    #[error("shared state key '{0}' is locked")]
    Locked(String),

    /// Lock acquisition kept failing until the retry budget ran out.
    #[error("timed out acquiring lock for '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// The consumer's chunk handler raised.
    #[error("chunk {chunk_id} handler failed: {message}")]
    ChunkHandlerFailure { chunk_id: ChunkId, message: String },

    /// A paginated fetch returned no records.
    #[error("fetch returned no data for cursor {0}")]
    EmptyFetch(String),

    /// A chunk status change not allowed by the state machine.
    #[error("invalid chunk transition for {chunk_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        chunk_id: ChunkId,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// A sequential run was started while another one is still in progress.
    #[error("sequence '{0}' is already running")]
    AlreadyRunning(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::SchedulingFailure(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether this error ends the whole run rather than a single chunk.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::SchedulingFailure(_)
                | Self::LockTimeout { .. }
                | Self::EmptyFetch(_)
                | Self::SourceUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_failures_are_not_fatal_to_the_run() {
        let err = SyncError::ChunkHandlerFailure {
            chunk_id: ChunkId::new(7),
            message: "boom".into(),
        };
        assert!(!err.is_fatal_to_run());
        assert!(SyncError::EmptyFetch("page 3".into()).is_fatal_to_run());
        assert!(
            SyncError::LockTimeout {
                key: "k".into(),
                attempts: 5
            }
            .is_fatal_to_run()
        );
    }
}
