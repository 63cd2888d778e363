//! Persistence store contract for chunk rows.
//!
//! One row per chunk: `id, job_id, name, group, status, payload, start, end`.
//! The store assigns ids on insert. Updates are compare-and-set on the current
//! status, which makes every state-machine transition a single atomic write
//! keyed by chunk id.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryChunkPersistence;
pub use postgres::PostgresChunkPersistence;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use chunkflow_core::{Chunk, ChunkId, ChunkPayload, ChunkStatus, GroupName, JobId, SyncError, SyncName};

/// A chunk about to be inserted; it always starts out `Scheduled`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub name: SyncName,
    pub group: GroupName,
    pub payload: ChunkPayload,
}

/// Fields written by one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPatch {
    /// Status the row must currently have for the write to apply.
    pub expected: ChunkStatus,
    pub status: ChunkStatus,
    pub job_id: Option<JobId>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ChunkPatch {
    /// Patch that moves a row from `expected` to the state of `updated`.
    pub fn from_chunk(expected: ChunkStatus, updated: &Chunk) -> Self {
        Self {
            expected,
            status: updated.status,
            job_id: updated.job_id,
            start: updated.start,
            end: updated.end,
        }
    }
}

/// Row filter for queries and deletes. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFilter {
    pub name: Option<SyncName>,
    pub group: Option<GroupName>,
    pub statuses: Vec<ChunkStatus>,
    /// Only rows whose `end` (or `start` when not ended) is older than this.
    /// Rows that never started never match.
    pub reference_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ChunkFilter {
    pub fn group(group: GroupName) -> Self {
        Self {
            group: Some(group),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ChunkStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if self.name.as_ref().is_some_and(|name| *name != chunk.name) {
            return false;
        }
        if self.group.as_ref().is_some_and(|group| *group != chunk.group) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&chunk.status) {
            return false;
        }
        if let Some(cutoff) = self.reference_before {
            match chunk.end.or(chunk.start) {
                Some(reference) if reference < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("chunk not found: {0}")]
    NotFound(ChunkId),
    #[error("chunk {id} is no longer {expected}")]
    Conflict { id: ChunkId, expected: ChunkStatus },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<PersistenceError> for SyncError {
    fn from(value: PersistenceError) -> Self {
        match value {
            PersistenceError::NotFound(id) => SyncError::ChunkNotFound(id),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

/// CRUD contract of the durable chunk store.
pub trait ChunkPersistence: Send + Sync {
    /// Insert a new `Scheduled` row and return its assigned id.
    fn insert(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError>;

    /// Apply a transition patch if the row still has `patch.expected` status.
    fn update(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError>;

    fn get_by_id(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError>;

    /// Matching rows in ascending id order.
    fn query(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError>;

    /// Delete matching rows, returning how many were removed.
    fn delete(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError>;
}

impl<P> ChunkPersistence for Arc<P>
where
    P: ChunkPersistence + ?Sized,
{
    fn insert(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError> {
        (**self).insert(chunk)
    }

    fn update(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError> {
        (**self).update(id, patch)
    }

    fn get_by_id(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError> {
        (**self).get_by_id(id)
    }

    fn query(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError> {
        (**self).query(filter)
    }

    fn delete(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError> {
        (**self).delete(filter)
    }
}
