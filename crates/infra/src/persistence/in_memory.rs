use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chunkflow_core::{Chunk, ChunkId};

use super::{ChunkFilter, ChunkPatch, ChunkPersistence, NewChunk, PersistenceError};

/// In-memory chunk table for tests/dev.
#[derive(Debug)]
pub struct InMemoryChunkPersistence {
    rows: RwLock<BTreeMap<ChunkId, Chunk>>,
    next_id: AtomicU64,
}

impl InMemoryChunkPersistence {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryChunkPersistence {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> PersistenceError {
    PersistenceError::Storage("chunk table lock poisoned".to_string())
}

impl ChunkPersistence for InMemoryChunkPersistence {
    fn insert(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let id = ChunkId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        rows.insert(id, Chunk::scheduled(id, chunk.name, chunk.group, chunk.payload));
        Ok(id)
    }

    fn update(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let row = rows.get_mut(&id).ok_or(PersistenceError::NotFound(id))?;
        if row.status != patch.expected {
            return Err(PersistenceError::Conflict {
                id,
                expected: patch.expected,
            });
        }
        row.status = patch.status;
        row.job_id = patch.job_id;
        row.start = patch.start;
        row.end = patch.end;
        Ok(())
    }

    fn get_by_id(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&id).cloned())
    }

    fn query(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let matching = rows.values().filter(|chunk| filter.matches(chunk)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn delete(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let mut doomed: Vec<ChunkId> = rows
            .values()
            .filter(|chunk| filter.matches(chunk))
            .map(|chunk| chunk.id)
            .collect();
        if let Some(limit) = filter.limit {
            doomed.truncate(limit);
        }
        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed.len())
    }
}
