use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chunkflow_core::{ChunkId, GroupName, JobId};

use crate::hook::HookName;

const CHUNK_ID_ARG: &str = "chunk_id";

/// Arguments attached to a scheduled job.
///
/// Chunk jobs carry only the chunk id; completion signals carry nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArgs(Map<String, Value>);

impl JobArgs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_chunk(chunk_id: ChunkId) -> Self {
        Self::empty().with(CHUNK_ID_ARG, Value::from(chunk_id.value()))
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Chunk referenced by a chunk job, if any.
    pub fn chunk_id(&self) -> Option<ChunkId> {
        self.0.get(CHUNK_ID_ARG).and_then(Value::as_u64).map(ChunkId::new)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the job runtime reports about one job (`fetchJob`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub hook: HookName,
    pub group: GroupName,
    pub args: JobArgs,
}
