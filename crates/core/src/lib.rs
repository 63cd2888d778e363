//! `chunkflow-core`: domain building blocks for chunked job orchestration.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the chunk entity and its status state machine, the payload
//! codec, the shared-state merge policy and an injectable clock.

pub mod chunk;
pub mod clock;
pub mod error;
pub mod id;
pub mod merge;
pub mod payload;

pub use chunk::{Chunk, ChunkStatus, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SyncError, SyncResult};
pub use id::{ChunkId, GroupName, JobId, SyncName};
pub use merge::{MergeOptions, merge_values};
pub use payload::{ChunkPayload, Record, RecordStream};
