//! Infrastructure layer: stores, job runtime, coordination and orchestration.

pub mod chunks;
pub mod config;
pub mod pagination;
pub mod persistence;
pub mod retention;
pub mod retry;
pub mod runtime;
pub mod sequential;
pub mod shared_state;
pub mod splitter;
pub mod stats;
pub mod sync;
pub mod tracker;


pub use chunks::{ChunkStore, RetentionPolicy};
pub use config::{EngineConfig, Stores};
pub use pagination::{Cursor, Next, Page, PageFetcher, PaginationAccumulator, PaginationConfig};
pub use retention::RetentionSweeper;
pub use runtime::{HookRegistry, InMemoryJobRuntime, JobExecutor, JobExecutorConfig, JobQueue, JobRuntime};
pub use sequential::SequentialOrchestrator;
pub use shared_state::{LockToken, SharedStateConfig, SharedStateStore};
pub use splitter::{ChunkSizing, ChunkSplitter, SplitReport};
pub use stats::{GroupStats, StatsAggregator};
pub use sync::{ChunkContext, SyncContext, SyncDefinition, SyncEngine};
pub use tracker::LifecycleTracker;
