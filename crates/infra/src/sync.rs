//! Sync definitions and the engine that wires them onto the job runtime.
//!
//! Registering a definition installs three hooks and one lifecycle tracker:
//!
//! - `<sync>/schedule`: entry job of a run; the definition reads its source and
//!   splits it through [`SyncContext::split`]
//! - `<sync>/process_chunk`: marks the chunk `Running`, streams its payload to
//!   the definition and wraps handler errors as `ChunkHandlerFailure`
//! - `<sync>/complete`: runs `after_complete` once per group, guarded by a
//!   `<group>_complete` trylock so duplicate completion jobs are no-ops

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use chunkflow_core::{Chunk, ChunkId, GroupName, Record, RecordStream, SyncError, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, JobDescriptor, LifecycleListener, Phase};

use crate::chunks::ChunkStore;
use crate::runtime::{HookRegistry, JobRuntime};
use crate::shared_state::SharedStateStore;
use crate::splitter::{ChunkSizing, ChunkSplitter, SplitReport};
use crate::tracker::LifecycleTracker;

/// One logical "split data X into chunks and process it" definition.
pub trait SyncDefinition: Send + Sync {
    /// Deterministic name, stable across runs.
    fn name(&self) -> SyncName;

    fn chunk_size(&self) -> usize;

    /// Maximum chunks per split; `0` means unlimited.
    fn chunk_limit(&self) -> usize {
        0
    }

    /// Entry job of a run. Typically reads the source and calls `ctx.split`.
    fn schedule(&self, _ctx: &SyncContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one chunk. The stream is finite, in arrival order, and can be
    /// consumed once.
    fn process_chunk(&self, records: &mut RecordStream<'_>, ctx: &ChunkContext<'_>) -> anyhow::Result<()>;

    /// Called with the failed job and the original error.
    fn on_fail(&self, _job: &JobDescriptor, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after every job of a group has finished.
    fn after_complete(&self, _ctx: &SyncContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a definition sees while running a schedule or completion job.
pub struct SyncContext {
    sync: SyncName,
    group: GroupName,
    sizing: ChunkSizing,
    splitter: ChunkSplitter,
    shared_state: Arc<SharedStateStore>,
    chunks: ChunkStore,
}

impl SyncContext {
    pub fn sync(&self) -> &SyncName {
        &self.sync
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    pub fn shared_state(&self) -> &SharedStateStore {
        &self.shared_state
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn split<I>(&self, records: I) -> SyncResult<SplitReport>
    where
        I: IntoIterator<Item = Record>,
    {
        self.splitter.split(&self.sync, &self.group, records, self.sizing)
    }

    /// Split, then release the temporary source once every chunk is scheduled.
    pub fn split_with_cleanup<I, C>(&self, records: I, release_source: C) -> SyncResult<SplitReport>
    where
        I: IntoIterator<Item = Record>,
        C: FnOnce() -> SyncResult<()>,
    {
        self.splitter
            .split_with_cleanup(&self.sync, &self.group, records, self.sizing, release_source)
    }
}

/// What a definition sees while processing one chunk.
pub struct ChunkContext<'a> {
    pub chunk: &'a Chunk,
    pub job: &'a JobDescriptor,
    shared_state: &'a SharedStateStore,
    runtime: &'a dyn JobRuntime,
}

impl ChunkContext<'_> {
    pub fn shared_state(&self) -> &SharedStateStore {
        self.shared_state
    }

    /// Append a line to the job's execution log.
    pub fn log(&self, message: &str) -> SyncResult<()> {
        Ok(self.runtime.append_log(self.job.id, message)?)
    }
}

/// Keep a `SyncError` raised inside a handler, wrap anything else.
fn into_sync_error(err: anyhow::Error, wrap: impl FnOnce(String) -> SyncError) -> SyncError {
    match err.downcast::<SyncError>() {
        Ok(err) => err,
        Err(err) => wrap(format!("{err:#}")),
    }
}

#[derive(Clone)]
struct Registered {
    definition: Arc<dyn SyncDefinition>,
    sizing: ChunkSizing,
}

pub struct SyncEngine {
    chunks: ChunkStore,
    runtime: Arc<dyn JobRuntime>,
    shared_state: Arc<SharedStateStore>,
    splitter: ChunkSplitter,
    syncs: HashMap<SyncName, Registered>,
    trackers: Vec<Arc<LifecycleTracker>>,
}

impl SyncEngine {
    pub fn new(chunks: ChunkStore, runtime: Arc<dyn JobRuntime>, shared_state: Arc<SharedStateStore>) -> Self {
        Self {
            splitter: ChunkSplitter::new(chunks.clone(), runtime.clone()),
            chunks,
            runtime,
            shared_state,
            syncs: HashMap::new(),
            trackers: Vec::new(),
        }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn splitter(&self) -> &ChunkSplitter {
        &self.splitter
    }

    pub fn runtime(&self) -> &Arc<dyn JobRuntime> {
        &self.runtime
    }

    pub fn shared_state(&self) -> &Arc<SharedStateStore> {
        &self.shared_state
    }

    /// Lifecycle listeners to subscribe on the executor, one per sync.
    pub fn listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.trackers
            .iter()
            .map(|tracker| tracker.clone() as Arc<dyn LifecycleListener>)
            .collect()
    }

    /// Install the hooks of `definition` and create its tracker.
    pub fn register(
        &mut self,
        registry: &mut HookRegistry,
        definition: Arc<dyn SyncDefinition>,
    ) -> SyncResult<Arc<LifecycleTracker>> {
        let sync = definition.name();
        if self.syncs.contains_key(&sync) {
            return Err(SyncError::validation(format!("sync '{sync}' is already registered")));
        }
        let sizing = ChunkSizing::new(definition.chunk_size()).with_limit(definition.chunk_limit());
        if sizing.size == 0 {
            return Err(SyncError::validation(format!("sync '{sync}' has a chunk size of 0")));
        }
        let registered = Registered {
            definition: definition.clone(),
            sizing,
        };

        registry.register(HookName::new(sync.clone(), Phase::Schedule), {
            let registered = registered.clone();
            let ctx = self.context_factory(sync.clone());
            move |job: &JobDescriptor| {
                let ctx = ctx(job.group.clone(), registered.sizing);
                registered
                    .definition
                    .schedule(&ctx)
                    .map_err(|e| into_sync_error(e, SyncError::SourceUnavailable))
            }
        });

        registry.register(HookName::new(sync.clone(), Phase::ProcessChunk), {
            let definition = definition.clone();
            let chunks = self.chunks.clone();
            let shared_state = self.shared_state.clone();
            let runtime = self.runtime.clone();
            move |job: &JobDescriptor| {
                let chunk_id = job
                    .args
                    .chunk_id()
                    .ok_or_else(|| SyncError::validation(format!("job {} carries no chunk id", job.id)))?;
                process_chunk(definition.as_ref(), &chunks, &shared_state, runtime.as_ref(), job, chunk_id)
            }
        });

        registry.register(HookName::new(sync.clone(), Phase::Complete), {
            let registered = registered.clone();
            let ctx = self.context_factory(sync.clone());
            let shared_state = self.shared_state.clone();
            move |job: &JobDescriptor| {
                let marker = format!("{}_complete", job.group);
                let ttl = shared_state.config().default_ttl;
                match shared_state.acquire(&marker, ttl) {
                    Ok(_) => {}
                    Err(SyncError::Locked(_)) => {
                        debug!(group = %job.group, "completion already handled");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                let ctx = ctx(job.group.clone(), registered.sizing);
                registered
                    .definition
                    .after_complete(&ctx)
                    .map_err(|e| into_sync_error(e, SyncError::Storage))
            }
        });

        let on_fail = definition.clone();
        let tracker = Arc::new(
            LifecycleTracker::new(sync.clone(), self.chunks.clone(), self.runtime.clone()).with_failure_handler(
                Arc::new(move |job: &JobDescriptor, error: &str| {
                    on_fail
                        .on_fail(job, error)
                        .map_err(|e| into_sync_error(e, SyncError::Storage))
                }),
            ),
        );
        self.trackers.push(tracker.clone());
        self.syncs.insert(sync.clone(), registered);
        info!(sync = %sync, chunk_size = sizing.size, chunk_limit = sizing.limit, "sync registered");
        Ok(tracker)
    }

    /// Start a new run: schedule `<sync>/schedule` under a fresh group.
    pub fn trigger(&self, sync: &SyncName) -> SyncResult<GroupName> {
        if !self.syncs.contains_key(sync) {
            return Err(SyncError::validation(format!("sync '{sync}' is not registered")));
        }
        let group = GroupName::for_run(sync, self.chunks.clock().now());
        self.runtime
            .schedule(HookName::new(sync.clone(), Phase::Schedule), JobArgs::empty(), group.clone())?;
        info!(sync = %sync, group = %group, "run triggered");
        Ok(group)
    }

    /// Split `records` into chunks of the registered sync under `group`.
    pub fn split<I>(&self, sync: &SyncName, group: &GroupName, records: I) -> SyncResult<SplitReport>
    where
        I: IntoIterator<Item = Record>,
    {
        let registered = self
            .syncs
            .get(sync)
            .ok_or_else(|| SyncError::validation(format!("sync '{sync}' is not registered")))?;
        self.splitter.split(sync, group, records, registered.sizing)
    }

    fn context_factory(&self, sync: SyncName) -> impl Fn(GroupName, ChunkSizing) -> SyncContext + Send + Sync + 'static {
        let splitter = self.splitter.clone();
        let shared_state = self.shared_state.clone();
        let chunks = self.chunks.clone();
        move |group, sizing| SyncContext {
            sync: sync.clone(),
            group,
            sizing,
            splitter: splitter.clone(),
            shared_state: shared_state.clone(),
            chunks: chunks.clone(),
        }
    }
}

fn process_chunk(
    definition: &dyn SyncDefinition,
    chunks: &ChunkStore,
    shared_state: &SharedStateStore,
    runtime: &dyn JobRuntime,
    job: &JobDescriptor,
    chunk_id: ChunkId,
) -> SyncResult<()> {
    let chunk = chunks.mark_running(chunk_id)?;
    let ctx = ChunkContext {
        chunk: &chunk,
        job,
        shared_state,
        runtime,
    };
    let mut records = chunk.payload.records();
    definition
        .process_chunk(&mut records, &ctx)
        .map_err(|e| SyncError::ChunkHandlerFailure {
            chunk_id,
            message: format!("{e:#}"),
        })?;
    debug!(chunk_id = %chunk_id, records = records.position(), "chunk processed");
    Ok(())
}
