//! Periodic retention sweep, run as a self-rescheduling `chunkflow/cleanup` job.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use chunkflow_core::{GroupName, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, JobDescriptor, Phase};

use crate::chunks::{ChunkStore, RetentionPolicy};
use crate::config::EngineConfig;
use crate::runtime::{HookRegistry, JobRuntime};

const MAINTENANCE_SYNC: &str = "chunkflow";
const MAINTENANCE_GROUP: &str = "chunkflow_maintenance";

pub struct RetentionSweeper {
    chunks: ChunkStore,
    runtime: Arc<dyn JobRuntime>,
    policy: RetentionPolicy,
    interval: Duration,
    hook: HookName,
    group: GroupName,
}

impl RetentionSweeper {
    pub fn new(
        chunks: ChunkStore,
        runtime: Arc<dyn JobRuntime>,
        policy: RetentionPolicy,
        interval: Duration,
    ) -> SyncResult<Self> {
        Ok(Self {
            chunks,
            runtime,
            policy,
            interval,
            hook: HookName::new(SyncName::new(MAINTENANCE_SYNC)?, Phase::Cleanup),
            group: GroupName::new(MAINTENANCE_GROUP)?,
        })
    }

    pub fn from_config(chunks: ChunkStore, runtime: Arc<dyn JobRuntime>, config: &EngineConfig) -> SyncResult<Self> {
        Self::new(chunks, runtime, config.retention(), config.retention_interval)
    }

    pub fn hook(&self) -> &HookName {
        &self.hook
    }

    /// Install the cleanup handler.
    pub fn register(self: &Arc<Self>, registry: &mut HookRegistry) {
        let this = self.clone();
        registry.register(self.hook.clone(), move |_job: &JobDescriptor| this.run_sweep().map(|_| ()));
    }

    /// Queue the first sweep. Later sweeps schedule themselves.
    pub fn schedule_first(&self) -> SyncResult<()> {
        self.runtime
            .schedule(self.hook.clone(), JobArgs::empty(), self.group.clone())?;
        Ok(())
    }

    /// Delete expired chunks, then queue the next sweep one interval from now.
    /// Returns how many chunks were deleted.
    pub fn run_sweep(&self) -> SyncResult<usize> {
        let deleted = self.chunks.sweep(&self.policy)?;
        let at = self.chunks.clock().now() + chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::MAX);
        self.runtime
            .schedule_delayed(at, self.hook.clone(), JobArgs::empty(), self.group.clone())?;
        info!(deleted, next_sweep = %at, "retention sweep scheduled");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryChunkPersistence;
    use crate::runtime::{InMemoryJobRuntime, JobExecutor};
    use chunkflow_core::{ChunkPayload, ChunkStatus, Clock, JobId, ManualClock};
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(86_400);

    struct Fixture {
        chunks: ChunkStore,
        runtime: Arc<InMemoryJobRuntime>,
        clock: Arc<ManualClock>,
        sweeper: Arc<RetentionSweeper>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let chunks = ChunkStore::new(InMemoryChunkPersistence::arc(), clock.clone());
        let runtime = InMemoryJobRuntime::arc(clock.clone());
        let sweeper = Arc::new(
            RetentionSweeper::from_config(chunks.clone(), runtime.clone(), &EngineConfig::default()).unwrap(),
        );
        Fixture {
            chunks,
            runtime,
            clock,
            sweeper,
        }
    }

    fn finished_chunk(chunks: &ChunkStore) -> chunkflow_core::ChunkId {
        let chunk = chunks
            .create(
                &SyncName::new("orders").unwrap(),
                &GroupName::new("orders_1").unwrap(),
                ChunkPayload::encode(&[json!({"n": 1})]).unwrap(),
            )
            .unwrap();
        chunks.mark_started(chunk.id, JobId::new()).unwrap();
        chunks.mark_running(chunk.id).unwrap();
        chunks.mark_finished(chunk.id).unwrap();
        chunk.id
    }

    #[test]
    fn sweep_deletes_old_chunks_and_reschedules() {
        let f = fixture();
        let old = finished_chunk(&f.chunks);
        f.clock.advance(10 * DAY);
        let recent = finished_chunk(&f.chunks);
        f.clock.advance(5 * DAY);

        assert_eq!(f.sweeper.run_sweep().unwrap(), 1);
        assert!(f.chunks.get(old).is_err());
        assert_eq!(f.chunks.get(recent).unwrap().status, ChunkStatus::Finished);

        let jobs = f.runtime.jobs_for(f.sweeper.hook());
        assert_eq!(jobs.len(), 1);
        let expected = f.clock.now() + chrono::Duration::days(1);
        assert_eq!(jobs[0].scheduled_at, Some(expected));
    }

    #[test]
    fn cleanup_job_runs_through_the_executor() {
        let f = fixture();
        finished_chunk(&f.chunks);
        f.clock.advance(15 * DAY);

        let mut registry = HookRegistry::new();
        f.sweeper.register(&mut registry);
        let executor = JobExecutor::new(f.runtime.clone(), registry);

        f.sweeper.schedule_first().unwrap();
        assert_eq!(executor.run_until_idle(10).unwrap().len(), 1);
        assert!(f.chunks.list_group(&GroupName::new("orders_1").unwrap()).unwrap().is_empty());

        // The follow-up sweep waits for the interval.
        f.clock.advance(DAY);
        assert_eq!(executor.run_until_idle(10).unwrap().len(), 1);
        assert_eq!(f.runtime.jobs_for(f.sweeper.hook()).len(), 3);
    }
}
