//! Chunk store: durable chunk CRUD plus the status state machine.
//!
//! Every transition reads the latest persisted row, validates the step with
//! [`Chunk::apply`] and writes it back as one compare-and-set update keyed by
//! chunk id. Nothing is cached between calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use chunkflow_core::{
    Chunk, ChunkId, ChunkPayload, ChunkStatus, Clock, GroupName, JobId, SyncError, SyncName,
    SyncResult, Transition,
};

use crate::persistence::{ChunkFilter, ChunkPatch, ChunkPersistence, NewChunk, PersistenceError};
use crate::runtime::JobRuntime;

/// Which chunks a retention sweep removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: chrono::Duration,
    /// Restrict the sweep to these statuses; empty means any status.
    pub statuses: Vec<ChunkStatus>,
}

impl RetentionPolicy {
    pub fn days(days: i64) -> Self {
        Self {
            max_age: chrono::Duration::days(days),
            statuses: Vec::new(),
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ChunkStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::days(14)
    }
}

#[derive(Clone)]
pub struct ChunkStore {
    persistence: Arc<dyn ChunkPersistence>,
    clock: Arc<dyn Clock>,
}

impl ChunkStore {
    pub fn new(persistence: Arc<dyn ChunkPersistence>, clock: Arc<dyn Clock>) -> Self {
        Self { persistence, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persist a new `Scheduled` chunk.
    pub fn create(&self, name: &SyncName, group: &GroupName, payload: ChunkPayload) -> SyncResult<Chunk> {
        let id = self.persistence.insert(NewChunk {
            name: name.clone(),
            group: group.clone(),
            payload: payload.clone(),
        })?;
        debug!(chunk_id = %id, group = %group, records = payload.len(), "chunk persisted");
        Ok(Chunk::scheduled(id, name.clone(), group.clone(), payload))
    }

    /// Latest persisted state of a chunk.
    pub fn get(&self, id: ChunkId) -> SyncResult<Chunk> {
        self.persistence
            .get_by_id(id)?
            .ok_or(SyncError::ChunkNotFound(id))
    }

    pub fn mark_started(&self, id: ChunkId, job_id: JobId) -> SyncResult<Chunk> {
        self.transition(id, |at| Transition::Start { job_id, at })
    }

    pub fn mark_running(&self, id: ChunkId) -> SyncResult<Chunk> {
        self.transition(id, |_| Transition::Run)
    }

    pub fn mark_finished(&self, id: ChunkId) -> SyncResult<Chunk> {
        self.transition(id, |at| Transition::Finish { at })
    }

    pub fn mark_failed(&self, id: ChunkId) -> SyncResult<Chunk> {
        self.transition(id, |at| Transition::Fail { at })
    }

    /// All chunks of one run, in creation order.
    pub fn list_group(&self, group: &GroupName) -> SyncResult<Vec<Chunk>> {
        Ok(self.persistence.query(&ChunkFilter::group(group.clone()))?)
    }

    /// Delete chunks older than the policy window. Returns how many were removed.
    pub fn sweep(&self, policy: &RetentionPolicy) -> SyncResult<usize> {
        let cutoff = self.clock.now() - policy.max_age;
        let filter = ChunkFilter {
            statuses: policy.statuses.clone(),
            reference_before: Some(cutoff),
            ..ChunkFilter::default()
        };
        let deleted = self.persistence.delete(&filter)?;
        info!(deleted, cutoff = %cutoff, "retention sweep finished");
        Ok(deleted)
    }

    /// Execution log of the chunk's job, read from the runtime on demand.
    pub fn logs(&self, id: ChunkId, runtime: &dyn JobRuntime) -> SyncResult<Vec<String>> {
        match self.get(id)?.job_id {
            Some(job_id) => Ok(runtime.job_logs(job_id)?),
            None => Ok(Vec::new()),
        }
    }

    fn transition(&self, id: ChunkId, step: impl Fn(chrono::DateTime<chrono::Utc>) -> Transition) -> SyncResult<Chunk> {
        // One retry covers a concurrent writer moving the row between our read
        // and write; the second attempt re-validates against the fresh row.
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut chunk = self.get(id)?;
            let expected = chunk.status;
            chunk.apply(step(self.clock.now()))?;

            match self.persistence.update(id, &ChunkPatch::from_chunk(expected, &chunk)) {
                Ok(()) => {
                    debug!(chunk_id = %id, from = %expected, to = %chunk.status, "chunk transitioned");
                    return Ok(chunk);
                }
                Err(PersistenceError::Conflict { .. }) if attempts < 2 => {
                    warn!(chunk_id = %id, "chunk changed concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryChunkPersistence;
    use crate::runtime::InMemoryJobRuntime;
    use chunkflow_core::ManualClock;
    use chunkflow_events::{HookName, JobArgs, Phase};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (ChunkStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = ChunkStore::new(InMemoryChunkPersistence::arc(), clock.clone());
        (store, clock)
    }

    fn names() -> (SyncName, GroupName) {
        (SyncName::new("products").unwrap(), GroupName::new("products_1").unwrap())
    }

    fn payload() -> ChunkPayload {
        ChunkPayload::encode(&[json!({"sku": "a"}), json!({"sku": "b"})]).unwrap()
    }

    #[test]
    fn full_lifecycle_is_persisted() {
        let (store, clock) = setup();
        let (name, group) = names();
        let chunk = store.create(&name, &group, payload()).unwrap();
        let job_id = JobId::new();

        store.mark_started(chunk.id, job_id).unwrap();
        store.mark_running(chunk.id).unwrap();
        clock.advance(Duration::from_millis(1500));
        store.mark_finished(chunk.id).unwrap();

        let stored = store.get(chunk.id).unwrap();
        assert_eq!(stored.status, ChunkStatus::Finished);
        assert_eq!(stored.job_id, Some(job_id));
        assert_eq!(stored.duration_secs(), Some(1.5));
        assert_eq!(stored.payload, payload());
    }

    #[test]
    fn invalid_transition_leaves_row_untouched() {
        let (store, _) = setup();
        let (name, group) = names();
        let chunk = store.create(&name, &group, payload()).unwrap();

        let err = store.mark_finished(chunk.id).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert_eq!(store.get(chunk.id).unwrap().status, ChunkStatus::Scheduled);
    }

    #[test]
    fn missing_chunk_is_reported() {
        let (store, _) = setup();
        assert_eq!(
            store.get(ChunkId::new(99)).unwrap_err(),
            SyncError::ChunkNotFound(ChunkId::new(99))
        );
    }

    #[test]
    fn sweep_removes_only_old_chunks() {
        let (store, clock) = setup();
        let (name, group) = names();
        let old = store.create(&name, &group, payload()).unwrap();
        store.mark_started(old.id, JobId::new()).unwrap();
        store.mark_failed(old.id).unwrap();

        clock.advance(Duration::from_secs(15 * 24 * 3600));
        let fresh = store.create(&name, &group, payload()).unwrap();
        store.mark_started(fresh.id, JobId::new()).unwrap();
        let never_started = store.create(&name, &group, payload()).unwrap();

        assert_eq!(store.sweep(&RetentionPolicy::default()).unwrap(), 1);
        let remaining: Vec<ChunkId> = store.list_group(&group).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(remaining, vec![fresh.id, never_started.id]);
    }

    #[test]
    fn sweep_honours_status_filter() {
        let (store, clock) = setup();
        let (name, group) = names();
        let chunk = store.create(&name, &group, payload()).unwrap();
        store.mark_started(chunk.id, JobId::new()).unwrap();
        store.mark_failed(chunk.id).unwrap();
        clock.advance(Duration::from_secs(30 * 24 * 3600));

        let finished_only = RetentionPolicy::default().with_statuses([ChunkStatus::Finished]);
        assert_eq!(store.sweep(&finished_only).unwrap(), 0);
        assert_eq!(store.list_group(&group).unwrap().len(), 1);
    }

    #[test]
    fn logs_come_from_the_runtime() {
        let (store, _) = setup();
        let (name, group) = names();
        let runtime = InMemoryJobRuntime::new(store.clock().clone());
        let chunk = store.create(&name, &group, payload()).unwrap();
        assert!(store.logs(chunk.id, &runtime).unwrap().is_empty());

        let job_id = runtime
            .schedule(
                HookName::new(name.clone(), Phase::ProcessChunk),
                JobArgs::for_chunk(chunk.id),
                group.clone(),
            )
            .unwrap();
        runtime.append_log(job_id, "imported 2 products").unwrap();
        store.mark_started(chunk.id, job_id).unwrap();

        assert_eq!(store.logs(chunk.id, &runtime).unwrap(), vec!["imported 2 products".to_string()]);
    }
}
