//! Chunk splitter: records in, persisted chunks and one job per chunk out.
//!
//! Boundaries depend only on arrival order and the chunk size. Each chunk is
//! persisted before its job is scheduled, and a persistence failure aborts the
//! split before that chunk's schedule call.

use std::sync::Arc;

use tracing::{debug, info, warn};

use chunkflow_core::{ChunkId, ChunkPayload, GroupName, JobId, Record, SyncError, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, Phase};

use crate::chunks::ChunkStore;
use crate::runtime::JobRuntime;

/// How records are grouped into chunks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkSizing {
    /// Maximum records per chunk.
    pub size: usize,
    /// Maximum chunks per split call; `0` means unlimited.
    pub limit: usize,
}

impl ChunkSizing {
    pub fn new(size: usize) -> Self {
        Self { size, limit: 0 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn validate(&self) -> SyncResult<()> {
        if self.size == 0 {
            return Err(SyncError::validation("chunk size must be at least 1"));
        }
        Ok(())
    }
}

/// What one split call scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitReport {
    /// Persisted chunks, in scheduling order.
    pub chunk_ids: Vec<ChunkId>,
    pub job_ids: Vec<JobId>,
    /// Records that went into scheduled chunks.
    pub records: usize,
    /// Chunks dropped because the chunk limit was reached.
    pub skipped_chunks: usize,
    /// Whether the temporary source was released.
    pub source_released: bool,
    /// Chunks counted against the limit by earlier calls of the same run.
    pub earlier_chunks: usize,
}

impl SplitReport {
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }

    /// Start a report that continues a run which already counted `chunks`.
    pub fn continuing(chunks: usize) -> Self {
        Self {
            earlier_chunks: chunks,
            ..Self::default()
        }
    }

    /// Chunks counted against the limit so far, skipped ones included.
    pub fn seen(&self) -> usize {
        self.earlier_chunks + self.chunk_ids.len() + self.skipped_chunks
    }
}

#[derive(Clone)]
pub struct ChunkSplitter {
    chunks: ChunkStore,
    runtime: Arc<dyn JobRuntime>,
}

impl ChunkSplitter {
    pub fn new(chunks: ChunkStore, runtime: Arc<dyn JobRuntime>) -> Self {
        Self { chunks, runtime }
    }

    pub fn split<I>(&self, sync: &SyncName, group: &GroupName, records: I, sizing: ChunkSizing) -> SyncResult<SplitReport>
    where
        I: IntoIterator<Item = Record>,
    {
        self.split_with_cleanup(sync, group, records, sizing, || Ok(()))
    }

    /// Split, then call `release_source` exactly once after the last chunk is
    /// scheduled. It is not called when the split fails.
    pub fn split_with_cleanup<I, C>(
        &self,
        sync: &SyncName,
        group: &GroupName,
        records: I,
        sizing: ChunkSizing,
        release_source: C,
    ) -> SyncResult<SplitReport>
    where
        I: IntoIterator<Item = Record>,
        C: FnOnce() -> SyncResult<()>,
    {
        sizing.validate()?;
        let mut report = SplitReport::default();
        let mut buffer = Vec::with_capacity(sizing.size);

        for record in records {
            buffer.push(record);
            if buffer.len() == sizing.size {
                self.schedule_chunk(sync, group, &buffer, sizing, &mut report)?;
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            self.schedule_chunk(sync, group, &buffer, sizing, &mut report)?;
        }

        match release_source() {
            Ok(()) => report.source_released = true,
            Err(err) => warn!(sync = %sync, group = %group, error = %err, "failed to release split source"),
        }

        info!(
            sync = %sync,
            group = %group,
            chunks = report.chunk_count(),
            records = report.records,
            skipped = report.skipped_chunks,
            "split finished"
        );
        Ok(report)
    }

    /// Persist `records` as one chunk and schedule its job, honouring the
    /// chunk limit tracked in `report`.
    pub fn schedule_chunk(
        &self,
        sync: &SyncName,
        group: &GroupName,
        records: &[Record],
        sizing: ChunkSizing,
        report: &mut SplitReport,
    ) -> SyncResult<()> {
        if sizing.limit != 0 && report.seen() >= sizing.limit {
            report.skipped_chunks += 1;
            debug!(sync = %sync, group = %group, limit = sizing.limit, "chunk limit reached, skipping chunk");
            return Ok(());
        }

        let payload = ChunkPayload::encode(records)?;
        let chunk = self
            .chunks
            .create(sync, group, payload)
            .map_err(|e| SyncError::SchedulingFailure(format!("failed to persist chunk: {e}")))?;

        let job_id = self.runtime.schedule(
            HookName::new(sync.clone(), Phase::ProcessChunk),
            JobArgs::for_chunk(chunk.id),
            group.clone(),
        )?;

        report.chunk_ids.push(chunk.id);
        report.job_ids.push(job_id);
        report.records += records.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        ChunkFilter, ChunkPatch, ChunkPersistence, InMemoryChunkPersistence, NewChunk, PersistenceError,
    };
    use crate::runtime::InMemoryJobRuntime;
    use chunkflow_core::{Chunk, ChunkStatus, ManualClock};
    use proptest::prelude::*;
    use serde_json::json;
    use std::cell::Cell;

    struct Fixture {
        splitter: ChunkSplitter,
        chunks: ChunkStore,
        runtime: Arc<InMemoryJobRuntime>,
    }

    fn fixture_with(persistence: Arc<dyn ChunkPersistence>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let chunks = ChunkStore::new(persistence, clock.clone());
        let runtime = InMemoryJobRuntime::arc(clock);
        Fixture {
            splitter: ChunkSplitter::new(chunks.clone(), runtime.clone()),
            chunks,
            runtime,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(InMemoryChunkPersistence::arc())
    }

    fn names() -> (SyncName, GroupName) {
        (SyncName::new("products").unwrap(), GroupName::new("products_1").unwrap())
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| json!({"row": i})).collect()
    }

    #[test]
    fn twenty_three_records_make_three_chunks() {
        let f = fixture();
        let (sync, group) = names();

        let report = f.splitter.split(&sync, &group, records(23), ChunkSizing::new(10)).unwrap();

        assert_eq!(report.chunk_count(), 3);
        assert_eq!(report.records, 23);
        let sizes: Vec<usize> = report
            .chunk_ids
            .iter()
            .map(|id| f.chunks.get(*id).unwrap().payload.len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        for id in &report.chunk_ids {
            assert_eq!(f.chunks.get(*id).unwrap().status, ChunkStatus::Scheduled);
        }

        let jobs = f.runtime.jobs();
        assert_eq!(jobs.len(), 3);
        for (job, chunk_id) in jobs.iter().zip(&report.chunk_ids) {
            assert_eq!(job.hook, HookName::new(sync.clone(), Phase::ProcessChunk));
            assert_eq!(job.group, group);
            assert_eq!(job.args, JobArgs::for_chunk(*chunk_id));
        }
    }

    #[test]
    fn empty_source_schedules_nothing_but_releases() {
        let f = fixture();
        let (sync, group) = names();
        let report = f.splitter.split(&sync, &group, Vec::new(), ChunkSizing::new(10)).unwrap();
        assert_eq!(report.chunk_count(), 0);
        assert!(report.source_released);
        assert!(f.runtime.jobs().is_empty());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let f = fixture();
        let (sync, group) = names();
        let err = f.splitter.split(&sync, &group, records(3), ChunkSizing::new(0)).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn chunk_limit_skips_extra_chunks() {
        let f = fixture();
        let (sync, group) = names();
        let report = f
            .splitter
            .split(&sync, &group, records(50), ChunkSizing::new(10).with_limit(2))
            .unwrap();

        assert_eq!(report.chunk_count(), 2);
        assert_eq!(report.skipped_chunks, 3);
        assert_eq!(report.records, 20);
        assert_eq!(f.runtime.jobs().len(), 2);
    }

    #[test]
    fn cleanup_runs_once_after_scheduling() {
        let f = fixture();
        let (sync, group) = names();
        let calls = Cell::new(0);
        let runtime = f.runtime.clone();

        f.splitter
            .split_with_cleanup(&sync, &group, records(25), ChunkSizing::new(10), || {
                assert_eq!(runtime.jobs().len(), 3);
                calls.set(calls.get() + 1);
                Ok(())
            })
            .unwrap();

        assert_eq!(calls.get(), 1);
    }

    /// Fails every insert after the first `allowed` ones.
    struct FlakyPersistence {
        inner: InMemoryChunkPersistence,
        allowed: usize,
        inserted: std::sync::Mutex<usize>,
    }

    impl ChunkPersistence for FlakyPersistence {
        fn insert(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError> {
            let mut inserted = self.inserted.lock().unwrap();
            if *inserted >= self.allowed {
                return Err(PersistenceError::Storage("disk full".into()));
            }
            *inserted += 1;
            self.inner.insert(chunk)
        }

        fn update(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError> {
            self.inner.update(id, patch)
        }

        fn get_by_id(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError> {
            self.inner.get_by_id(id)
        }

        fn query(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError> {
            self.inner.query(filter)
        }

        fn delete(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError> {
            self.inner.delete(filter)
        }
    }

    #[test]
    fn persistence_failure_aborts_before_scheduling() {
        let f = fixture_with(Arc::new(FlakyPersistence {
            inner: InMemoryChunkPersistence::new(),
            allowed: 1,
            inserted: std::sync::Mutex::new(0),
        }));
        let (sync, group) = names();
        let released = Cell::new(false);

        let err = f
            .splitter
            .split_with_cleanup(&sync, &group, records(30), ChunkSizing::new(10), || {
                released.set(true);
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::SchedulingFailure(_)));
        assert_eq!(f.runtime.jobs().len(), 1);
        assert!(!released.get());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn chunks_reconstruct_the_source(total in 0usize..120, size in 1usize..17) {
            let f = fixture();
            let (sync, group) = names();
            let source = records(total);

            let report = f.splitter.split(&sync, &group, source.clone(), ChunkSizing::new(size)).unwrap();

            let mut rebuilt = Vec::new();
            for job in f.runtime.jobs() {
                let chunk = f.chunks.get(job.args.chunk_id().unwrap()).unwrap();
                prop_assert!(chunk.payload.len() <= size);
                for record in chunk.payload.records() {
                    rebuilt.push(record.unwrap());
                }
            }
            prop_assert_eq!(report.records, total);
            prop_assert_eq!(report.chunk_count(), total.div_ceil(size));
            prop_assert_eq!(rebuilt, source);
        }
    }
}
