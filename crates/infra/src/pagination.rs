//! Rate-limited, cursor-driven fetch loops that buffer partial pages until a
//! full chunk is available.
//!
//! Each invocation of `<sync>/fetch` fetches one page. State between
//! invocations (`cursor`, `buffer`, `last_call`) lives in the shared-state
//! store under `<group>_pagination`, so any worker can pick up the next page.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use chunkflow_core::{Clock, GroupName, MergeOptions, Record, SyncError, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, JobDescriptor, Phase};

use crate::runtime::{HookRegistry, JobRuntime};
use crate::shared_state::SharedStateStore;
use crate::splitter::{ChunkSizing, ChunkSplitter, SplitReport};
use crate::sync::SyncEngine;

/// Position of the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Page(u64),
    Offset(u64),
    Url(String),
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Page(page) => write!(f, "page {page}"),
            Cursor::Offset(offset) => write!(f, "offset {offset}"),
            Cursor::Url(url) => f.write_str(url),
        }
    }
}

/// What follows the page just fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Continue(Cursor),
    /// Terminal marker: the page just fetched was the last one.
    Done,
}

impl Next {
    /// Next page number while `index < total`.
    pub fn page(index: u64, total: u64) -> Self {
        if index < total {
            Next::Continue(Cursor::Page(index + 1))
        } else {
            Next::Done
        }
    }

    /// Next offset while another page of `per_page` items remains.
    pub fn offset(offset: u64, total: u64, per_page: u64) -> Self {
        if offset + per_page < total {
            Next::Continue(Cursor::Offset(offset + per_page))
        } else {
            Next::Done
        }
    }

    /// Next link, if the response carried a non-empty one.
    pub fn url(next: Option<&str>) -> Self {
        match next.map(str::trim) {
            Some(url) if !url.is_empty() => Next::Continue(Cursor::Url(url.to_string())),
            _ => Next::Done,
        }
    }
}

/// One fetched page. `next` must be set before the page is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    pub next: Option<Next>,
}

impl Page {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records, next: None }
    }

    pub fn with_next(mut self, next: Next) -> Self {
        self.next = Some(next);
        self
    }
}

/// External paginated source.
pub trait PageFetcher: Send + Sync {
    fn fetch(&self, cursor: &Cursor) -> anyhow::Result<Page>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Chunk size and limit of the chunks built from fetched pages. The limit
    /// counts chunks across every page of a run.
    pub sizing: ChunkSizing,
    /// Cursor of the first request of a run.
    pub initial: Cursor,
    /// Minimum time between two requests.
    pub min_interval: Duration,
    /// Intervals above this schedule the next fetch as a delayed job.
    pub delayed_threshold: Duration,
}

impl PaginationConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            sizing: ChunkSizing::new(chunk_size),
            initial: Cursor::Page(1),
            min_interval: Duration::from_millis(250),
            delayed_threshold: Duration::from_secs(15),
        }
    }

    pub fn with_chunk_limit(mut self, limit: usize) -> Self {
        self.sizing = self.sizing.with_limit(limit);
        self
    }

    pub fn with_initial(mut self, cursor: Cursor) -> Self {
        self.initial = cursor;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_delayed_threshold(mut self, threshold: Duration) -> Self {
        self.delayed_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaginationState {
    cursor: Cursor,
    #[serde(default)]
    buffer: Vec<Record>,
    #[serde(default)]
    last_call: Option<DateTime<Utc>>,
    /// Chunks counted against the limit by earlier pages.
    #[serde(default)]
    chunks_seen: usize,
}

/// Result of one fetch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Chunks scheduled by this invocation.
    pub report: SplitReport,
    /// Records left in the buffer for the next page.
    pub buffered: usize,
    /// Cursor of the next request; `None` once the source is exhausted.
    pub next: Option<Cursor>,
}

pub struct PaginationAccumulator {
    sync: SyncName,
    config: PaginationConfig,
    fetcher: Arc<dyn PageFetcher>,
    splitter: ChunkSplitter,
    shared_state: Arc<SharedStateStore>,
    runtime: Arc<dyn JobRuntime>,
    clock: Arc<dyn Clock>,
}

impl PaginationAccumulator {
    pub fn new(sync: SyncName, fetcher: Arc<dyn PageFetcher>, config: PaginationConfig, engine: &SyncEngine) -> Self {
        Self {
            sync,
            config,
            fetcher,
            splitter: engine.splitter().clone(),
            shared_state: engine.shared_state().clone(),
            runtime: engine.runtime().clone(),
            clock: engine.chunks().clock().clone(),
        }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Start the fetch loop on `<sync>/schedule` and run one page per
    /// `<sync>/fetch` job.
    pub fn register(self: &Arc<Self>, registry: &mut HookRegistry) {
        let this = self.clone();
        registry.register(
            HookName::new(self.sync.clone(), Phase::Schedule),
            move |job: &JobDescriptor| this.start(&job.group),
        );
        let this = self.clone();
        registry.register(
            HookName::new(self.sync.clone(), Phase::Fetch),
            move |job: &JobDescriptor| this.fetch_page(&job.group).map(|_| ()),
        );
    }

    /// Schedule the first fetch of `group`, dropping any state a previous
    /// attempt left behind.
    pub fn start(&self, group: &GroupName) -> SyncResult<()> {
        self.shared_state.delete(&state_key(group))?;
        self.runtime
            .schedule(self.fetch_hook(), JobArgs::empty(), group.clone())?;
        debug!(sync = %self.sync, group = %group, cursor = %self.config.initial, "pagination started");
        Ok(())
    }

    /// Fetch one page, chunk every full buffer, then either schedule the next
    /// fetch or flush the remainder when the source is exhausted.
    pub fn fetch_page(&self, group: &GroupName) -> SyncResult<FetchOutcome> {
        let key = state_key(group);
        let mut state = match self.shared_state.get(&key)? {
            Some(value) => serde_json::from_value::<PaginationState>(value)?,
            None => PaginationState {
                cursor: self.config.initial.clone(),
                buffer: Vec::new(),
                last_call: None,
                chunks_seen: 0,
            },
        };

        self.wait_for_slot(state.last_call);
        let page = self
            .fetcher
            .fetch(&state.cursor)
            .map_err(|e| SyncError::SourceUnavailable(format!("{e:#}")))?;
        let last_call = self.clock.now();

        if page.records.is_empty() {
            return Err(SyncError::EmptyFetch(state.cursor.to_string()));
        }
        let next = page.next.ok_or_else(|| {
            SyncError::validation(format!("fetch for {} did not set a next cursor", state.cursor))
        })?;
        debug!(sync = %self.sync, group = %group, cursor = %state.cursor, records = page.records.len(), "page fetched");

        state.buffer.extend(page.records);
        let sizing = self.config.sizing;
        let mut report = SplitReport::continuing(state.chunks_seen);
        while state.buffer.len() >= sizing.size {
            let rest = state.buffer.split_off(sizing.size);
            self.splitter
                .schedule_chunk(&self.sync, group, &state.buffer, sizing, &mut report)?;
            state.buffer = rest;
        }

        match next {
            Next::Done => {
                if !state.buffer.is_empty() {
                    self.splitter
                        .schedule_chunk(&self.sync, group, &state.buffer, sizing, &mut report)?;
                }
                self.shared_state.delete(&key)?;
                info!(sync = %self.sync, group = %group, "pagination finished");
                Ok(FetchOutcome {
                    report,
                    buffered: 0,
                    next: None,
                })
            }
            Next::Continue(cursor) => {
                let patch = json!({
                    "cursor": cursor,
                    "buffer": state.buffer,
                    "last_call": last_call,
                    "chunks_seen": report.seen(),
                });
                self.shared_state.update(&key, patch, MergeOptions::shallow())?;
                self.schedule_next(group, last_call)?;
                Ok(FetchOutcome {
                    report,
                    buffered: state.buffer.len(),
                    next: Some(cursor),
                })
            }
        }
    }

    fn wait_for_slot(&self, last_call: Option<DateTime<Utc>>) {
        let Some(last_call) = last_call else {
            return;
        };
        let ready_at = last_call + to_chrono(self.config.min_interval);
        let now = self.clock.now();
        if now < ready_at {
            let wait = (ready_at - now).to_std().unwrap_or_default();
            debug!(sync = %self.sync, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            self.clock.sleep(wait);
        }
    }

    fn schedule_next(&self, group: &GroupName, last_call: DateTime<Utc>) -> SyncResult<()> {
        if self.config.min_interval > self.config.delayed_threshold {
            let at = last_call + to_chrono(self.config.min_interval);
            self.runtime
                .schedule_delayed(at, self.fetch_hook(), JobArgs::empty(), group.clone())?;
            debug!(sync = %self.sync, group = %group, at = %at, "next fetch delayed");
        } else {
            self.runtime
                .schedule(self.fetch_hook(), JobArgs::empty(), group.clone())?;
        }
        Ok(())
    }

    fn fetch_hook(&self) -> HookName {
        HookName::new(self.sync.clone(), Phase::Fetch)
    }
}

fn state_key(group: &GroupName) -> String {
    format!("{group}_pagination")
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::ChunkStore;
    use crate::config::EngineConfig;
    use crate::persistence::InMemoryChunkPersistence;
    use crate::runtime::{InMemoryJobRuntime, JobExecutor, JobOutcome};
    use crate::sync::{ChunkContext, SyncDefinition};
    use chunkflow_core::{ChunkStatus, ManualClock, RecordStream};
    use std::sync::Mutex;

    /// `pages` pages of `per_page` records, addressed by page number.
    struct PagedSource {
        pages: u64,
        per_page: u64,
        empty_page: Option<u64>,
        requested: Mutex<Vec<Cursor>>,
    }

    impl PagedSource {
        fn new(pages: u64, per_page: u64) -> Self {
            Self {
                pages,
                per_page,
                empty_page: None,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageFetcher for PagedSource {
        fn fetch(&self, cursor: &Cursor) -> anyhow::Result<Page> {
            self.requested.lock().unwrap().push(cursor.clone());
            let Cursor::Page(page) = cursor else {
                anyhow::bail!("unexpected cursor {cursor}");
            };
            if self.empty_page == Some(*page) {
                return Ok(Page::new(Vec::new()).with_next(Next::page(*page, self.pages)));
            }
            let first = (page - 1) * self.per_page;
            let records = (first..first + self.per_page).map(|i| json!({"item": i})).collect();
            Ok(Page::new(records).with_next(Next::page(*page, self.pages)))
        }
    }

    struct Collect(Mutex<Vec<Record>>);

    impl SyncDefinition for Collect {
        fn name(&self) -> SyncName {
            SyncName::new("catalog").unwrap()
        }

        fn chunk_size(&self) -> usize {
            5
        }

        fn process_chunk(&self, records: &mut RecordStream<'_>, _ctx: &ChunkContext<'_>) -> anyhow::Result<()> {
            for record in records {
                self.0.lock().unwrap().push(record?);
            }
            Ok(())
        }
    }

    struct Fixture {
        engine: SyncEngine,
        accumulator: Arc<PaginationAccumulator>,
        executor: JobExecutor<Arc<InMemoryJobRuntime>>,
        runtime: Arc<InMemoryJobRuntime>,
        clock: Arc<ManualClock>,
        collected: Arc<Collect>,
    }

    fn fixture(source: PagedSource, config: PaginationConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let runtime = InMemoryJobRuntime::arc(clock.clone());
        let chunks = ChunkStore::new(InMemoryChunkPersistence::arc(), clock.clone());
        let shared_state = Arc::new(SharedStateStore::in_memory(clock.clone()));
        let mut engine = SyncEngine::new(chunks, runtime.clone(), shared_state);

        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        let mut registry = HookRegistry::new();
        engine.register(&mut registry, collected.clone()).unwrap();
        let accumulator = Arc::new(PaginationAccumulator::new(
            collected.name(),
            Arc::new(source),
            config,
            &engine,
        ));
        accumulator.register(&mut registry);

        let mut executor = JobExecutor::new(runtime.clone(), registry);
        for listener in engine.listeners() {
            executor.subscribe(listener);
        }
        Fixture {
            engine,
            accumulator,
            executor,
            runtime,
            clock,
            collected,
        }
    }

    #[test]
    fn page_helpers_compute_next_cursor() {
        assert_eq!(Next::page(1, 4), Next::Continue(Cursor::Page(2)));
        assert_eq!(Next::page(4, 4), Next::Done);
        assert_eq!(Next::offset(0, 25, 10), Next::Continue(Cursor::Offset(10)));
        assert_eq!(Next::offset(20, 25, 10), Next::Done);
        assert_eq!(
            Next::url(Some("https://api.test/items?after=9")),
            Next::Continue(Cursor::Url("https://api.test/items?after=9".into()))
        );
        assert_eq!(Next::url(Some("")), Next::Done);
        assert_eq!(Next::url(None), Next::Done);
    }

    #[test]
    fn chunk_limit_spans_every_page_of_a_run() {
        let f = fixture(PagedSource::new(4, 3), PaginationConfig::new(5).with_chunk_limit(2));
        let group = f.engine.trigger(&f.collected.name()).unwrap();
        f.executor.run_until_idle(100).unwrap();

        let sizes: Vec<usize> = f
            .engine
            .chunks()
            .list_group(&group)
            .unwrap()
            .iter()
            .map(|c| c.payload.len())
            .collect();
        assert_eq!(sizes, vec![5, 5]);
        assert_eq!(f.collected.0.lock().unwrap().len(), 10);
    }

    #[test]
    fn four_pages_of_three_make_chunks_of_five_five_two() {
        let f = fixture(PagedSource::new(4, 3), PaginationConfig::new(5));
        let group = f.engine.trigger(&f.collected.name()).unwrap();

        let outcomes = f.executor.run_until_idle(100).unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, JobOutcome::Completed(_))));

        let chunks = f.engine.chunks().list_group(&group).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Finished));

        let items: Vec<u64> = f
            .collected
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r["item"].as_u64())
            .collect();
        assert_eq!(items, (0..12).collect::<Vec<u64>>());

        // State is dropped once the last page is in.
        let key = format!("{group}_pagination");
        assert_eq!(f.engine.shared_state().get(&key).unwrap(), None);
        // Three waits of 250ms between four back-to-back calls.
        assert_eq!(f.clock.total_slept(), Duration::from_millis(750));
    }

    #[test]
    fn buffer_and_cursor_persist_between_calls() {
        let f = fixture(PagedSource::new(4, 3), PaginationConfig::new(5));
        let group = GroupName::new("catalog_1").unwrap();

        let first = f.accumulator.fetch_page(&group).unwrap();
        assert_eq!(first.report.chunk_count(), 0);
        assert_eq!(first.buffered, 3);
        assert_eq!(first.next, Some(Cursor::Page(2)));

        let second = f.accumulator.fetch_page(&group).unwrap();
        assert_eq!(second.report.chunk_count(), 1);
        assert_eq!(second.buffered, 1);

        let state = f.engine.shared_state().get("catalog_1_pagination").unwrap().unwrap();
        assert_eq!(state["cursor"], json!({"kind": "page", "value": 3}));
        assert_eq!(state["buffer"], json!([{"item": 5}]));
    }

    #[test]
    fn empty_page_is_fatal() {
        let mut source = PagedSource::new(4, 3);
        source.empty_page = Some(2);
        let f = fixture(source, PaginationConfig::new(5));
        let group = GroupName::new("catalog_1").unwrap();

        f.accumulator.fetch_page(&group).unwrap();
        let err = f.accumulator.fetch_page(&group).unwrap_err();
        assert_eq!(err, SyncError::EmptyFetch("page 2".into()));
        assert!(err.is_fatal_to_run());
    }

    struct NoCursor;

    impl PageFetcher for NoCursor {
        fn fetch(&self, _cursor: &Cursor) -> anyhow::Result<Page> {
            Ok(Page::new(vec![json!({"item": 1})]))
        }
    }

    #[test]
    fn page_without_next_cursor_is_rejected() {
        let f = fixture(PagedSource::new(1, 1), PaginationConfig::new(5));
        let accumulator = PaginationAccumulator::new(
            f.collected.name(),
            Arc::new(NoCursor),
            PaginationConfig::new(5),
            &f.engine,
        );
        let err = accumulator.fetch_page(&GroupName::new("catalog_1").unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn long_intervals_schedule_delayed_fetches() {
        let config = EngineConfig::default()
            .pagination(5)
            .with_min_interval(Duration::from_secs(20));
        let f = fixture(PagedSource::new(2, 3), config);
        let group = f.engine.trigger(&f.collected.name()).unwrap();

        // schedule + first fetch; the second fetch is not due yet
        assert_eq!(f.executor.run_until_idle(100).unwrap().len(), 2);
        let fetches = f.runtime.jobs_for(&HookName::new(f.collected.name(), Phase::Fetch));
        assert_eq!(fetches.len(), 2);
        let first_finished = fetches[0].finished_at.unwrap();
        assert_eq!(fetches[1].scheduled_at, Some(first_finished + chrono::Duration::seconds(20)));

        f.clock.advance(Duration::from_secs(20));
        f.executor.run_until_idle(100).unwrap();
        let sizes: Vec<usize> = f
            .engine
            .chunks()
            .list_group(&group)
            .unwrap()
            .iter()
            .map(|c| c.payload.len())
            .collect();
        assert_eq!(sizes, vec![5, 1]);
        assert_eq!(f.clock.total_slept(), Duration::ZERO);
    }
}
