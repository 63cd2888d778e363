//! Lifecycle tracker: maps runtime events onto chunk state and detects when a
//! group has no work left.
//!
//! One tracker serves one sync. A job belongs to the sync when its hook name
//! contains the sync name. The completion signal is `<sync>/complete` with empty
//! arguments in the same group; its own lifecycle events are ignored so it never
//! re-triggers itself.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use chunkflow_core::{ChunkId, ChunkStatus, GroupName, JobId, SyncError, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, JobDescriptor, LifecycleEvent, LifecycleListener, Phase};

use crate::chunks::ChunkStore;
use crate::runtime::{JobRuntime, JobStatus};

/// Sync-specific failure callback: the failed job and the original error.
pub type FailureHandler = Arc<dyn Fn(&JobDescriptor, &str) -> SyncResult<()> + Send + Sync>;

/// Groups remembered as signalled before the oldest is forgotten.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

/// Most recently signalled groups, oldest evicted first. An evicted group is
/// still guarded by the completion handler's shared-state marker.
#[derive(Debug)]
struct SignalledGroups {
    order: VecDeque<GroupName>,
    groups: HashSet<GroupName>,
    capacity: usize,
}

impl SignalledGroups {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            groups: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember `group`; false if it was already remembered.
    fn insert(&mut self, group: &GroupName) -> bool {
        if !self.groups.insert(group.clone()) {
            return false;
        }
        self.order.push_back(group.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.groups.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct LifecycleTracker {
    sync: SyncName,
    chunks: ChunkStore,
    runtime: Arc<dyn JobRuntime>,
    on_fail: Option<FailureHandler>,
    group: Mutex<Option<GroupName>>,
    /// Groups this process already signalled complete.
    signalled: Mutex<SignalledGroups>,
}

impl LifecycleTracker {
    pub fn new(sync: SyncName, chunks: ChunkStore, runtime: Arc<dyn JobRuntime>) -> Self {
        Self {
            sync,
            chunks,
            runtime,
            on_fail: None,
            group: Mutex::new(None),
            signalled: Mutex::new(SignalledGroups::new(DEFAULT_SIGNAL_CAPACITY)),
        }
    }

    /// How many signalled groups to remember for duplicate suppression.
    pub fn with_signal_capacity(self, capacity: usize) -> Self {
        Self {
            signalled: Mutex::new(SignalledGroups::new(capacity)),
            ..self
        }
    }

    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.on_fail = Some(handler);
        self
    }

    pub fn sync(&self) -> &SyncName {
        &self.sync
    }

    /// Group of the most recently observed job of this sync.
    pub fn group(&self) -> Option<GroupName> {
        self.group.lock().ok().and_then(|group| group.clone())
    }

    pub fn on_before_execute(&self, job_id: JobId) -> SyncResult<()> {
        let Some(job) = self.member_job(job_id)? else {
            return Ok(());
        };
        self.adopt_group(&job.group);

        if let Some(chunk_id) = job.args.chunk_id() {
            match self.chunks.mark_started(chunk_id, job_id) {
                Ok(_) => {}
                Err(SyncError::InvalidTransition { from, .. }) => {
                    debug!(chunk_id = %chunk_id, status = %from, "chunk already started, redelivered job");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn on_completed(&self, job_id: JobId) -> SyncResult<()> {
        let Some(job) = self.member_job(job_id)? else {
            return Ok(());
        };
        if job.hook.phase() == Phase::Complete {
            return Ok(());
        }
        self.adopt_group(&job.group);

        if let Some(chunk_id) = job.args.chunk_id() {
            self.finish_chunk(chunk_id, job_id)?;
        }
        self.check_group_complete(&job.group)
    }

    pub fn on_failed(&self, job_id: JobId, error: &str) -> SyncResult<()> {
        let Some(job) = self.member_job(job_id)? else {
            return Ok(());
        };
        self.adopt_group(&job.group);

        if let Some(chunk_id) = job.args.chunk_id() {
            self.fail_chunk(chunk_id, job_id)?;
        }

        if let Some(handler) = &self.on_fail {
            if let Err(err) = handler(&job, error) {
                warn!(sync = %self.sync, job_id = %job_id, error = %err, "failure handler raised");
            }
        }

        if job.hook.phase() == Phase::Complete {
            return Ok(());
        }
        self.check_group_complete(&job.group)
    }

    fn member_job(&self, job_id: JobId) -> SyncResult<Option<JobDescriptor>> {
        Ok(self
            .runtime
            .fetch_job(job_id)?
            .filter(|job| job.hook.belongs_to(&self.sync)))
    }

    fn adopt_group(&self, group: &GroupName) {
        if let Ok(mut current) = self.group.lock() {
            if current.as_ref() != Some(group) {
                debug!(sync = %self.sync, group = %group, "adopted group");
                *current = Some(group.clone());
            }
        }
    }

    /// Bring a chunk to `Finished`. A duplicate completion is a no-op; a chunk
    /// whose start or run step was missed is walked through the missing steps.
    fn finish_chunk(&self, chunk_id: ChunkId, job_id: JobId) -> SyncResult<()> {
        let chunk = self.chunks.get(chunk_id)?;
        match chunk.status {
            ChunkStatus::Finished => {
                debug!(chunk_id = %chunk_id, "chunk already finished");
                return Ok(());
            }
            ChunkStatus::Failed => {
                warn!(chunk_id = %chunk_id, "completion reported for a failed chunk, keeping it failed");
                return Ok(());
            }
            ChunkStatus::Scheduled => {
                self.chunks.mark_started(chunk_id, job_id)?;
                self.chunks.mark_running(chunk_id)?;
            }
            ChunkStatus::Started => {
                self.chunks.mark_running(chunk_id)?;
            }
            ChunkStatus::Running => {}
        }
        self.chunks.mark_finished(chunk_id)?;
        Ok(())
    }

    fn fail_chunk(&self, chunk_id: ChunkId, job_id: JobId) -> SyncResult<()> {
        let chunk = self.chunks.get(chunk_id)?;
        match chunk.status {
            ChunkStatus::Finished | ChunkStatus::Failed => {
                debug!(chunk_id = %chunk_id, status = %chunk.status, "chunk already terminal");
                return Ok(());
            }
            ChunkStatus::Scheduled => {
                self.chunks.mark_started(chunk_id, job_id)?;
            }
            ChunkStatus::Started | ChunkStatus::Running => {}
        }
        self.chunks.mark_failed(chunk_id)?;
        Ok(())
    }

    fn check_group_complete(&self, group: &GroupName) -> SyncResult<()> {
        let remaining = self.runtime.query_actions(group, &JobStatus::ACTIVE, 1)?;
        if !remaining.is_empty() {
            return Ok(());
        }

        let first_signal = self
            .signalled
            .lock()
            .map(|mut signalled| signalled.insert(group))
            .unwrap_or(true);
        if !first_signal {
            debug!(sync = %self.sync, group = %group, "group completion already signalled");
            return Ok(());
        }

        self.runtime.schedule(
            HookName::new(self.sync.clone(), Phase::Complete),
            JobArgs::empty(),
            group.clone(),
        )?;
        info!(sync = %self.sync, group = %group, "group complete");
        Ok(())
    }
}

impl LifecycleListener for LifecycleTracker {
    fn on_event(&self, event: &LifecycleEvent) -> Result<(), SyncError> {
        match event {
            LifecycleEvent::BeforeExecute { job_id } => self.on_before_execute(*job_id),
            LifecycleEvent::Completed { job_id } => self.on_completed(*job_id),
            LifecycleEvent::Failed { job_id, error } => self.on_failed(*job_id, error),
        }
    }
}
