//! Sequential orchestrator: runs independent chunked syncs one after another.
//!
//! The queue and the current run live in the shared-state store under
//! `<name>_sequence` and are reloaded before every decision, so a restarted
//! process resumes where the previous one stopped. A run's completion job
//! advances the sequence; the orchestrator signals its own end with
//! `<name>/complete`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use chunkflow_core::{Clock, GroupName, MergeOptions, SyncError, SyncName, SyncResult};
use chunkflow_events::{HookName, JobArgs, JobDescriptor, Phase};

use crate::runtime::{HookRegistry, JobRuntime};
use crate::shared_state::SharedStateStore;
use crate::sync::SyncEngine;

/// The run currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentRun {
    pub sync: SyncName,
    pub group: GroupName,
}

/// Persisted orchestrator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceState {
    #[serde(default)]
    pub queue: VecDeque<SyncName>,
    #[serde(default)]
    pub current: Option<CurrentRun>,
    /// Group of the orchestrator itself, used for its completion signal.
    #[serde(default)]
    pub group: Option<GroupName>,
    /// Shared state of each finished run, keyed by the run's group.
    #[serde(default)]
    pub jobs_data: BTreeMap<String, Value>,
}

pub struct SequentialOrchestrator {
    name: SyncName,
    runs: Vec<SyncName>,
    cleanup_on_complete: bool,
    shared_state: Arc<SharedStateStore>,
    runtime: Arc<dyn JobRuntime>,
    clock: Arc<dyn Clock>,
    next_calls: AtomicUsize,
}

impl SequentialOrchestrator {
    /// `runs` must be registered on `engine`.
    pub fn new(name: SyncName, runs: Vec<SyncName>, engine: &SyncEngine) -> Self {
        Self {
            name,
            runs,
            cleanup_on_complete: false,
            shared_state: engine.shared_state().clone(),
            runtime: engine.runtime().clone(),
            clock: engine.chunks().clock().clone(),
            next_calls: AtomicUsize::new(0),
        }
    }

    /// Delete the persisted state once the last run is done.
    pub fn with_cleanup_on_complete(mut self, cleanup: bool) -> Self {
        self.cleanup_on_complete = cleanup;
        self
    }

    pub fn name(&self) -> &SyncName {
        &self.name
    }

    /// Advance on every member's `complete` hook and acknowledge the
    /// orchestrator's own completion signal.
    pub fn register(self: &Arc<Self>, registry: &mut HookRegistry) {
        for run in &self.runs {
            let this = self.clone();
            registry.register(HookName::new(run.clone(), Phase::Complete), move |job: &JobDescriptor| {
                this.on_run_complete(job)
            });
        }
        let name = self.name.clone();
        registry.register(HookName::new(self.name.clone(), Phase::Complete), move |job: &JobDescriptor| {
            info!(sequence = %name, group = %job.group, "sequence complete");
            Ok(())
        });
    }

    /// Enqueue every run and start the first. Fails with `AlreadyRunning`
    /// while a previous sequence is still in progress.
    pub fn start(&self) -> SyncResult<Option<GroupName>> {
        self.guarded(|| {
            let state = self.load()?;
            if state.current.is_some() {
                return Err(SyncError::AlreadyRunning(self.name.to_string()));
            }
            let fresh = SequenceState {
                queue: self.runs.iter().cloned().collect(),
                current: None,
                group: Some(GroupName::for_run(&self.name, self.clock.now())),
                jobs_data: BTreeMap::new(),
            };
            self.save(&fresh)?;
            info!(sequence = %self.name, runs = self.runs.len(), "sequence started");
            self.advance()
        })
    }

    /// Capture the finished run's data, then trigger the next run or signal
    /// completion. Returns the group of the triggered run.
    pub fn next(&self) -> SyncResult<Option<GroupName>> {
        self.guarded(|| self.advance())
    }

    /// Current persisted state, if a sequence was ever started.
    pub fn state(&self) -> SyncResult<Option<SequenceState>> {
        match self.shared_state.get(&self.state_key())? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Runs still waiting to start.
    pub fn queue_len(&self) -> SyncResult<usize> {
        Ok(self.load()?.queue.len())
    }

    /// How many times this instance advanced the sequence.
    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    fn on_run_complete(&self, job: &JobDescriptor) -> SyncResult<()> {
        let result = self.guarded(|| {
            let state = self.load()?;
            match &state.current {
                Some(current) if current.group == job.group => self.advance().map(|_| ()),
                _ => {
                    debug!(sequence = %self.name, group = %job.group, "completion of a run that is not current, ignoring");
                    Ok(())
                }
            }
        });
        match result {
            Err(SyncError::Locked(_)) => self.defer_completion(job),
            other => other,
        }
    }

    /// Replay `job` one lock-retry delay from now, once whoever is advancing
    /// the sequence had a chance to finish.
    fn defer_completion(&self, job: &JobDescriptor) -> SyncResult<()> {
        let delay = self.shared_state.config().lock_retry.delay;
        let at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.runtime
            .schedule_delayed(at, job.hook.clone(), job.args.clone(), job.group.clone())?;
        debug!(sequence = %self.name, group = %job.group, retry_at = %at, "sequence is being advanced elsewhere, completion deferred");
        Ok(())
    }

    fn advance(&self) -> SyncResult<Option<GroupName>> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.load()?;

        if let Some(current) = &state.current {
            let data = self.shared_state.get(current.group.as_str())?.unwrap_or(Value::Null);
            state.jobs_data.insert(current.group.to_string(), data);
        }

        let Some(run) = state.queue.pop_front() else {
            if state.current.take().is_some() {
                self.save(&state)?;
                let group = state
                    .group
                    .clone()
                    .unwrap_or_else(|| GroupName::for_run(&self.name, self.clock.now()));
                self.runtime
                    .schedule(HookName::new(self.name.clone(), Phase::Complete), JobArgs::empty(), group)?;
                info!(sequence = %self.name, runs = state.jobs_data.len(), "last run finished");
                if self.cleanup_on_complete {
                    self.shared_state.delete(&self.state_key())?;
                }
            }
            return Ok(None);
        };

        // The run is persisted as current before it can complete.
        let group = GroupName::for_run(&run, self.clock.now());
        state.current = Some(CurrentRun {
            sync: run.clone(),
            group: group.clone(),
        });
        self.save(&state)?;
        self.runtime
            .schedule(HookName::new(run.clone(), Phase::Schedule), JobArgs::empty(), group.clone())?;
        info!(sequence = %self.name, run = %run, group = %group, remaining = state.queue.len(), "run triggered");
        Ok(Some(group))
    }

    fn load(&self) -> SyncResult<SequenceState> {
        Ok(self.state()?.unwrap_or_default())
    }

    fn save(&self, state: &SequenceState) -> SyncResult<()> {
        self.shared_state
            .update(&self.state_key(), serde_json::to_value(state)?, MergeOptions::shallow())?;
        Ok(())
    }

    /// Run `f` while holding the advance lock, so two workers never move the
    /// sequence at the same time.
    fn guarded<T>(&self, f: impl FnOnce() -> SyncResult<T>) -> SyncResult<T> {
        let key = self.advance_key();
        let token = self.shared_state.acquire(&key, self.shared_state.config().lock_ttl)?;
        let result = f();
        let released = self.shared_state.release(&key, &token);
        let value = result?;
        released?;
        Ok(value)
    }

    fn state_key(&self) -> String {
        format!("{}_sequence", self.name)
    }

    fn advance_key(&self) -> String {
        format!("{}_advance", self.state_key())
    }
}
