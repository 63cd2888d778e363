//! Job executor: claims jobs, dispatches them through the hook registry and
//! reports lifecycle events to listeners.
//!
//! Order per job: claim (job `Running`), `BeforeExecute`, handlers, then the job
//! is marked `Completed`/`Failed` in the runtime *before* `Completed`/`Failed`
//! is emitted, so listeners asking "what is still pending or running?" never
//! count the job that just finished.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use chunkflow_core::{JobId, SyncError};
use chunkflow_events::{JobDescriptor, LifecycleEvent, LifecycleListener};

use super::registry::HookRegistry;
use super::store::{JobQueue, RuntimeError};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs when idle
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "chunkflow-worker".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Failed { job_id: JobId, error: SyncError },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Completed(job_id) | JobOutcome::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. })
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the worker thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Failures that end their whole run, a subset of `jobs_failed`.
    pub runs_aborted: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed(_) => self.jobs_succeeded += 1,
            JobOutcome::Failed { error, .. } => {
                self.jobs_failed += 1;
                if error.is_fatal_to_run() {
                    self.runs_aborted += 1;
                }
            }
        }
    }
}

/// Worker that drains a [`JobQueue`].
pub struct JobExecutor<Q: JobQueue> {
    queue: Q,
    registry: Arc<HookRegistry>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl<Q: JobQueue> JobExecutor<Q> {
    /// The registry is frozen from here on.
    pub fn new(queue: Q, registry: HookRegistry) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            listeners: Vec::new(),
        }
    }

    /// Subscribe a listener to lifecycle events, in subscription order.
    pub fn subscribe(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Execute the oldest ready job, if any.
    pub fn run_next(&self) -> Result<Option<JobOutcome>, RuntimeError> {
        let Some(job) = self.queue.claim_next()? else {
            return Ok(None);
        };
        let descriptor = job.descriptor();
        debug!(job_id = %job.id, hook = %job.hook, group = %job.group, "claimed job");

        self.queue.append_log(job.id, "action started")?;
        self.emit(&LifecycleEvent::BeforeExecute { job_id: job.id });

        match self.dispatch(&descriptor) {
            Ok(()) => {
                self.queue.complete(job.id)?;
                self.queue.append_log(job.id, "action complete")?;
                self.emit(&LifecycleEvent::Completed { job_id: job.id });
                debug!(job_id = %job.id, "job completed successfully");
                Ok(Some(JobOutcome::Completed(job.id)))
            }
            Err(err) => {
                let message = err.to_string();
                self.queue.fail(job.id, message.clone())?;
                self.queue.append_log(job.id, &format!("action failed: {message}"))?;
                self.emit(&LifecycleEvent::Failed {
                    job_id: job.id,
                    error: message,
                });
                if err.is_fatal_to_run() {
                    error!(job_id = %job.id, hook = %job.hook, group = %job.group, error = %err, "job failed, run aborted");
                } else {
                    warn!(job_id = %job.id, hook = %job.hook, error = %err, "job failed");
                }
                Ok(Some(JobOutcome::Failed { job_id: job.id, error: err }))
            }
        }
    }

    /// Run jobs until none is ready or `max_jobs` have run. Returns the outcomes.
    pub fn run_until_idle(&self, max_jobs: usize) -> Result<Vec<JobOutcome>, RuntimeError> {
        let mut outcomes = Vec::new();
        while outcomes.len() < max_jobs {
            match self.run_next()? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        Ok(outcomes)
    }

    fn dispatch(&self, descriptor: &JobDescriptor) -> Result<(), SyncError> {
        let handlers = self.registry.handlers_for(&descriptor.hook);
        if handlers.is_empty() {
            return Err(SyncError::scheduling(format!(
                "no handler registered for hook {}",
                descriptor.hook
            )));
        }
        handlers.iter().try_for_each(|handler| handler(descriptor))
    }

    fn emit(&self, event: &LifecycleEvent) {
        for listener in &self.listeners {
            if let Err(err) = listener.on_event(event) {
                error!(job_id = %event.job_id(), error = %err, "lifecycle listener failed");
            }
        }
    }
}

impl<Q: JobQueue + 'static> JobExecutor<Q> {
    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> Result<JobExecutorHandle, RuntimeError> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, stats_clone))
            .map_err(|e| RuntimeError::Storage(format!("failed to spawn job executor thread: {e}")))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn executor_loop<Q: JobQueue>(
    executor: JobExecutor<Q>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match executor.run_next() {
            Ok(Some(outcome)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to run job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
