//! Explicit `(sync, phase) -> handler` registry, assembled at startup.

use std::collections::HashMap;
use std::sync::Arc;

use chunkflow_core::SyncResult;
use chunkflow_events::{HookName, JobDescriptor};

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&JobDescriptor) -> SyncResult<()> + Send + Sync>;

/// Handlers keyed by hook. Built mutably during wiring, then handed to a
/// [`super::JobExecutor`] which only ever reads it.
#[derive(Default, Clone)]
pub struct HookRegistry {
    handlers: HashMap<HookName, Vec<JobHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Several handlers on one hook run in registration order.
    pub fn register<F>(&mut self, hook: HookName, handler: F)
    where
        F: Fn(&JobDescriptor) -> SyncResult<()> + Send + Sync + 'static,
    {
        self.handlers.entry(hook).or_default().push(Arc::new(handler));
    }

    pub fn handlers_for(&self, hook: &HookName) -> &[JobHandler] {
        self.handlers.get(hook).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, hook: &HookName) -> bool {
        !self.handlers_for(hook).is_empty()
    }

    pub fn hooks(&self) -> impl Iterator<Item = &HookName> {
        self.handlers.keys()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
