//! Job runtime vocabulary shared by the engine and runtime adapters.
//!
//! - [`HookName`]: `<sync>/<phase>` routing key of a job
//! - [`JobDescriptor`]: what the runtime reports about a job (`fetchJob`)
//! - [`LifecycleEvent`]: begin/completed/failed notifications
//! - [`LifecycleListener`]: subscriber interface for those notifications

pub mod descriptor;
pub mod hook;
pub mod lifecycle;

pub use descriptor::{JobArgs, JobDescriptor};
pub use hook::{HookName, HookParseError, Phase};
pub use lifecycle::{LifecycleEvent, LifecycleListener};
