use core::str::FromStr;

use serde::{Deserialize, Serialize};

use chunkflow_core::SyncName;

/// Lifecycle phase a job hook dispatches to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Entry job of a run: read the source and split it into chunks.
    Schedule,
    /// Process one persisted chunk.
    ProcessChunk,
    /// One page of a paginated fetch loop.
    Fetch,
    /// Group-complete signal.
    Complete,
    /// Periodic maintenance (retention sweep).
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Schedule,
        Phase::ProcessChunk,
        Phase::Fetch,
        Phase::Complete,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Schedule => "schedule",
            Phase::ProcessChunk => "process_chunk",
            Phase::Fetch => "fetch",
            Phase::Complete => "complete",
            Phase::Cleanup => "cleanup",
        }
    }
}

/// Routing key of a job: `<sync>/<phase>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HookName {
    sync: SyncName,
    phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hook name '{0}'")]
pub struct HookParseError(pub String);

impl HookName {
    pub fn new(sync: SyncName, phase: Phase) -> Self {
        Self { sync, phase }
    }

    pub fn sync(&self) -> &SyncName {
        &self.sync
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Membership test: the hook belongs to `sync` iff its full name contains
    /// the sync's name.
    pub fn belongs_to(&self, sync: &SyncName) -> bool {
        self.to_string().contains(sync.as_str())
    }
}

impl core::fmt::Display for HookName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.sync, self.phase.as_str())
    }
}

impl FromStr for HookName {
    type Err = HookParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sync, phase) = s.rsplit_once('/').ok_or_else(|| HookParseError(s.to_string()))?;
        let phase = Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == phase)
            .ok_or_else(|| HookParseError(s.to_string()))?;
        let sync = SyncName::new(sync).map_err(|_| HookParseError(s.to_string()))?;
        Ok(Self { sync, phase })
    }
}

impl TryFrom<String> for HookName {
    type Error = HookParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HookName> for String {
    fn from(value: HookName) -> Self {
        value.to_string()
    }
}
