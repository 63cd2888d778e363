//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Store-assigned identifier of a persisted chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ChunkId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| SyncError::invalid_id(format!("ChunkId: {e}")))
    }
}

/// Identifier of a job execution record owned by the job runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so ids sort in creation order.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for JobId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s).map_err(|e| SyncError::invalid_id(format!("JobId: {e}")))?;
        Ok(Self(uuid))
    }
}

macro_rules! impl_name_newtype {
    ($t:ident, $label:literal) => {
        impl $t {
            /// Build a name, rejecting empty or whitespace-only input.
            pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(SyncError::validation(concat!($label, " must not be empty")));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

/// Deterministic name of a sync definition, stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncName(String);

/// Name of one run; every chunk and job of the run shares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(String);

impl_name_newtype!(SyncName, "sync name");
impl_name_newtype!(GroupName, "group name");

impl GroupName {
    /// Fresh group name for a new run of `sync`:
    /// `<sync>_<unix millis>_<8 random hex digits>`. Two runs started at the
    /// same instant still get distinct groups.
    pub fn for_run(sync: &SyncName, at: chrono::DateTime<chrono::Utc>) -> Self {
        let nonce = Uuid::now_v7().simple().to_string();
        Self(format!("{}_{}_{}", sync.as_str(), at.timestamp_millis(), &nonce[24..]))
    }
}
