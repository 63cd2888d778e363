//! Durable key/value backends under the shared-state store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use chunkflow_core::{Clock, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SharedStateError {
    #[error("shared state backend error: {0}")]
    Backend(String),
    #[error("shared state value is not valid JSON: {0}")]
    Serialization(String),
}

impl From<SharedStateError> for SyncError {
    fn from(value: SharedStateError) -> Self {
        match value {
            SharedStateError::Backend(msg) => SyncError::Storage(msg),
            SharedStateError::Serialization(msg) => SyncError::Serialization(msg),
        }
    }
}

/// Key/value storage with per-entry expiry. Reads are served straight from
/// the store; implementations must not cache.
pub trait SharedStateBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError>;

    /// Write `value`, replacing any previous entry. `None` means no expiry.
    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), SharedStateError>;

    /// Atomically write `value` only if `key` is absent or expired. Returns
    /// whether the write happened.
    fn insert_if_absent(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, SharedStateError>;

    /// Remove `key`. Returns whether an entry existed.
    fn delete(&self, key: &str) -> Result<bool, SharedStateError>;

    /// Atomically remove `key` only while it holds `expected`. Returns whether
    /// the entry was removed.
    fn delete_if_eq(&self, key: &str, expected: &Value) -> Result<bool, SharedStateError>;
}

impl<B> SharedStateBackend for Arc<B>
where
    B: SharedStateBackend + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), SharedStateError> {
        (**self).set(key, value, ttl)
    }

    fn insert_if_absent(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, SharedStateError> {
        (**self).insert_if_absent(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, SharedStateError> {
        (**self).delete(key)
    }

    fn delete_if_eq(&self, key: &str, expected: &Value) -> Result<bool, SharedStateError> {
        (**self).delete_if_eq(key, expected)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory backend for tests/dev. Expiry follows the injected clock.
pub struct InMemorySharedState {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySharedState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX))
    }
}

fn poisoned() -> SharedStateError {
    SharedStateError::Backend("shared state lock poisoned".to_string())
}

impl SharedStateBackend for InMemorySharedState {
    fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), SharedStateError> {
        let entry = Entry {
            value: value.clone(),
            expires_at: self.expiry(ttl),
        };
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), entry);
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, SharedStateError> {
        let now = self.clock.now();
        let expires_at = self.expiry(Some(ttl));
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, SharedStateError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    fn delete_if_eq(&self, key: &str, expected: &Value) -> Result<bool, SharedStateError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && &entry.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}
