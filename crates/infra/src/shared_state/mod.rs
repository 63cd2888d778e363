//! Shared-state store: keyed, TTL'd values guarded by a trylock.
//!
//! Each key `k` may have a companion `k_lock` entry. Its presence means the
//! lock is held; its TTL bounds how long a crashed holder can block others.
//! Concurrent writers must go through [`SharedStateStore::update`], which
//! takes the lock, merges, writes and releases.

pub mod backend;
#[cfg(feature = "redis")]
pub mod redis;

pub use backend::{InMemorySharedState, SharedStateBackend, SharedStateError};
#[cfg(feature = "redis")]
pub use redis::RedisSharedStateBackend;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use chunkflow_core::{Clock, MergeOptions, SyncError, SyncResult, merge_values};

use crate::retry::RetryPolicy;

/// Suffix of the lock entry guarding a key.
pub const LOCK_SUFFIX: &str = "_lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedStateConfig {
    /// TTL applied by `set(.., None)` and `update`
    pub default_ttl: Duration,
    /// TTL of the lock entry taken by `update`
    pub lock_ttl: Duration,
    /// Lock attempts made by `update` before giving up
    pub lock_retry: RetryPolicy,
}

impl Default for SharedStateConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(6 * 3600),
            lock_ttl: Duration::from_secs(30),
            lock_retry: RetryPolicy::fixed(5, Duration::from_secs(1)),
        }
    }
}

/// Proof of a successful `acquire`. Only the matching token releases the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    fn as_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

/// Client handle passed explicitly to every component that shares state.
pub struct SharedStateStore {
    backend: Arc<dyn SharedStateBackend>,
    clock: Arc<dyn Clock>,
    config: SharedStateConfig,
}

impl SharedStateStore {
    pub fn new(backend: Arc<dyn SharedStateBackend>, clock: Arc<dyn Clock>, config: SharedStateConfig) -> Self {
        Self { backend, clock, config }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(InMemorySharedState::arc(clock.clone()), clock, SharedStateConfig::default())
    }

    pub fn config(&self) -> &SharedStateConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.backend.get(key)?)
    }

    /// Write `value` directly. Use `update` when other executions may write
    /// the same key concurrently.
    pub fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> SyncResult<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        Ok(self.backend.set(key, value, Some(ttl))?)
    }

    pub fn delete(&self, key: &str) -> SyncResult<bool> {
        Ok(self.backend.delete(key)?)
    }

    /// Non-blocking trylock on `key`. Fails with `Locked` if the lock entry exists.
    pub fn acquire(&self, key: &str, ttl: Duration) -> SyncResult<LockToken> {
        let token = LockToken::new();
        if !self.backend.insert_if_absent(&lock_key(key), &token.as_value(), ttl)? {
            return Err(SyncError::Locked(key.to_string()));
        }
        debug!(key, "shared state lock acquired");
        Ok(token)
    }

    /// Delete the lock entry of `key` if `token` still owns it. Returns false
    /// when the lock expired and was taken by someone else, who keeps it.
    pub fn release(&self, key: &str, token: &LockToken) -> SyncResult<bool> {
        let released = self.backend.delete_if_eq(&lock_key(key), &token.as_value())?;
        if !released {
            warn!(key, "shared state lock expired before release");
        }
        Ok(released)
    }

    /// Lock, merge `patch` into the current value (an empty map when absent),
    /// write, unlock. Returns the merged value.
    ///
    /// A held lock is retried per `config.lock_retry`; when the attempts run
    /// out this fails with `LockTimeout`.
    pub fn update(&self, key: &str, patch: Value, options: MergeOptions) -> SyncResult<Value> {
        let token = self.lock_with_retry(key)?;

        let result = self.merge_and_write(key, patch, options);
        let released = self.release(key, &token);
        let merged = result?;
        released?;
        Ok(merged)
    }

    fn lock_with_retry(&self, key: &str) -> SyncResult<LockToken> {
        let policy = &self.config.lock_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.acquire(key, self.config.lock_ttl) {
                Ok(token) => return Ok(token),
                Err(SyncError::Locked(_)) if policy.should_retry(attempt) => {
                    warn!(key, attempt, "shared state key locked, retrying");
                    self.clock.sleep(policy.delay);
                }
                Err(SyncError::Locked(_)) => {
                    return Err(SyncError::LockTimeout {
                        key: key.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn merge_and_write(&self, key: &str, patch: Value, options: MergeOptions) -> SyncResult<Value> {
        let current = self
            .backend
            .get(key)?
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let merged = merge_values(current, patch, options);
        self.backend.set(key, &merged, Some(self.config.default_ttl))?;
        Ok(merged)
    }
}

fn lock_key(key: &str) -> String {
    format!("{key}{LOCK_SUFFIX}")
}
