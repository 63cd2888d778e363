//! Redis-backed shared-state backend.
//!
//! - `GET` / `SET key value PX ttl` for plain entries
//! - `SET key value NX PX ttl` as the atomic trylock primitive
//! - `DEL` for deletes
//! - a `GET`-compare-`DEL` script for token-checked lock release
//!
//! Values are stored as JSON strings under `<prefix><key>`. Every call goes to
//! Redis; nothing is cached locally.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use super::backend::{SharedStateBackend, SharedStateError};

/// Default key prefix
const DEFAULT_PREFIX: &str = "chunkflow:";

const DELETE_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisSharedStateBackend {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisSharedStateBackend {
    /// Open a client for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, SharedStateError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| SharedStateError::Backend(format!("redis connection error: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn connection(&self) -> Result<redis::Connection, SharedStateError> {
        self.client
            .get_connection()
            .map_err(|e| SharedStateError::Backend(format!("redis connection error: {e}")))
    }
}

fn command_error(e: redis::RedisError) -> SharedStateError {
    SharedStateError::Backend(format!("redis command error: {e}"))
}

fn encode(value: &Value) -> Result<String, SharedStateError> {
    serde_json::to_string(value).map_err(|e| SharedStateError::Serialization(e.to_string()))
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl SharedStateBackend for RedisSharedStateBackend {
    #[instrument(skip(self), err)]
    fn get(&self, key: &str) -> Result<Option<Value>, SharedStateError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(command_error)?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(|e| SharedStateError::Serialization(e.to_string())))
            .transpose()
    }

    #[instrument(skip(self, value), err)]
    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), SharedStateError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(encode(value)?);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query(&mut conn).map_err(command_error)?;
        Ok(())
    }

    #[instrument(skip(self, value), err)]
    fn insert_if_absent(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, SharedStateError> {
        let mut conn = self.connection()?;
        // Replies OK when the key was set and nil when it already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(encode(value)?)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(command_error)?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), err)]
    fn delete(&self, key: &str) -> Result<bool, SharedStateError> {
        let mut conn = self.connection()?;
        let removed: u64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query(&mut conn)
            .map_err(command_error)?;
        Ok(removed > 0)
    }

    #[instrument(skip(self, expected), err)]
    fn delete_if_eq(&self, key: &str, expected: &Value) -> Result<bool, SharedStateError> {
        let mut conn = self.connection()?;
        let removed: u64 = redis::Script::new(DELETE_IF_EQ)
            .key(self.key(key))
            .arg(encode(expected)?)
            .invoke(&mut conn)
            .map_err(command_error)?;
        Ok(removed > 0)
    }
}
