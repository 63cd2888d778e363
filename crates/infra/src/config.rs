//! Engine configuration loaded from the environment, and store selection.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};

use chunkflow_core::{Clock, SyncError, SyncResult};

use crate::chunks::RetentionPolicy;
use crate::pagination::PaginationConfig;
use crate::persistence::{ChunkPersistence, InMemoryChunkPersistence, PostgresChunkPersistence};
use crate::retry::RetryPolicy;
use crate::shared_state::{InMemorySharedState, SharedStateBackend, SharedStateConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retention_days: i64,
    pub retention_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_retry_attempts: u32,
    pub lock_retry_delay: Duration,
    pub state_ttl: Duration,
    /// Rate-limit intervals above this schedule the next fetch as a delayed job.
    pub delayed_fetch_threshold: Duration,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            retention_interval: Duration::from_secs(86_400),
            lock_ttl: Duration::from_secs(30),
            lock_retry_attempts: 5,
            lock_retry_delay: Duration::from_millis(1000),
            state_ttl: Duration::from_secs(21_600),
            delayed_fetch_threshold: Duration::from_secs(15),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read `CHUNKFLOW_*`, `USE_PERSISTENT_STORES`, `DATABASE_URL` and `REDIS_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str, default: u64| -> u64 {
            match lookup(name) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(variable = name, value = %raw, default, "invalid numeric setting, using default");
                    default
                }),
            }
        };

        Self {
            retention_days: number("CHUNKFLOW_RETENTION_DAYS", defaults.retention_days as u64) as i64,
            retention_interval: Duration::from_secs(number(
                "CHUNKFLOW_RETENTION_INTERVAL_SECS",
                defaults.retention_interval.as_secs(),
            )),
            lock_ttl: Duration::from_secs(number("CHUNKFLOW_LOCK_TTL_SECS", defaults.lock_ttl.as_secs())),
            lock_retry_attempts: number(
                "CHUNKFLOW_LOCK_RETRY_ATTEMPTS",
                defaults.lock_retry_attempts as u64,
            ) as u32,
            lock_retry_delay: Duration::from_millis(number(
                "CHUNKFLOW_LOCK_RETRY_DELAY_MS",
                defaults.lock_retry_delay.as_millis() as u64,
            )),
            state_ttl: Duration::from_secs(number("CHUNKFLOW_STATE_TTL_SECS", defaults.state_ttl.as_secs())),
            delayed_fetch_threshold: Duration::from_secs(number(
                "CHUNKFLOW_DELAYED_FETCH_THRESHOLD_SECS",
                defaults.delayed_fetch_threshold.as_secs(),
            )),
            use_persistent_stores: lookup("USE_PERSISTENT_STORES")
                .and_then(|raw| raw.trim().parse::<bool>().ok())
                .unwrap_or(false),
            database_url: lookup("DATABASE_URL"),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
        }
    }

    pub fn shared_state(&self) -> SharedStateConfig {
        SharedStateConfig {
            default_ttl: self.state_ttl,
            lock_ttl: self.lock_ttl,
            lock_retry: RetryPolicy::fixed(self.lock_retry_attempts, self.lock_retry_delay),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::days(self.retention_days)
    }

    /// Pagination settings for `chunk_size` with the configured delayed-fetch threshold.
    pub fn pagination(&self, chunk_size: usize) -> PaginationConfig {
        PaginationConfig::new(chunk_size).with_delayed_threshold(self.delayed_fetch_threshold)
    }
}

/// Backing stores picked from the configuration.
pub struct Stores {
    pub persistence: Arc<dyn ChunkPersistence>,
    pub shared_state: Arc<dyn SharedStateBackend>,
}

impl Stores {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            persistence: InMemoryChunkPersistence::arc(),
            shared_state: InMemorySharedState::arc(clock),
        }
    }

    /// Postgres + Redis when `use_persistent_stores` is set, in-memory otherwise.
    ///
    /// Without the `redis` feature the shared state falls back to memory even in
    /// persistent mode.
    pub async fn connect(config: &EngineConfig, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        if !config.use_persistent_stores {
            info!("using in-memory stores");
            return Ok(Self::in_memory(clock));
        }

        let database_url = config.database_url.as_deref().ok_or_else(|| {
            SyncError::validation("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")
        })?;
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| SyncError::storage(format!("failed to connect to Postgres: {e}")))?;
        let persistence = PostgresChunkPersistence::new(pool);
        persistence.ensure_schema().await?;

        Ok(Self {
            persistence: Arc::new(persistence),
            shared_state: shared_state_backend(config, clock)?,
        })
    }
}

#[cfg(feature = "redis")]
fn shared_state_backend(config: &EngineConfig, _clock: Arc<dyn Clock>) -> SyncResult<Arc<dyn SharedStateBackend>> {
    let backend = crate::shared_state::RedisSharedStateBackend::new(&config.redis_url, None)?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
fn shared_state_backend(_config: &EngineConfig, clock: Arc<dyn Clock>) -> SyncResult<Arc<dyn SharedStateBackend>> {
    warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, shared state stays in memory");
    Ok(InMemorySharedState::arc(clock))
}
