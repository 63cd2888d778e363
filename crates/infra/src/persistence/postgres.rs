//! Postgres-backed chunk table.
//!
//! Rows live in `sync_chunks`:
//!
//! | column  | type        |
//! |---------|-------------|
//! | id      | BIGSERIAL   |
//! | job_id  | UUID NULL   |
//! | name    | TEXT        |
//! | group   | TEXT        |
//! | status  | TEXT        |
//! | payload | TEXT        |
//! | start   | TIMESTAMPTZ |
//! | end     | TIMESTAMPTZ |
//!
//! Reads always go to the database; there is no caching layer in front of it.
//! The blocking [`ChunkPersistence`] contract is bridged onto the async pool
//! through a tokio runtime handle.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use chunkflow_core::{Chunk, ChunkId, ChunkPayload, ChunkStatus, GroupName, JobId, SyncName};

use super::{ChunkFilter, ChunkPatch, ChunkPersistence, NewChunk, PersistenceError};

const SELECT_COLUMNS: &str = r#"SELECT id, job_id, name, "group", status, payload, "start", "end" FROM sync_chunks"#;

#[derive(Debug, Clone)]
pub struct PostgresChunkPersistence {
    pool: Arc<PgPool>,
    handle: Option<tokio::runtime::Handle>,
}

impl PostgresChunkPersistence {
    /// Uses whichever tokio runtime is current at call time.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            handle: None,
        }
    }

    /// Drive every query on `handle`, for callers outside a runtime context.
    pub fn with_handle(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle: Some(handle),
        }
    }

    /// Create the chunk table and its lookup index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_chunks (
                id BIGSERIAL PRIMARY KEY,
                job_id UUID NULL,
                name TEXT NOT NULL,
                "group" TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                "start" TIMESTAMPTZ NULL,
                "end" TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS sync_chunks_group_status ON sync_chunks ("group", status)"#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    #[instrument(skip(self, chunk), fields(name = %chunk.name, group = %chunk.group), err)]
    pub async fn insert_row(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_chunks (name, "group", status, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(chunk.name.as_str())
        .bind(chunk.group.as_str())
        .bind(ChunkStatus::Scheduled.as_str())
        .bind(chunk.payload.as_blob())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| PersistenceError::Storage(format!("failed to read id: {e}")))?;
        Ok(ChunkId::new(id as u64))
    }

    #[instrument(skip(self, patch), fields(chunk_id = %id, status = %patch.status), err)]
    pub async fn update_row(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_chunks
            SET status = $1, job_id = $2, "start" = $3, "end" = $4
            WHERE id = $5 AND status = $6
            "#,
        )
        .bind(patch.status.as_str())
        .bind(patch.job_id.map(|job_id| *job_id.as_uuid()))
        .bind(patch.start)
        .bind(patch.end)
        .bind(id.value() as i64)
        .bind(patch.expected.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM sync_chunks WHERE id = $1")
            .bind(id.value() as i64)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_check", e))?
            .is_some();

        if exists {
            Err(PersistenceError::Conflict {
                id,
                expected: patch.expected,
            })
        } else {
            Err(PersistenceError::NotFound(id))
        }
    }

    #[instrument(skip(self), fields(chunk_id = %id), err)]
    pub async fn load_row(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.value() as i64)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_id", e))?;

        row.map(|row| ChunkRow::from_pg(&row).and_then(Chunk::try_from))
            .transpose()
    }

    #[instrument(skip(self, filter), err)]
    pub async fn query_rows(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter()
            .map(|row| ChunkRow::from_pg(row).and_then(Chunk::try_from))
            .collect()
    }

    #[instrument(skip(self, filter), err)]
    pub async fn delete_rows(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("DELETE FROM sync_chunks WHERE id IN (SELECT id FROM sync_chunks");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        debug!(deleted = result.rows_affected(), "deleted chunk rows");
        Ok(result.rows_affected() as usize)
    }

    fn block_on<F, T>(&self, future: F) -> Result<T, PersistenceError>
    where
        F: Future<Output = Result<T, PersistenceError>>,
    {
        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => tokio::runtime::Handle::try_current()
                .map_err(|e| PersistenceError::Storage(format!("no tokio runtime available: {e}")))?,
        };
        handle.block_on(future)
    }
}

impl ChunkPersistence for PostgresChunkPersistence {
    fn insert(&self, chunk: NewChunk) -> Result<ChunkId, PersistenceError> {
        self.block_on(self.insert_row(chunk))
    }

    fn update(&self, id: ChunkId, patch: &ChunkPatch) -> Result<(), PersistenceError> {
        self.block_on(self.update_row(id, patch))
    }

    fn get_by_id(&self, id: ChunkId) -> Result<Option<Chunk>, PersistenceError> {
        self.block_on(self.load_row(id))
    }

    fn query(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, PersistenceError> {
        self.block_on(self.query_rows(filter))
    }

    fn delete(&self, filter: &ChunkFilter) -> Result<usize, PersistenceError> {
        self.block_on(self.delete_rows(filter))
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &ChunkFilter) {
    builder.push(" WHERE TRUE");
    if let Some(name) = &filter.name {
        builder.push(" AND name = ").push_bind(name.as_str().to_string());
    }
    if let Some(group) = &filter.group {
        builder.push(r#" AND "group" = "#).push_bind(group.as_str().to_string());
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        builder.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(cutoff) = filter.reference_before {
        builder
            .push(r#" AND COALESCE("end", "start") < "#)
            .push_bind(cutoff);
    }
}

// SQLx row types

#[derive(Debug)]
struct ChunkRow {
    id: i64,
    job_id: Option<uuid::Uuid>,
    name: String,
    group: String,
    status: String,
    payload: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl ChunkRow {
    fn from_pg(row: &sqlx::postgres::PgRow) -> Result<Self, PersistenceError> {
        let read = |e: sqlx::Error| PersistenceError::Storage(format!("failed to deserialize chunk row: {e}"));
        Ok(ChunkRow {
            id: row.try_get("id").map_err(read)?,
            job_id: row.try_get("job_id").map_err(read)?,
            name: row.try_get("name").map_err(read)?,
            group: row.try_get("group").map_err(read)?,
            status: row.try_get("status").map_err(read)?,
            payload: row.try_get("payload").map_err(read)?,
            start: row.try_get("start").map_err(read)?,
            end: row.try_get("end").map_err(read)?,
        })
    }
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = PersistenceError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        let invalid = |e: chunkflow_core::SyncError| PersistenceError::Storage(format!("invalid chunk row {}: {e}", row.id));
        Ok(Chunk {
            id: ChunkId::new(row.id as u64),
            name: SyncName::new(row.name.clone()).map_err(invalid)?,
            group: GroupName::new(row.group.clone()).map_err(invalid)?,
            status: row.status.parse().map_err(invalid)?,
            payload: ChunkPayload::from_blob(row.payload.clone()),
            job_id: row.job_id.map(JobId::from_uuid),
            start: row.start,
            end: row.end,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            PersistenceError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            PersistenceError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => PersistenceError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
