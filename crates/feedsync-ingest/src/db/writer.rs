//! Transactional batch writer
//!
//! One call to [`BulkWriter::write_batch`] is one flush: deduplicate, insert
//! with `ON CONFLICT DO NOTHING`, and advance the checkpoint, all inside a
//! single transaction. Either the rows and the new cursor both become
//! visible or neither does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_common::{Checkpoint, Event};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::checkpoint::CheckpointStore;
use crate::error::{IngestError, Result};

/// Upper bound on rows per INSERT statement.
pub const MAX_INSERT_EVENTS_PER_STATEMENT: usize = 5_000;

const INSERT_EVENTS_SQL: &str = r#"
    INSERT INTO ingested_events (event_id, occurred_at, payload)
    SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::jsonb[])
    ON CONFLICT (event_id) DO NOTHING
"#;

/// Result of one committed flush
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Rows actually inserted (duplicates and already-stored ids excluded)
    pub inserted_count: u64,
    /// Checkpoint as committed with this batch
    pub checkpoint: Checkpoint,
}

/// Destination for batches produced by the ingestion loop
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    /// Persist `events` and make `next_cursor` the resume point, atomically.
    async fn write_batch(
        &self,
        events: Vec<Event>,
        next_cursor: Option<String>,
    ) -> Result<WriteOutcome>;
}

/// Drop repeated ids, keeping the first occurrence in place.
pub fn dedupe_events_by_id(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::with_capacity(events.len());
    events
        .into_iter()
        .filter(|event| seen.insert(event.event_id.clone()))
        .collect()
}

/// PostgreSQL [`BatchWriter`] holding one cached connection.
///
/// The connection is reused across flushes. After any failure it is closed
/// instead of being returned to the pool, and the next flush acquires a
/// fresh one.
pub struct BulkWriter {
    pool: PgPool,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
    chunk_size: usize,
}

impl BulkWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            conn: Mutex::new(None),
            chunk_size: MAX_INSERT_EVENTS_PER_STATEMENT,
        }
    }

    /// Override the per-statement row limit (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Release the cached connection back to the pool.
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }

    /// Whether a connection is currently cached.
    pub async fn has_cached_connection(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn flush(&self, events: Vec<Event>, next_cursor: Option<String>) -> Result<WriteOutcome> {
        let events = dedupe_events_by_id(events);

        let mut cached = self.conn.lock().await;
        let mut conn = match cached.take() {
            Some(conn) => conn,
            None => self.pool.acquire().await?,
        };

        let result = self
            .write_in_transaction(&mut conn, &events, next_cursor.as_deref())
            .await;

        match result {
            Ok(outcome) => {
                *cached = Some(conn);
                debug!(
                    events = events.len(),
                    inserted = outcome.inserted_count,
                    cursor = ?outcome.checkpoint.cursor,
                    "Batch committed"
                );
                Ok(outcome)
            },
            Err(e) => {
                warn!(error = %e, events = events.len(), "Batch write failed, discarding connection");
                if let Err(close_err) = conn.close().await {
                    warn!(error = %close_err, "Failed to close discarded connection");
                }
                Err(e)
            },
        }
    }

    async fn write_in_transaction(
        &self,
        conn: &mut PgConnection,
        events: &[Event],
        next_cursor: Option<&str>,
    ) -> Result<WriteOutcome> {
        let mut tx = conn.begin().await?;

        match self.apply(&mut tx, events, next_cursor).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            },
        }
    }

    async fn apply(
        &self,
        conn: &mut PgConnection,
        events: &[Event],
        next_cursor: Option<&str>,
    ) -> Result<WriteOutcome> {
        let mut inserted_count: u64 = 0;

        for chunk in events.chunks(self.chunk_size) {
            inserted_count += insert_chunk(conn, chunk).await?;
        }

        let inserted = i64::try_from(inserted_count)
            .map_err(|_| IngestError::InvalidInsertedCount(i64::MAX))?;
        let checkpoint = CheckpointStore::advance(conn, next_cursor, inserted).await?;

        Ok(WriteOutcome {
            inserted_count,
            checkpoint,
        })
    }
}

#[async_trait]
impl BatchWriter for BulkWriter {
    async fn write_batch(
        &self,
        events: Vec<Event>,
        next_cursor: Option<String>,
    ) -> Result<WriteOutcome> {
        self.flush(events, next_cursor).await
    }
}

async fn insert_chunk(conn: &mut PgConnection, chunk: &[Event]) -> Result<u64> {
    let mut ids: Vec<String> = Vec::with_capacity(chunk.len());
    let mut occurred: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(chunk.len());
    let mut payloads: Vec<Json<serde_json::Value>> = Vec::with_capacity(chunk.len());

    for event in chunk {
        ids.push(event.event_id.clone());
        occurred.push(event.occurred_at.instant());
        payloads.push(Json(event.to_payload()));
    }

    let result = sqlx::query(INSERT_EVENTS_SQL)
        .bind(ids)
        .bind(occurred)
        .bind(payloads)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
