//! Singleton resume checkpoint (`ingestion_state`, id = 1)

use chrono::{DateTime, Utc};
use feedsync_common::Checkpoint;
use sqlx::{PgConnection, PgPool};

use crate::error::{IngestError, Result};

/// Fixed key of the checkpoint row
pub const CHECKPOINT_ID: i16 = 1;

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    cursor: Option<String>,
    total_ingested: i64,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            cursor: row.cursor,
            total_ingested: row.total_ingested,
            updated_at: row.updated_at,
        }
    }
}

/// Reads and advances the resume checkpoint
#[derive(Clone)]
pub struct CheckpointStore {
    pool: PgPool,
}

impl CheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read the checkpoint to decide where a run resumes.
    pub async fn load(&self) -> Result<Checkpoint> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT cursor, total_ingested, updated_at
            FROM ingestion_state
            WHERE id = $1
            "#,
        )
        .bind(CHECKPOINT_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Checkpoint::from).ok_or(IngestError::CheckpointMissing)
    }

    /// Set the cursor and add `inserted` to the running total.
    ///
    /// Must run on the connection holding the batch transaction so that the
    /// inserted rows and the checkpoint commit together.
    pub async fn advance(
        conn: &mut PgConnection,
        cursor: Option<&str>,
        inserted: i64,
    ) -> Result<Checkpoint> {
        if inserted < 0 {
            return Err(IngestError::InvalidInsertedCount(inserted));
        }

        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            UPDATE ingestion_state
            SET cursor = $1,
                total_ingested = total_ingested + $2,
                updated_at = NOW()
            WHERE id = $3
            RETURNING cursor, total_ingested, updated_at
            "#,
        )
        .bind(cursor)
        .bind(inserted)
        .bind(CHECKPOINT_ID)
        .fetch_optional(conn)
        .await?;

        row.map(Checkpoint::from).ok_or(IngestError::CheckpointMissing)
    }
}
