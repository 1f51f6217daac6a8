//! Error types for the ingestion pipeline

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Marker upstream puts in the error body when a resume cursor is too old.
pub const CURSOR_EXPIRED_CODE: &str = "CURSOR_EXPIRED";

/// Everything that can stop an ingestion run.
///
/// Only [`IngestError::Transport`], [`IngestError::Timeout`], and retriable
/// [`IngestError::Upstream`] statuses are recovered inside the fetch client.
/// The rest abort the run; the checkpoint is untouched so a restart resumes
/// from the last committed batch.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Connection reset, DNS failure, truncated body
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout
    #[error("Events request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Upstream answered with a non-success status
    #[error("{}", upstream_message(*status, body))]
    Upstream { status: u16, body: String },

    /// Upstream answered 2xx with a body we cannot reconcile into a page
    #[error("Malformed events response: {0}")]
    MalformedResponse(String),

    /// Upstream said there is more data but the cursor did not advance
    #[error("Invalid pagination state: {0}")]
    PaginationInvariant(String),

    /// Database error; the surrounding transaction has been rolled back
    #[error("Storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("ingestion_state singleton row missing (id=1)")]
    CheckpointMissing,

    #[error("insertedCount cannot be negative: {0}")]
    InvalidInsertedCount(i64),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A spawned flush task panicked or was cancelled
    #[error("Flush task failed: {0}")]
    TaskFailed(String),
}

fn upstream_message(status: u16, body: &str) -> String {
    if body.is_empty() {
        format!("Events API request failed with status {}", status)
    } else {
        format!("Events API request failed with status {}: {}", status, body)
    }
}

impl IngestError {
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the fetch client may retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Transport(_) | IngestError::Timeout(_) => true,
            IngestError::Upstream { status, .. } => crate::api::retry::is_retriable_status(*status),
            _ => false,
        }
    }

    /// Upstream rejected the cursor because it is no longer valid.
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, IngestError::Upstream { body, .. } if body.contains(CURSOR_EXPIRED_CODE))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Transport(err.to_string())
    }
}
