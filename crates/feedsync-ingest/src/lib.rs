//! feedsync ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable ingestion of a paginated event feed into PostgreSQL.
//!
//! - **api**: fetch client with retries, backoff, and rate-limit pacing, plus
//!   normalization of the upstream page shapes
//! - **db**: transactional batch writer and the resume checkpoint
//! - **pipeline**: the buffered loop that overlaps fetching with writing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedsync_ingest::api::{FetchClient, FetchConfig};
//! use feedsync_ingest::db::{self, BulkWriter, CheckpointStore};
//! use feedsync_ingest::pipeline::{IngestionLoop, NoopObserver};
//! use feedsync_ingest::IngestConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pool = db::create_pool(&config.db_config()).await?;
//!     db::run_migrations(&pool).await?;
//!
//!     let checkpoint = CheckpointStore::new(pool.clone()).load().await?;
//!     let client = FetchClient::new(FetchConfig::from(&config))?;
//!     let writer = Arc::new(BulkWriter::new(pool));
//!
//!     let mut ingestion = IngestionLoop::new(client, writer, config.write_batch_size);
//!     let summary = ingestion.run(checkpoint.cursor, &mut NoopObserver).await?;
//!     println!("inserted {} events", summary.inserted_count);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;

pub use config::{ApiMode, IngestConfig};
pub use error::{IngestError, Result};
pub use pipeline::{IngestionLoop, IngestionSummary};
