//! PostgreSQL access: pool setup, migrations, checkpoint, and batch writer

pub mod checkpoint;
pub mod writer;

pub use checkpoint::CheckpointStore;
pub use writer::{BatchWriter, BulkWriter, WriteOutcome};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: crate::config::DEFAULT_DATABASE_URL.to_string(),
            max_connections: crate::config::DEFAULT_DB_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout_secs: crate::config::DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(600),
        }
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    let pool = options.connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Apply pending migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
