//! Common test utilities for feedsync integration tests using testcontainers
//!
//! Each test gets its own PostgreSQL container with migrations applied.
//! Requires a running Docker daemon, so tests using it are `#[ignore]`d:
//!
//! ```text
//! cargo test -p feedsync-ingest --test storage_tests -- --ignored
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

/// PostgreSQL version used by the test containers
pub const POSTGRES_TAG: &str = "16-alpine";

/// PostgreSQL test container with the feedsync schema applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag(POSTGRES_TAG)
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        feedsync_ingest::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { container, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    /// Number of rows in `ingested_events`
    pub async fn event_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingested_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
