//! feedsync-ingest - pull the upstream event feed into PostgreSQL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedsync_common::logging::{init_logging, LogConfig, LogLevel};
use feedsync_ingest::api::{run_live_discovery, should_run_live_discovery, FetchClient, FetchConfig};
use feedsync_ingest::db::{self, BulkWriter, CheckpointStore};
use feedsync_ingest::pipeline::{IngestionLoop, ProgressLogger};
use feedsync_ingest::IngestConfig;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "feedsync-ingest")]
#[command(author, version, about = "Resumable event feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest from the saved checkpoint until the feed is exhausted
    Run {
        /// Events buffered before a batch is written
        #[arg(long, env = "WRITE_BATCH_SIZE")]
        batch_size: Option<usize>,

        /// Events requested per page
        #[arg(long, env = "API_PAGE_LIMIT")]
        page_limit: Option<u32>,

        /// Probe the live API even when resuming
        #[arg(long)]
        force_discovery: bool,
    },

    /// Apply pending database migrations
    Migrate,

    /// Show the current checkpoint
    Status,

    /// Fetch one small page and log the response shape
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::default()
        .with_level(log_level)
        .with_file_prefix("feedsync-ingest")
        .merge_env()?;

    init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            batch_size,
            page_limit,
            force_discovery,
        } => {
            let mut config = config;
            if let Some(batch_size) = batch_size {
                config.write_batch_size = batch_size;
            }
            if let Some(page_limit) = page_limit {
                config.page_limit = page_limit;
            }
            if force_discovery {
                config.live_discovery_on_resume = true;
            }
            config.validate()?;

            run(&config).await?;
        },
        Command::Migrate => {
            let pool = db::create_pool(&config.db_config()).await?;
            db::run_migrations(&pool).await?;
            info!("Migrations complete");
        },
        Command::Status => {
            let pool = db::create_pool(&config.db_config()).await?;
            let checkpoint = CheckpointStore::new(pool).load().await?;
            info!(
                cursor = checkpoint.cursor.as_deref().unwrap_or("null"),
                total_ingested = checkpoint.total_ingested,
                updated_at = %checkpoint.updated_at,
                "Checkpoint"
            );
        },
        Command::Discover => {
            let client = FetchClient::new(FetchConfig::from(&config))?;
            run_live_discovery(&client).await?;
        },
    }

    Ok(())
}

async fn run(config: &IngestConfig) -> Result<()> {
    info!(
        mode = %config.api_mode,
        base_url = %config.api_base_url,
        page_limit = config.page_limit,
        batch_size = config.write_batch_size,
        "Starting ingestion"
    );

    let pool = db::create_pool(&config.db_config())
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool).await?;
    db::health_check(&pool).await?;

    let checkpoint = CheckpointStore::new(pool.clone()).load().await?;
    info!(
        cursor = checkpoint.cursor.as_deref().unwrap_or("null"),
        total_ingested = checkpoint.total_ingested,
        "Resuming from checkpoint"
    );

    let client = FetchClient::new(FetchConfig::from(config))?;

    if should_run_live_discovery(
        config.api_mode,
        checkpoint.total_ingested,
        config.live_discovery_on_resume,
    ) {
        if let Err(e) = run_live_discovery(&client).await {
            warn!(error = %e, "Live discovery failed, continuing with ingestion");
        }
    }

    let writer = Arc::new(BulkWriter::new(pool));
    let mut progress = ProgressLogger::new(checkpoint.total_ingested, config.progress_log_interval);
    let mut ingestion = IngestionLoop::new(client, Arc::clone(&writer), config.write_batch_size);

    let result = ingestion.run(checkpoint.cursor, &mut progress).await;

    progress.flush();
    writer.close().await;

    let summary = result.context("Ingestion run failed")?;

    info!(
        pages = summary.pages_fetched,
        events = summary.events_fetched,
        inserted = summary.inserted_count,
        flushes = summary.flush_count,
        total_ingested = checkpoint.total_ingested + summary.inserted_count as i64,
        final_cursor = summary.final_cursor.as_deref().unwrap_or("null"),
        "Ingestion complete"
    );

    Ok(())
}
