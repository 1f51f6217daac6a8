//! Buffered ingestion loop
//!
//! Pages are pulled one at a time and accumulated until the buffer reaches the
//! batch threshold or the stream ends. Each batch is written on a spawned task
//! so the next fetch overlaps the write. At most one write is in flight, and
//! it is always awaited before the next one is submitted, so batches commit
//! in fetch order.

pub mod progress;

pub use progress::{FlushProgress, NoopObserver, PageProgress, ProgressLogger, ProgressObserver};

use feedsync_common::{Event, Page};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::PageSource;
use crate::db::{BatchWriter, WriteOutcome};
use crate::error::{IngestError, Result};

/// Totals for one completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    pub pages_fetched: u64,
    pub events_fetched: u64,
    pub inserted_count: u64,
    /// `next_cursor` of the last page fetched
    pub final_cursor: Option<String>,
    pub flush_count: u64,
}

/// A submitted batch write that has not been folded into the totals yet
struct PendingFlush {
    handle: JoinHandle<Result<WriteOutcome>>,
    batch_size: usize,
    cursor: Option<String>,
}

/// Check that a page claiming more data hands back a usable cursor.
pub fn validate_cursor_advance(used: Option<&str>, next: Option<&str>) -> Result<()> {
    match next {
        None | Some("") => Err(IngestError::PaginationInvariant(
            "hasMore=true but nextCursor is null".to_string(),
        )),
        Some(next) if Some(next) == used => Err(IngestError::PaginationInvariant(
            "cursor did not advance".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

/// Drives a [`PageSource`] into a [`BatchWriter`]
pub struct IngestionLoop<S, W> {
    source: S,
    writer: Arc<W>,
    batch_size: usize,
}

impl<S, W> IngestionLoop<S, W>
where
    S: PageSource,
    W: BatchWriter,
{
    /// `batch_size` below 1 is treated as 1.
    pub fn new(source: S, writer: Arc<W>, batch_size: usize) -> Self {
        Self {
            source,
            writer,
            batch_size: batch_size.max(1),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Ingest from `start_cursor` until the upstream reports no more data.
    ///
    /// On error the in-flight write is still awaited before returning, so
    /// the checkpoint never lags behind rows the caller was told about.
    pub async fn run(
        &mut self,
        start_cursor: Option<String>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<IngestionSummary> {
        let mut summary = IngestionSummary::default();
        let mut cursor = start_cursor;
        let mut buffer: Vec<Event> = Vec::new();
        let mut pending: Option<PendingFlush> = None;

        info!(cursor = ?cursor, batch_size = self.batch_size, "Starting ingestion run");

        loop {
            let page = match self.source.fetch_page(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) if summary.pages_fetched == 0 && cursor.is_some() && e.is_cursor_expired() => {
                    warn!(
                        cursor = ?cursor,
                        "Resume cursor expired upstream, restarting from the beginning of the stream"
                    );
                    cursor = None;
                    continue;
                },
                Err(e) => return Err(abort(e, pending, &mut summary, observer).await),
            };

            summary.pages_fetched += 1;
            summary.events_fetched += page.len() as u64;

            if page.has_more {
                if let Err(e) =
                    validate_cursor_advance(cursor.as_deref(), page.next_cursor.as_deref())
                {
                    return Err(abort(e, pending, &mut summary, observer).await);
                }
            }

            let Page {
                events,
                has_more,
                next_cursor,
            } = page;

            observer.on_page(&PageProgress {
                page_number: summary.pages_fetched,
                events: events.len(),
                has_more,
                next_cursor: next_cursor.as_deref(),
            });

            buffer.extend(events);

            if buffer.len() >= self.batch_size || !has_more {
                settle(pending.take(), &mut summary, observer).await?;

                let batch = std::mem::take(&mut buffer);
                pending = Some(self.submit(batch, next_cursor.clone()));
            }

            if !has_more {
                settle(pending.take(), &mut summary, observer).await?;
                summary.final_cursor = next_cursor;

                info!(
                    pages = summary.pages_fetched,
                    events = summary.events_fetched,
                    inserted = summary.inserted_count,
                    flushes = summary.flush_count,
                    "Ingestion run complete"
                );

                return Ok(summary);
            }

            cursor = next_cursor;
        }
    }

    fn submit(&self, batch: Vec<Event>, cursor: Option<String>) -> PendingFlush {
        let writer = Arc::clone(&self.writer);
        let batch_size = batch.len();
        let task_cursor = cursor.clone();

        debug!(batch_size, cursor = ?cursor, "Submitting batch");

        PendingFlush {
            handle: tokio::spawn(async move { writer.write_batch(batch, task_cursor).await }),
            batch_size,
            cursor,
        }
    }
}

/// Await the in-flight write, if any, and fold its result into the totals.
async fn settle(
    pending: Option<PendingFlush>,
    summary: &mut IngestionSummary,
    observer: &mut dyn ProgressObserver,
) -> Result<()> {
    let Some(pending) = pending else {
        return Ok(());
    };

    let outcome = pending
        .handle
        .await
        .map_err(|e| IngestError::TaskFailed(e.to_string()))??;

    summary.inserted_count += outcome.inserted_count;
    summary.flush_count += 1;

    observer.on_flush(&FlushProgress {
        flush_number: summary.flush_count,
        batch_size: pending.batch_size,
        inserted_count: outcome.inserted_count,
        cursor: pending.cursor.as_deref(),
    });

    Ok(())
}

/// Settle the in-flight write before surfacing `error`.
///
/// A failed write takes precedence: it means the checkpoint did not advance,
/// which is what the operator needs to know first.
async fn abort(
    error: IngestError,
    pending: Option<PendingFlush>,
    summary: &mut IngestionSummary,
    observer: &mut dyn ProgressObserver,
) -> IngestError {
    match settle(pending, summary, observer).await {
        Ok(()) => error,
        Err(write_error) => {
            warn!(error = %error, "Discarding fetch error in favour of failed batch write");
            write_error
        },
    }
}
