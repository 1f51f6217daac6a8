//! Progress notifications from the ingestion loop

use std::time::{Duration, Instant};
use tracing::info;

/// A page was fetched and buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress<'a> {
    pub page_number: u64,
    pub events: usize,
    pub has_more: bool,
    pub next_cursor: Option<&'a str>,
}

/// A batch flush committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushProgress<'a> {
    pub flush_number: u64,
    pub batch_size: usize,
    pub inserted_count: u64,
    pub cursor: Option<&'a str>,
}

/// Receives loop notifications synchronously, after the step completes.
///
/// Implementations must not block; the loop is waiting on them.
pub trait ProgressObserver: Send {
    fn on_page(&mut self, _page: &PageProgress<'_>) {}

    fn on_flush(&mut self, _flush: &FlushProgress<'_>) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Point-in-time counters reported by [`ProgressLogger`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub pages: u64,
    pub events: u64,
    pub inserted: u64,
    pub total_ingested: i64,
    pub events_per_sec: f64,
    pub inserts_per_sec: f64,
    pub flushes: u64,
    pub cursor: Option<String>,
}

type InstantFn = Box<dyn Fn() -> Instant + Send>;

/// Logs a throughput summary at most once per interval.
pub struct ProgressLogger {
    start_total: i64,
    interval: Duration,
    now: InstantFn,
    started_at: Instant,
    last_logged_at: Instant,
    pages: u64,
    events: u64,
    inserted: u64,
    flushes: u64,
    cursor: Option<String>,
    lines_logged: u64,
}

impl ProgressLogger {
    pub fn new(start_total: i64, interval: Duration) -> Self {
        Self::with_clock(start_total, interval, Box::new(Instant::now))
    }

    pub fn with_clock(start_total: i64, interval: Duration, now: InstantFn) -> Self {
        let started_at = now();
        Self {
            start_total,
            interval: interval.max(Duration::from_millis(1)),
            now,
            started_at,
            last_logged_at: started_at,
            pages: 0,
            events: 0,
            inserted: 0,
            flushes: 0,
            cursor: None,
            lines_logged: 0,
        }
    }

    /// Log the current summary regardless of the interval.
    pub fn flush(&mut self) {
        self.maybe_log(true);
    }

    /// Number of summary lines emitted so far
    pub fn lines_logged(&self) -> u64 {
        self.lines_logged
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = (self.now)()
            .saturating_duration_since(self.started_at)
            .as_secs_f64()
            .max(0.001);

        ProgressSnapshot {
            pages: self.pages,
            events: self.events,
            inserted: self.inserted,
            total_ingested: self.start_total.saturating_add(self.inserted as i64),
            events_per_sec: self.events as f64 / elapsed,
            inserts_per_sec: self.inserted as f64 / elapsed,
            flushes: self.flushes,
            cursor: self.cursor.clone(),
        }
    }

    fn maybe_log(&mut self, force: bool) {
        let now = (self.now)();

        if !force && now.saturating_duration_since(self.last_logged_at) < self.interval {
            return;
        }

        let snapshot = self.snapshot();
        info!(
            pages = snapshot.pages,
            events = snapshot.events,
            inserted = snapshot.inserted,
            total_ingested = snapshot.total_ingested,
            eps = %format!("{:.1}", snapshot.events_per_sec),
            ips = %format!("{:.1}", snapshot.inserts_per_sec),
            flushes = snapshot.flushes,
            cursor = snapshot.cursor.as_deref().unwrap_or("null"),
            "Ingestion progress"
        );

        self.last_logged_at = now;
        self.lines_logged += 1;
    }
}

impl ProgressObserver for ProgressLogger {
    fn on_page(&mut self, page: &PageProgress<'_>) {
        self.pages += 1;
        self.events += page.events as u64;
        self.cursor = page.next_cursor.map(str::to_string);
        self.maybe_log(false);
    }

    fn on_flush(&mut self, flush: &FlushProgress<'_>) {
        self.flushes += 1;
        self.inserted += flush.inserted_count;
        self.cursor = flush.cursor.map(str::to_string);
        self.maybe_log(false);
    }
}
