//! Backoff and retry classification for the events API
//!
//! Everything here is pure. Callers pass in the clock reading and the random
//! source so that delays can be asserted exactly in tests.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Jitter is drawn from `[0, JITTER_RATIO * exponential]`.
pub const JITTER_RATIO: f64 = 0.2;

/// Numeric reset hints at or above these magnitudes are absolute epochs.
const EPOCH_MICROS_THRESHOLD: f64 = 1e15;
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;
const EPOCH_SECONDS_THRESHOLD: f64 = 1e9;

/// 429 and every 5xx may succeed on a later attempt.
pub fn is_retriable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Exponential backoff with bounded jitter.
///
/// `attempt` is 1-based. The delay is `base * 2^(attempt - 1)` capped at `max`,
/// plus jitter in `[0, 0.2 * exponential]`, and the sum is capped at `max` again.
/// `random` must return a value in `[0, 1)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, random: f64) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let max_ms = (max.as_millis() as u64).max(base_ms);

    let exponent = attempt.saturating_sub(1).min(63);
    let exponential = base_ms
        .checked_mul(1u64 << exponent)
        .unwrap_or(u64::MAX)
        .min(max_ms);

    let jitter_window = (exponential as f64 * JITTER_RATIO).floor() as u64;
    let jitter = (random.clamp(0.0, 1.0) * (jitter_window + 1) as f64).floor() as u64;

    Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
}

/// Parse a `Retry-After` header: delay-seconds or an HTTP date.
///
/// Returns `None` when the header is absent, empty, or unparseable. Dates in the
/// past resolve to zero.
pub fn parse_retry_after(header: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = header?.trim();

    if trimmed.is_empty() {
        return None;
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let seconds: u64 = trimmed.parse().ok()?;
        return Some(Duration::from_secs(seconds));
    }

    parse_http_date(trimmed).map(|at| until(at, now))
}

/// Interpret a rate-limit reset hint as a wait duration.
///
/// Small numbers are seconds to wait. Large numbers are absolute Unix epochs in
/// seconds, milliseconds, or microseconds depending on their magnitude. Strings
/// holding a number follow the same rule; other strings are read as dates.
pub fn resolve_reset_delay(value: &serde_json::Value, now: DateTime<Utc>) -> Option<Duration> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(|v| reset_from_number(v, now)),
        serde_json::Value::String(s) => resolve_reset_header(s, now),
        _ => None,
    }
}

/// Header flavour of [`resolve_reset_delay`].
pub fn resolve_reset_header(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return None;
    }

    match trimmed.parse::<f64>() {
        Ok(v) => reset_from_number(v, now),
        Err(_) => parse_http_date(trimmed).map(|at| until(at, now)),
    }
}

fn reset_from_number(value: f64, now: DateTime<Utc>) -> Option<Duration> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let epoch_millis = if value >= EPOCH_MICROS_THRESHOLD {
        value / 1_000.0
    } else if value >= EPOCH_MILLIS_THRESHOLD {
        value
    } else if value >= EPOCH_SECONDS_THRESHOLD {
        value * 1_000.0
    } else {
        return Some(Duration::from_millis((value * 1_000.0).round() as u64));
    };

    let at = DateTime::<Utc>::from_timestamp_millis(epoch_millis.round() as i64)?;
    Some(until(at, now))
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}
