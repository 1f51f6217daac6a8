//! Normalization of upstream page payloads
//!
//! The events API has shipped several response shapes over time. This module
//! accepts all of them and produces a canonical [`Page`]:
//!
//! - events under `data` or `events`
//! - ids under `eventId`, `event_id`, or `id`
//! - timestamps under `occurredAt`, `occurred_at`, or `timestamp`, as ISO strings
//!   or epoch numbers in seconds, milliseconds, microseconds, or nanoseconds
//! - pagination fields at the top level or nested under `pagination`, in
//!   camelCase or snake_case

use chrono::{DateTime, Utc};
use feedsync_common::{Event, OccurredAt, Page};
use serde_json::{Map, Value};

use crate::error::{IngestError, Result};

const EVENT_ARRAY_KEYS: [&str; 2] = ["data", "events"];
const EVENT_ID_KEYS: [&str; 3] = ["eventId", "event_id", "id"];
const OCCURRED_AT_KEYS: [&str; 3] = ["occurredAt", "occurred_at", "timestamp"];
const HAS_MORE_KEYS: [&str; 2] = ["hasMore", "has_more"];
const NEXT_CURSOR_KEYS: [&str; 2] = ["nextCursor", "next_cursor"];

/// First non-null value among `keys`
fn first_present<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}

/// Like [`first_present`], but also looks inside a nested `pagination` object.
fn pagination_field<'a>(
    payload: &'a Map<String, Value>,
    pagination: Option<&'a Map<String, Value>>,
    keys: &[&str],
) -> Option<&'a Value> {
    first_present(payload, keys).or_else(|| pagination.and_then(|p| first_present(p, keys)))
}

/// Normalize a decoded response body into a [`Page`].
pub fn parse_events_page(payload: &Value) -> Result<Page> {
    let payload = payload
        .as_object()
        .ok_or_else(|| IngestError::malformed("expected object"))?;

    let pagination = payload.get("pagination").and_then(Value::as_object);

    let next_cursor = pagination_field(payload, pagination, &NEXT_CURSOR_KEYS)
        .and_then(Value::as_str)
        .map(str::to_string);

    let has_more = pagination_field(payload, pagination, &HAS_MORE_KEYS)
        .and_then(coerce_bool)
        .unwrap_or_else(|| next_cursor.as_deref().is_some_and(|c| !c.is_empty()));

    let data = EVENT_ARRAY_KEYS
        .iter()
        .filter_map(|key| payload.get(*key))
        .find_map(Value::as_array)
        .ok_or_else(|| IngestError::malformed("data must be an array"))?;

    let events = data.iter().map(parse_event).collect::<Result<Vec<_>>>()?;

    Ok(Page {
        events,
        has_more,
        next_cursor,
    })
}

fn parse_event(value: &Value) -> Result<Event> {
    let record = value
        .as_object()
        .ok_or_else(|| IngestError::malformed("event must be an object"))?;

    let event_id = match first_present(record, &EVENT_ID_KEYS) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => return Err(IngestError::malformed("missing event id")),
    };

    let occurred_at = match first_present(record, &OCCURRED_AT_KEYS) {
        Some(candidate) => OccurredAt::from(parse_occurred_at(candidate)),
        None if OCCURRED_AT_KEYS.iter().any(|key| record.contains_key(*key)) => OccurredAt::Null,
        None => OccurredAt::Absent,
    };

    Ok(Event::new(event_id, occurred_at, record.clone()))
}

/// Read a non-null timestamp field. Anything unusable becomes `None`.
pub fn parse_occurred_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }

            if let Ok(numeric) = trimmed.parse::<f64>() {
                if let Some(at) = from_epoch(numeric) {
                    return Some(at);
                }
            }

            parse_date_string(trimmed)
        },
        _ => None,
    }
}

/// Convert an epoch number of unknown unit to an instant.
///
/// `|v| >= 1e17` is nanoseconds, `>= 1e14` microseconds, `[1e8, 1e11)` seconds,
/// everything else milliseconds.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }

    let abs = value.abs();
    let millis = if abs >= 1e17 {
        value / 1_000_000.0
    } else if abs >= 1e14 {
        value / 1_000.0
    } else if (1e8..1e11).contains(&abs) {
        value * 1_000.0
    } else {
        value
    };

    DateTime::<Utc>::from_timestamp_millis(millis.trunc() as i64)
}

fn parse_date_string(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }

    if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
        return Some(at.with_timezone(&Utc));
    }

    // Date-only and zone-less forms are read as UTC
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        _ => None,
    }
}
