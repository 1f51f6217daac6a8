//! Domain types shared across feedsync crates

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload key holding the normalized event identifier.
pub const EVENT_ID_KEY: &str = "eventId";

/// Payload key holding the normalized event timestamp.
pub const OCCURRED_AT_KEY: &str = "occurredAt";

/// Normalized event timestamp.
///
/// An event may omit its timestamp entirely, carry an explicit `null`, or carry
/// a valid instant. The first two are kept apart so the stored payload
/// reflects what upstream actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OccurredAt {
    /// No timestamp field was present on the record
    #[default]
    Absent,
    /// A timestamp field was present but null or unparseable
    Null,
    /// A valid instant
    At(DateTime<Utc>),
}

impl OccurredAt {
    /// The instant, if one is known
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            OccurredAt::At(at) => Some(*at),
            OccurredAt::Absent | OccurredAt::Null => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, OccurredAt::Absent)
    }

    /// JSON form written into the payload; `None` when the field is absent.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            OccurredAt::Absent => None,
            OccurredAt::Null => Some(Value::Null),
            OccurredAt::At(at) => Some(Value::String(to_iso_millis(at))),
        }
    }
}

impl From<Option<DateTime<Utc>>> for OccurredAt {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(at) => OccurredAt::At(at),
            None => OccurredAt::Null,
        }
    }
}

/// Format an instant as ISO-8601 with millisecond precision and a `Z` suffix.
pub fn to_iso_millis(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A single upstream event.
///
/// `fields` is the record exactly as upstream sent it. Unknown keys are carried
/// through untouched so payload additions upstream never need a code change.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub occurred_at: OccurredAt,
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(event_id: impl Into<String>, occurred_at: OccurredAt, fields: Map<String, Value>) -> Self {
        Self {
            event_id: event_id.into(),
            occurred_at,
            fields,
        }
    }

    /// Build an event carrying only an id. Mostly useful in tests.
    pub fn with_id(event_id: impl Into<String>) -> Self {
        let event_id = event_id.into();
        let mut fields = Map::new();
        fields.insert(EVENT_ID_KEY.to_string(), Value::String(event_id.clone()));
        Self::new(event_id, OccurredAt::Absent, fields)
    }

    /// Payload persisted for this event: the fetched record with the
    /// normalized id and timestamp written over the upstream values.
    pub fn to_payload(&self) -> Value {
        let mut payload = self.fields.clone();
        payload.insert(EVENT_ID_KEY.to_string(), Value::String(self.event_id.clone()));

        match self.occurred_at.to_json() {
            Some(value) => {
                payload.insert(OCCURRED_AT_KEY.to_string(), value);
            },
            None => {
                payload.remove(OCCURRED_AT_KEY);
            },
        }

        Value::Object(payload)
    }
}

/// One normalized page of the upstream feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub events: Vec<Event>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Durable resume record for the single ingested stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Cursor of the next page to fetch; `None` means start of stream
    pub cursor: Option<String>,

    /// Rows actually inserted across all runs (post-deduplication)
    pub total_ingested: i64,

    /// Last time the checkpoint advanced
    pub updated_at: DateTime<Utc>,
}
