//! feedsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared domain types and logging setup for the feedsync workspace.
//!
//! - **Types**: [`Event`], [`Page`], and [`Checkpoint`], the values passed
//!   between the fetch client, the ingestion loop, and the bulk writer
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use feedsync_common::{Event, OccurredAt};
//!
//! let event = Event::with_id("evt-1");
//! assert_eq!(event.occurred_at, OccurredAt::Absent);
//! assert_eq!(event.to_payload()["eventId"], "evt-1");
//! ```

pub mod logging;
pub mod types;

pub use types::{Checkpoint, Event, OccurredAt, Page};
