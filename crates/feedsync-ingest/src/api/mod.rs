//! Upstream events API: retry policy, response normalization, fetch client

pub mod client;
pub mod discovery;
pub mod normalize;
pub mod retry;

pub use client::{build_events_url, FetchClient, FetchConfig};
pub use discovery::{run_live_discovery, should_run_live_discovery, DiscoveryReport};
pub use normalize::parse_events_page;

use async_trait::async_trait;
use feedsync_common::Page;

use crate::error::Result;

/// Anything that can hand the ingestion loop the page at a cursor
#[async_trait]
pub trait PageSource: Send {
    async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page>;
}
