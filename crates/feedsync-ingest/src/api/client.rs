//! HTTP client for the upstream events API
//!
//! [`FetchClient::fetch_page`] is one logical "give me the next page" call. It
//! hides timeouts, transport failures, 5xx responses, and rate limiting behind
//! retries, and only surfaces errors that retrying cannot fix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_common::Page;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::normalize::parse_events_page;
use super::retry::{
    backoff_delay, is_retriable_status, parse_retry_after, resolve_reset_delay,
    resolve_reset_header,
};
use super::PageSource;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Async sleep used between attempts and for pacing
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wall clock used to resolve absolute reset hints and pacing windows
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Uniform random source in `[0, 1)` used for backoff jitter
pub type RandomFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Connection and retry settings for [`FetchClient`]
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_limit: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&IngestConfig> for FetchConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            api_key: config.api_key.clone(),
            page_limit: config.page_limit,
            timeout: config.api_timeout,
            max_retries: config.max_retries,
            retry_base: config.retry_base,
            retry_max: config.retry_max,
        }
    }
}

/// Build `<base>/events?limit=<n>[&cursor=<c>]`.
///
/// The base URL is treated as a directory, so `http://host/api/v1` and
/// `http://host/api/v1/` both resolve to `http://host/api/v1/events`.
pub fn build_events_url(base_url: &str, limit: u32, cursor: Option<&str>) -> Result<Url> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };

    let mut url = Url::parse(&base)
        .and_then(|base| base.join("events"))
        .map_err(|e| IngestError::config(format!("invalid API base URL '{}': {}", base_url, e)))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("limit", &limit.to_string());
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            query.append_pair("cursor", cursor);
        }
    }

    Ok(url)
}

/// Fully buffered response
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Resilient paginated client for the events feed.
///
/// One instance per stream. The pacing window is private state updated after
/// every successful response; requests are never concurrent so it needs no
/// locking.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
    pacing_until: Option<DateTime<Utc>>,
    sleep: SleepFn,
    now: ClockFn,
    random: RandomFn,
}

impl FetchClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        // Validate the base URL up front rather than on the first fetch
        build_events_url(&config.base_url, config.page_limit, None)?;

        let http = Client::builder()
            .user_agent(concat!("feedsync-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            config,
            pacing_until: None,
            sleep: Arc::new(|delay| tokio::time::sleep(delay).boxed()),
            now: Arc::new(Utc::now),
            random: Arc::new(uuid_unit_interval),
        })
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_clock(mut self, now: ClockFn) -> Self {
        self.now = now;
        self
    }

    pub fn with_random(mut self, random: RandomFn) -> Self {
        self.random = random;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Instant before which no request will be issued, if any.
    pub fn pacing_until(&self) -> Option<DateTime<Utc>> {
        self.pacing_until
    }

    /// Fetch and normalize the page at `cursor`.
    ///
    /// Timeouts, transport failures, and 5xx responses are retried up to
    /// `max_retries` times. 429 responses are always retried after the longer
    /// of the server's hint and the computed backoff. Other statuses fail
    /// immediately with the status and body.
    pub async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page> {
        let url = build_events_url(&self.config.base_url, self.config.page_limit, cursor)?;

        let mut retries: u32 = 0;
        let mut transient_failures: u32 = 0;

        loop {
            self.wait_for_pacing_window().await;

            let error = match self.send_once(&url).await {
                Ok(response) if response.status.is_success() => {
                    self.record_quota(&response.headers);
                    return decode_page(&response.body);
                },
                Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                    retries += 1;
                    let delay = self.rate_limit_delay(&response, retries);
                    warn!(
                        status = 429,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited by events API, pacing before retry"
                    );
                    (self.sleep)(delay).await;
                    continue;
                },
                Ok(response) => IngestError::upstream(response.status.as_u16(), response.body),
                Err(error) => error,
            };

            if !error.is_transient() || transient_failures >= self.config.max_retries {
                return Err(error);
            }

            transient_failures += 1;
            retries += 1;
            let delay = self.backoff(retries);
            warn!(
                error = %error,
                attempt = transient_failures,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Events request failed, retrying"
            );
            (self.sleep)(delay).await;
        }
    }

    /// Issue one GET and buffer the whole response under the request timeout.
    pub(crate) async fn send_once(&self, url: &Url) -> Result<RawResponse> {
        debug!(url = %url, "Requesting events page");

        let request = async {
            let response = self
                .http
                .get(url.clone())
                .header(ACCEPT, "application/json")
                .header(API_KEY_HEADER, &self.config.api_key)
                .send()
                .await?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await?;

            Ok::<_, reqwest::Error>(RawResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(IngestError::Timeout(self.config.timeout)),
            Ok(Err(e)) => Err(IngestError::from(e)),
            Err(_) => Err(IngestError::Timeout(self.config.timeout)),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }

    async fn wait_for_pacing_window(&mut self) {
        let Some(until) = self.pacing_until.take() else {
            return;
        };

        if let Ok(delay) = (until - self.now()).to_std() {
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "Waiting for rate-limit window");
                (self.sleep)(delay).await;
            }
        }
    }

    /// Update the pacing window from quota headers on a successful response.
    ///
    /// Only an exhausted quota opens a window, which lasts until the reset.
    fn record_quota(&mut self, headers: &HeaderMap) {
        let now = self.now();

        let exhausted = header_str(headers, RATE_LIMIT_REMAINING_HEADER)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .is_some_and(|remaining| remaining <= 0.0);

        self.pacing_until = if exhausted {
            header_str(headers, RATE_LIMIT_RESET_HEADER)
                .and_then(|v| resolve_reset_header(v, now))
                .map(|reset| now + reset)
        } else {
            None
        };
    }

    fn backoff(&self, retry: u32) -> Duration {
        backoff_delay(
            retry,
            self.config.retry_base,
            self.config.retry_max,
            (self.random)(),
        )
    }

    /// Delay before retrying a 429: the larger of the server's hint and the
    /// computed backoff.
    fn rate_limit_delay(&self, response: &RawResponse, retry: u32) -> Duration {
        let backoff = self.backoff(retry);

        match self.retry_hint(response) {
            Some(hint) => hint.max(backoff),
            None => backoff,
        }
    }

    /// Server-provided wait, by precedence: `Retry-After`, then the
    /// `rateLimit` object in the body, then `X-RateLimit-Reset`.
    fn retry_hint(&self, response: &RawResponse) -> Option<Duration> {
        let now = self.now();

        parse_retry_after(header_str(&response.headers, RETRY_AFTER.as_str()), now)
            .or_else(|| body_retry_hint(&response.body, now))
            .or_else(|| {
                header_str(&response.headers, RATE_LIMIT_RESET_HEADER)
                    .and_then(|v| resolve_reset_header(v, now))
            })
    }
}

#[async_trait]
impl PageSource for FetchClient {
    async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page> {
        FetchClient::fetch_page(self, cursor).await
    }
}

fn decode_page(body: &str) -> Result<Page> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|e| IngestError::malformed(format!("response body is not JSON: {}", e)))?;
    parse_events_page(&payload)
}

fn body_retry_hint(body: &str, now: DateTime<Utc>) -> Option<Duration> {
    let payload: Value = serde_json::from_str(body).ok()?;
    let rate_limit = payload.get("rateLimit")?.as_object()?;

    ["retryAfter", "reset"]
        .iter()
        .filter_map(|key| rate_limit.get(*key))
        .find_map(|value| resolve_reset_delay(value, now))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Jitter source built on the v4 UUID generator: 53 random bits scaled into
/// `[0, 1)`.
fn uuid_unit_interval() -> f64 {
    let (_, low) = Uuid::new_v4().as_u64_pair();
    // The top two bits of the low half are the fixed RFC 4122 variant
    ((low << 2) >> 11) as f64 / (1u64 << 53) as f64
}
