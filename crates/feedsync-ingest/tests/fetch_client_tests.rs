//! Fetch client tests against a mock events API
//!
//! Coverage includes:
//! - Request shape (URL, query, headers)
//! - Fail-fast on non-retriable statuses
//! - 429 handling and retry-hint precedence
//! - 5xx and timeout retries with the attempt ceiling
//! - Pacing from quota headers
//! - Live discovery probe
//!
//! Sleeps are recorded instead of awaited, so delays are asserted exactly.

use chrono::{DateTime, TimeZone, Utc};
use feedsync_ingest::api::{run_live_discovery, FetchClient, FetchConfig};
use feedsync_ingest::IngestError;
use futures::FutureExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

type Sleeps = Arc<Mutex<Vec<Duration>>>;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn test_config(server: &MockServer) -> FetchConfig {
    FetchConfig {
        base_url: format!("{}/api/v1", server.uri()),
        api_key: "test-key".to_string(),
        page_limit: 100,
        timeout: Duration::from_secs(2),
        max_retries: 2,
        retry_base: Duration::from_millis(100),
        retry_max: Duration::from_millis(1000),
    }
}

/// Client with a fixed clock, zero jitter, and recorded sleeps
fn build_client(config: FetchConfig) -> (FetchClient, Sleeps) {
    let sleeps: Sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&sleeps);

    let client = FetchClient::new(config)
        .expect("Failed to build client")
        .with_clock(Arc::new(now))
        .with_random(Arc::new(|| 0.0))
        .with_sleep(Arc::new(move |delay| {
            recorder.lock().unwrap().push(delay);
            futures::future::ready(()).boxed()
        }));

    (client, sleeps)
}

fn recorded(sleeps: &Sleeps) -> Vec<Duration> {
    sleeps.lock().unwrap().clone()
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn ok_page() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "data": [{"eventId": "evt-1", "occurredAt": "2026-01-01T00:00:00.000Z"}],
        "hasMore": true,
        "nextCursor": "cursor-1"
    }))
}

/// Mount `first` for exactly one request ahead of a successful page.
async fn mount_once_then_ok(server: &MockServer, first: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/v1/events"))
        .respond_with(first)
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/events"))
        .respond_with(ok_page())
        .mount(server)
        .await;
}

// ============================================================================
// Request Shape
// ============================================================================

#[tokio::test]
async fn test_fetch_page_sends_expected_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/events"))
        .and(query_param("limit", "100"))
        .and(query_param("cursor", "abc"))
        .and(header("X-API-Key", "test-key"))
        .and(header("Accept", "application/json"))
        .respond_with(ok_page())
        .expect(1)
        .mount(&server)
        .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    let page = client.fetch_page(Some("abc")).await.unwrap();

    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].event_id, "evt-1");
    assert!(page.has_more);
    assert_eq!(page.next_cursor.as_deref(), Some("cursor-1"));
    assert!(recorded(&sleeps).is_empty());
}

#[tokio::test]
async fn test_first_page_omits_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/events"))
        .respond_with(ok_page())
        .expect(1)
        .mount(&server)
        .await;

    let (mut client, _) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].url.query(), Some("limit=100"));
}

// ============================================================================
// Non-retriable Responses
// ============================================================================

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    let err = client.fetch_page(None).await.unwrap_err();

    match err {
        IngestError::Upstream { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad request");
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(recorded(&sleeps).is_empty());
}

#[tokio::test]
async fn test_non_json_body_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let (mut client, _) = build_client(test_config(&server));
    let err = client.fetch_page(None).await.unwrap_err();

    assert!(matches!(err, IngestError::MalformedResponse(_)));
}

// ============================================================================
// Rate Limiting (429)
// ============================================================================

#[tokio::test]
async fn test_retry_after_header_sets_delay() {
    let server = MockServer::start().await;
    mount_once_then_ok(&server, ResponseTemplate::new(429).insert_header("Retry-After", "2")).await;

    let (mut client, sleeps) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    assert_eq!(recorded(&sleeps), vec![ms(2000)]);
}

#[tokio::test]
async fn test_retry_after_header_beats_body_hint() {
    let server = MockServer::start().await;
    mount_once_then_ok(
        &server,
        ResponseTemplate::new(429)
            .insert_header("Retry-After", "2")
            .set_body_json(json!({"rateLimit": {"retryAfter": 5}})),
    )
    .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    assert_eq!(recorded(&sleeps), vec![ms(2000)]);
}

#[tokio::test]
async fn test_body_retry_after_used_without_header() {
    let server = MockServer::start().await;
    mount_once_then_ok(
        &server,
        ResponseTemplate::new(429).set_body_json(json!({"rateLimit": {"retryAfter": 3}})),
    )
    .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    assert_eq!(recorded(&sleeps), vec![ms(3000)]);
}

#[tokio::test]
async fn test_body_reset_epoch_is_converted_to_wait() {
    let server = MockServer::start().await;
    let reset_at = now().timestamp() + 3;
    mount_once_then_ok(
        &server,
        ResponseTemplate::new(429).set_body_json(json!({"rateLimit": {"reset": reset_at}})),
    )
    .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    assert_eq!(recorded(&sleeps), vec![ms(3000)]);
}

#[tokio::test]
async fn test_rate_limit_reset_header_is_last_resort() {
    let server = MockServer::start().await;
    mount_once_then_ok(
        &server,
        ResponseTemplate::new(429).insert_header("X-RateLimit-Reset", "4"),
    )
    .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    client.fetch_page(None).await.unwrap();

    assert_eq!(recorded(&sleeps), vec![ms(4000)]);
}

#[tokio::test]
async fn test_rate_limit_is_not_bound_by_retry_ceiling() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ok_page())
        .mount(&server)
        .await;

    let config = FetchConfig {
        max_retries: 1,
        ..test_config(&server)
    };
    let (mut client, sleeps) = build_client(config);
    client.fetch_page(None).await.unwrap();

    // No hint, so each wait is the plain exponential backoff
    assert_eq!(recorded(&sleeps), vec![ms(100), ms(200), ms(400)]);
}

// ============================================================================
// Transient Failures (5xx, timeouts)
// ============================================================================

#[tokio::test]
async fn test_server_error_is_retried_with_backoff() {
    let server = MockServer::start().await;
    mount_once_then_ok(&server, ResponseTemplate::new(503)).await;

    let (mut client, sleeps) = build_client(test_config(&server));
    let page = client.fetch_page(None).await.unwrap();

    assert_eq!(page.events.len(), 1);
    assert_eq!(recorded(&sleeps), vec![ms(100)]);
}

#[tokio::test]
async fn test_server_error_exhausts_retry_ceiling() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let (mut client, sleeps) = build_client(test_config(&server));
    let err = client.fetch_page(None).await.unwrap_err();

    assert!(matches!(err, IngestError::Upstream { status: 500, .. }));
    assert_eq!(recorded(&sleeps), vec![ms(100), ms(200)]);
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let server = MockServer::start().await;
    mount_once_then_ok(
        &server,
        ResponseTemplate::new(200).set_delay(Duration::from_secs(2)),
    )
    .await;

    let config = FetchConfig {
        timeout: ms(200),
        ..test_config(&server)
    };
    let (mut client, sleeps) = build_client(config);
    let page = client.fetch_page(None).await.unwrap();

    assert_eq!(page.next_cursor.as_deref(), Some("cursor-1"));
    assert_eq!(recorded(&sleeps), vec![ms(100)]);
}

#[tokio::test]
async fn test_persistent_timeout_surfaces_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let config = FetchConfig {
        timeout: ms(100),
        max_retries: 1,
        ..test_config(&server)
    };
    let (mut client, sleeps) = build_client(config);
    let err = client.fetch_page(None).await.unwrap_err();

    assert!(matches!(err, IngestError::Timeout(_)));
    assert_eq!(recorded(&sleeps).len(), 1);
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let server = MockServer::start().await;
    let config = FetchConfig {
        max_retries: 1,
        ..test_config(&server)
    };
    drop(server);

    let (mut client, sleeps) = build_client(config);
    let err = client.fetch_page(None).await.unwrap_err();

    assert!(matches!(err, IngestError::Transport(_)));
    assert_eq!(recorded(&sleeps), vec![ms(100)]);
}

// ============================================================================
// Pacing
// ============================================================================

#[tokio::test]
async fn test_exhausted_quota_delays_next_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ok_page()
                .insert_header("X-RateLimit-Remaining", "0")
                .insert_header("X-RateLimit-Reset", "2"),
        )
        .mount(&server)
        .await;

    let (mut client, sleeps) = build_client(test_config(&server));

    client.fetch_page(None).await.unwrap();
    assert!(recorded(&sleeps).is_empty());

    client.fetch_page(Some("cursor-1")).await.unwrap();
    assert_eq!(recorded(&sleeps), vec![ms(2000)]);
}

#[tokio::test]
async fn test_remaining_quota_does_not_delay_requests() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ok_page()
                .insert_header("X-RateLimit-Remaining", "4294967295")
                .insert_header("X-RateLimit-Reset", "60"),
        )
        .mount(&server)
        .await;

    let (mut client, sleeps) = build_client(test_config(&server));

    client.fetch_page(None).await.unwrap();
    client.fetch_page(Some("cursor-1")).await.unwrap();

    assert!(recorded(&sleeps).is_empty());
    assert_eq!(client.pacing_until(), None);
}

// ============================================================================
// Live Discovery
// ============================================================================

#[tokio::test]
async fn test_discovery_fetches_small_page_and_reports_shape() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/events"))
        .and(query_param("limit", "5"))
        .and(header("X-API-Key", "test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Remaining", "99")
                .set_body_json(json!({
                    "data": [{"eventId": "evt-1", "occurredAt": "2026-01-01T00:00:00.000Z", "eventType": "click"}],
                    "hasMore": true,
                    "nextCursor": "next-cursor"
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = build_client(test_config(&server));
    let report = run_live_discovery(&client).await.unwrap();

    assert_eq!(report.sample_size, 1);
    assert!(report.has_more);
    assert_eq!(report.next_cursor.as_deref(), Some("next-cursor"));
    assert_eq!(
        report.headers.get("x-ratelimit-remaining").map(String::as_str),
        Some("99")
    );
    assert_eq!(report.response_shape.data_type, "array");
    assert_eq!(report.response_shape.data_length, Some(1));
    assert_eq!(report.response_shape.has_more_type, "boolean");
}

#[tokio::test]
async fn test_discovery_does_not_retry_failures() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, sleeps) = build_client(test_config(&server));
    let err = run_live_discovery(&client).await.unwrap_err();

    assert!(err.to_string().contains("status 401"));
    assert!(recorded(&sleeps).is_empty());
}
