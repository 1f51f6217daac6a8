//! One-shot probe of a live upstream
//!
//! Before the first run against a real API we fetch a tiny page and log its
//! headers and JSON shape, so contract drift shows up in the logs before
//! thousands of pages are pulled.

use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::client::{build_events_url, FetchClient};
use super::normalize::parse_events_page;
use crate::config::ApiMode;
use crate::error::{IngestError, Result};

/// Page size used for the probe
pub const DISCOVERY_LIMIT: u32 = 5;

/// Structural summary of a raw response body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseShape {
    pub top_level_keys: Vec<String>,
    pub data_type: &'static str,
    pub data_length: Option<usize>,
    pub has_more_type: &'static str,
    pub next_cursor_type: &'static str,
    pub first_event_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub headers: BTreeMap<String, String>,
    pub response_shape: ResponseShape,
    pub sample_size: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Discovery runs only against a live API: always on a fresh stream, and on
/// a resumed one only when explicitly requested.
pub fn should_run_live_discovery(mode: ApiMode, total_ingested: i64, on_resume: bool) -> bool {
    match mode {
        ApiMode::Mock => false,
        ApiMode::Live => total_ingested <= 0 || on_resume,
    }
}

/// Fetch one small page without retries or pacing and describe it.
pub async fn run_live_discovery(client: &FetchClient) -> Result<DiscoveryReport> {
    let url = build_events_url(&client.config().base_url, DISCOVERY_LIMIT, None)?;
    let response = client.send_once(&url).await?;

    if !response.status.is_success() {
        return Err(IngestError::upstream(response.status.as_u16(), response.body));
    }

    let payload: Value = serde_json::from_str(&response.body)
        .map_err(|e| IngestError::malformed(format!("response body is not JSON: {}", e)))?;
    let page = parse_events_page(&payload)?;

    let report = DiscoveryReport {
        headers: header_map(&response.headers),
        response_shape: response_shape(&payload),
        sample_size: page.len(),
        has_more: page.has_more,
        next_cursor: page.next_cursor,
    };

    tracing::info!(
        sample_size = report.sample_size,
        has_more = report.has_more,
        next_cursor = ?report.next_cursor,
        shape = %shape_summary(&report.response_shape),
        headers = ?report.headers,
        "Live discovery complete"
    );

    Ok(report)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

fn object_keys(value: &Value) -> Option<Vec<String>> {
    value.as_object().map(|o| o.keys().cloned().collect())
}

/// JSON rendering of `shape` for the discovery log line.
fn shape_summary(shape: &ResponseShape) -> String {
    match serde_json::to_string(shape) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize response shape");
            format!("{:?}", shape)
        },
    }
}

pub fn response_shape(payload: &Value) -> ResponseShape {
    let data = payload.get("data");
    let items = data.and_then(Value::as_array);

    ResponseShape {
        top_level_keys: object_keys(payload).unwrap_or_default(),
        data_type: type_name(data),
        data_length: items.map(Vec::len),
        has_more_type: type_name(payload.get("hasMore")),
        next_cursor_type: type_name(payload.get("nextCursor")),
        first_event_keys: items.and_then(|a| a.first()).and_then(object_keys),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gate_runs_for_fresh_live_stream() {
        assert!(should_run_live_discovery(ApiMode::Live, 0, false));
    }

    #[test]
    fn test_gate_skips_resumed_live_stream_by_default() {
        assert!(!should_run_live_discovery(ApiMode::Live, 1, false));
        assert!(should_run_live_discovery(ApiMode::Live, 100, true));
    }

    #[test]
    fn test_gate_never_runs_in_mock_mode() {
        assert!(!should_run_live_discovery(ApiMode::Mock, 0, true));
        assert!(!should_run_live_discovery(ApiMode::Mock, 100, false));
    }

    #[test]
    fn test_response_shape() {
        let shape = response_shape(&json!({
            "data": [{"eventId": "evt-1", "eventType": "click"}],
            "hasMore": true,
            "nextCursor": null
        }));

        assert_eq!(shape.data_type, "array");
        assert_eq!(shape.data_length, Some(1));
        assert_eq!(shape.has_more_type, "boolean");
        assert_eq!(shape.next_cursor_type, "null");
        assert_eq!(
            shape.first_event_keys,
            Some(vec!["eventId".to_string(), "eventType".to_string()])
        );
    }

    #[test]
    fn test_shape_summary_is_camel_case_json() {
        let shape = response_shape(&json!({"data": [], "hasMore": false, "nextCursor": null}));
        let summary: Value = serde_json::from_str(&shape_summary(&shape)).unwrap();

        assert_eq!(summary["dataType"], "array");
        assert_eq!(summary["dataLength"], 0);
        assert_eq!(summary["nextCursorType"], "null");
    }

    #[test]
    fn test_response_shape_of_unexpected_payload() {
        let shape = response_shape(&json!({"events": []}));

        assert_eq!(shape.top_level_keys, vec!["events".to_string()]);
        assert_eq!(shape.data_type, "undefined");
        assert_eq!(shape.data_length, None);
        assert_eq!(shape.first_event_keys, None);
    }
}
