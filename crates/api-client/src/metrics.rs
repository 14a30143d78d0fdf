//! Client-side request metrics
//!
//! Emitted through the `metrics` facade; the embedding application decides
//! whether a recorder is installed. Without one every call is a no-op.
//!
//! - `api_client_requests_total` (counter): labels `method`, `status`
//! - `api_client_request_duration_seconds` (histogram): label `method`
//! - `api_client_retries_total` (counter): label `reason`
//! - `api_client_refresh_total` (counter): labels `origin`, `outcome`; the
//!   credential store records its own `origin="proactive"` refreshes
//! - `api_client_errors_total` (counter): label `kind`

use std::time::Duration;

use crate::error::ErrorKind;

/// Record one physical attempt. `status` is `"error"` for transport
/// failures that produced no response.
pub fn record_attempt(method: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "api_client_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("api_client_request_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a backoff retry with its cause (`"status_503"`, `"transport"`).
pub fn record_retry(reason: &str) {
    metrics::counter!("api_client_retries_total", "reason" => reason.to_string()).increment(1);
}

/// Record a refresh exchange outcome (`"success"` / `"failure"`) for a
/// `"reactive"` (after a 401) or `"manual"` refresh.
pub fn record_refresh(origin: &'static str, outcome: &'static str) {
    metrics::counter!(
        "api_client_refresh_total",
        "origin" => origin,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an error surfaced to a caller.
pub fn record_error(kind: ErrorKind) {
    metrics::counter!("api_client_errors_total", "kind" => kind.label()).increment(1);
}
