//! Response classification
//!
//! Maps an HTTP status to the pipeline's next step and extracts a
//! human-readable message from an error body. Classification only looks at
//! the status; the body is read for the message alone.

use reqwest::StatusCode;
use serde_json::Value;

/// Outcome of one physical attempt that produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx, return the payload
    Success,
    /// 401, credential invalid or expired, refresh once
    AuthFailure,
    /// 403, authenticated but not allowed, never retried
    Forbidden,
    /// 5xx or 429, back off and retry
    Retryable,
    /// Any other 4xx, retrying cannot help
    Rejected,
    /// 1xx/3xx reaching the caller
    Unexpected,
}

/// Classify a response status.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        401 => Classification::AuthFailure,
        403 => Classification::Forbidden,
        429 => Classification::Retryable,
        500..=599 => Classification::Retryable,
        400..=499 => Classification::Rejected,
        _ => Classification::Unexpected,
    }
}

/// Longest message taken from an error body.
const MAX_MESSAGE_LEN: usize = 500;

/// Extract a caller-safe message from an error body.
///
/// Looks at `detail`, `message`, `error` (string) and `error.message`, in
/// that order. Anything else in the body (validation payloads, stack traces)
/// is dropped; the fallback is the status reason phrase.
pub fn extract_message(status: u16, body: &str) -> String {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| message_field(&json));

    match from_body {
        Some(mut message) => {
            if message.len() > MAX_MESSAGE_LEN {
                let mut cut = MAX_MESSAGE_LEN;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            message
        }
        None => reason(status),
    }
}

fn message_field(json: &Value) -> Option<String> {
    for key in ["detail", "message"] {
        match json.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            // Structured `detail` is a validation payload, never surfaced
            Some(Value::Array(_) | Value::Object(_)) => {
                return Some("request validation failed".to_string());
            }
            _ => {}
        }
    }
    match json.get("error") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn reason(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}
