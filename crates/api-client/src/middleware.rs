//! Request pipeline stages
//!
//! The pipeline applies these in a fixed order on every physical attempt:
//! attach-credential, attach-tracing, send, classify-response, then
//! maybe-refresh-and-retry or maybe-backoff-and-retry. Each stage here is a
//! plain function so it can be tested on its own.

use std::time::{Duration, Instant};

use reqwest::header::{
    AUTHORIZATION, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, PRAGMA,
};
use serde_json::Value;

/// Correlation header carrying the per-attempt request id.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-logical-request state, owned by the pipeline for the lifetime of one
/// call including its retries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Id of the current physical attempt
    pub request_id: String,
    /// Start of the current physical attempt
    pub start_time: Instant,
    pub retry_count: u32,
    /// Set once a 401 has triggered a refresh for this logical request
    pub is_auth_retry: bool,
    pub attempts: u32,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: new_request_id(),
            start_time: Instant::now(),
            retry_count: 0,
            is_auth_retry: false,
            attempts: 0,
        }
    }

    /// Start a new physical attempt: fresh id, fresh start time.
    pub fn begin_attempt(&mut self) {
        if self.attempts > 0 {
            self.request_id = new_request_id();
        }
        self.start_time = Instant::now();
        self.attempts += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Unique id for one physical attempt.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Set (or strip) the `Authorization` header.
///
/// Any caller-supplied authorization is replaced: the credential store is
/// the only source of credentials.
pub fn attach_credential(
    headers: &mut HeaderMap,
    authorization: Option<&str>,
) -> Result<(), InvalidHeaderValue> {
    headers.remove(AUTHORIZATION);
    if let Some(authorization) = authorization {
        let mut value = HeaderValue::from_str(authorization)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(())
}

/// Attach the request id and no-cache directives.
pub fn attach_tracing(headers: &mut HeaderMap, ctx: &RequestContext) {
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Return the `data` field of an envelope object, or the payload itself.
pub fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}
