//! Credential store defaults
//!
//! Endpoint paths are relative to the backend origin the client talks to.
//! Record names are prefixed with the store namespace so several stores can
//! share one key-value area.

use std::time::Duration;

/// Refresh exchange path (POST `{ refresh_token }`)
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Revocation exchange path (POST `{ token, token_type_hint }`)
pub const DEFAULT_REVOKE_PATH: &str = "/auth/revoke";

/// Namespace for persisted records
pub const DEFAULT_NAMESPACE: &str = "api_client.auth";

/// Margin subtracted from expiry when deciding a token is expired.
/// Absorbs clock drift and the latency of a request already in flight.
pub const DEFAULT_SKEW_BUFFER: Duration = Duration::from_secs(30);

/// Lead time before expiry at which the proactive refresh fires.
pub const DEFAULT_PROACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Shortest wait before re-refreshing a pair our own refresh just stored
pub const MIN_PROACTIVE_DELAY: Duration = Duration::from_secs(5);

/// Timeout for the refresh and revoke exchanges
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Scheme label used when the server does not report one
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

pub(crate) const ACCESS_TOKEN_RECORD: &str = "access_token";
pub(crate) const REFRESH_TOKEN_RECORD: &str = "refresh_token";
pub(crate) const EXPIRES_AT_RECORD: &str = "expires_at";
pub(crate) const TOKEN_TYPE_RECORD: &str = "token_type";
