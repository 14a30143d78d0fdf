//! Error types surfaced to callers
//!
//! Every request method returns either the unwrapped payload or an
//! `ApiError`. Recoverable conditions (one auth retry, bounded transient
//! retries, proactive refresh) are handled inside the pipeline and never
//! show up here.

use std::fmt;

use reqwest::Method;

/// Caller-facing failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No valid credential and refresh did not recover one
    AuthenticationRequired,
    /// Valid credential, insufficient rights
    PermissionDenied,
    /// Retries exhausted after network/5xx/rate-limit conditions
    TransientFailure,
    /// Any other 4xx; the request itself was invalid
    RequestRejected,
    /// Cancelled by the caller
    Cancelled,
    /// Anything else, always with status/message for diagnostics
    Unknown,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::TransientFailure => "transient_failure",
            ErrorKind::RequestRejected => "request_rejected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified request failure.
///
/// `message` comes from the response body's `detail`/`message` field (or the
/// transport error); no other part of the body is carried.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{method} {path} failed ({kind}): {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub method: Method,
    pub path: String,
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(
        kind: ErrorKind,
        method: &Method,
        path: &str,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            method: method.clone(),
            path: path.to_string(),
            status,
            message: message.into(),
        }
    }

    pub fn is_auth_required(&self) -> bool {
        self.kind == ErrorKind::AuthenticationRequired
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Result alias for request methods.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors from building a client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("credential store error: {0}")]
    Credentials(#[from] credential_store::Error),

    #[error("HTTP client error: {0}")]
    Http(String),
}

/// Result alias for client construction.
pub type Result<T> = std::result::Result<T, Error>;
