//! Request pipeline
//!
//! Turns one logical request into one or more physical attempts. Every
//! attempt runs the same fixed sequence: attach the current credential,
//! attach tracing headers, send, classify. A 401 triggers at most one
//! refresh-and-resend per logical request; transport errors, 5xx and 429
//! back off and retry up to the policy limit; everything else is final.
//!
//! Cancellation is observed at each suspension point (send, refresh,
//! backoff sleep). A cancelled request is never retried and never touches
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use credential_store::CredentialStore;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::classify::{Classification, classify_status, extract_message};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::metrics;
use crate::middleware::{RequestContext, attach_credential, attach_tracing};
use crate::reauth::{LogReauthHandler, ReauthHandler};
use crate::retry::{RetryPolicy, parse_retry_after};
use crate::transfer::MultipartBody;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt timeout for uploads and downloads.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Request payload, kept in a form that can be re-sent on every attempt.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

/// One logical request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, may carry its own query string
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Overrides the pipeline's per-attempt timeout
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Upload or download: uses the transfer timeout
    pub transfer: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            cancel: None,
            transfer: false,
        }
    }
}

/// Shared request executor: transport, credential store, retry policy.
pub struct Pipeline {
    http: reqwest::Client,
    base_url: String,
    store: CredentialStore,
    policy: RetryPolicy,
    timeout: Duration,
    transfer_timeout: Duration,
    reauth: Arc<dyn ReauthHandler>,
}

impl Pipeline {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, store: CredentialStore) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            store,
            policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            reauth: Arc::new(LogReauthHandler),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, transfer_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.transfer_timeout = transfer_timeout;
        self
    }

    pub fn with_reauth_handler(mut self, handler: Arc<dyn ReauthHandler>) -> Self {
        self.reauth = handler;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run a logical request to a 2xx response or a classified error.
    ///
    /// The returned response body has not been read.
    #[instrument(skip_all, fields(method = %req.method, path = %req.path))]
    pub async fn execute(&self, req: &ApiRequest) -> ApiResult<reqwest::Response> {
        let result = self.run(req).await;
        if let Err(e) = &result {
            metrics::record_error(e.kind);
        }
        result
    }

    async fn run(&self, req: &ApiRequest) -> ApiResult<reqwest::Response> {
        let url = self.url_for(req)?;
        let destination = destination(&url);
        let method = req.method.as_str();
        let mut ctx = RequestContext::new();

        loop {
            self.check_cancelled(req)?;
            ctx.begin_attempt();
            let request = self.build(req, &url, &ctx).await?;

            let sent = match &req.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(self.cancelled(req)),
                    result = self.http.execute(request) => result,
                },
                None => self.http.execute(request).await,
            };

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    metrics::record_attempt(method, "error", ctx.elapsed());
                    warn!(
                        request_id = %ctx.request_id,
                        attempt = ctx.attempts,
                        error = %e,
                        "request failed without a response"
                    );
                    let exhausted = self.fail(
                        req,
                        ErrorKind::TransientFailure,
                        None,
                        transport_message(&e),
                    );
                    self.backoff(req, &mut ctx, "transport", None, exhausted)
                        .await?;
                    continue;
                }
            };

            let status = response.status().as_u16();
            metrics::record_attempt(method, &status.to_string(), ctx.elapsed());

            match classify_status(status) {
                Classification::Success => {
                    info!(
                        request_id = %ctx.request_id,
                        status,
                        attempts = ctx.attempts,
                        duration_ms = ctx.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    return Ok(response);
                }
                Classification::AuthFailure if !ctx.is_auth_retry => {
                    ctx.is_auth_retry = true;
                    info!(request_id = %ctx.request_id, "credential rejected, refreshing");
                    if self.refresh_credentials(req).await? {
                        continue;
                    }
                    return Err(self
                        .authentication_required(req, &destination, "credential refresh failed")
                        .await);
                }
                Classification::AuthFailure => {
                    return Err(self
                        .authentication_required(
                            req,
                            &destination,
                            "credential rejected after refresh",
                        )
                        .await);
                }
                Classification::Forbidden => {
                    let message = read_message(status, response).await;
                    warn!(request_id = %ctx.request_id, %message, "permission denied");
                    return Err(self.fail(req, ErrorKind::PermissionDenied, Some(status), message));
                }
                Classification::Retryable => {
                    let retry_after = parse_retry_after(response.headers());
                    let message = read_message(status, response).await;
                    warn!(
                        request_id = %ctx.request_id,
                        attempt = ctx.attempts,
                        status,
                        "transient failure"
                    );
                    let exhausted =
                        self.fail(req, ErrorKind::TransientFailure, Some(status), message);
                    let reason = format!("status_{status}");
                    self.backoff(req, &mut ctx, &reason, retry_after, exhausted)
                        .await?;
                }
                Classification::Rejected => {
                    let message = read_message(status, response).await;
                    return Err(self.fail(req, ErrorKind::RequestRejected, Some(status), message));
                }
                Classification::Unexpected => {
                    let message = read_message(status, response).await;
                    return Err(self.fail(req, ErrorKind::Unknown, Some(status), message));
                }
            }
        }
    }

    fn url_for(&self, req: &ApiRequest) -> ApiResult<Url> {
        let base = self.base_url.trim_end_matches('/');
        let raw = if req.path.starts_with('/') {
            format!("{base}{}", req.path)
        } else {
            format!("{base}/{}", req.path)
        };
        let mut url = Url::parse(&raw).map_err(|e| {
            self.fail(req, ErrorKind::Unknown, None, format!("invalid request URL: {e}"))
        })?;
        if !req.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&req.query);
        }
        Ok(url)
    }

    /// attach-credential and attach-tracing, then materialise the body.
    async fn build(
        &self,
        req: &ApiRequest,
        url: &Url,
        ctx: &RequestContext,
    ) -> ApiResult<reqwest::Request> {
        let mut headers = req.headers.clone();
        let authorization = self.store.authorization().await;
        attach_credential(&mut headers, authorization.as_deref()).map_err(|e| {
            self.fail(req, ErrorKind::Unknown, None, format!("invalid credential header: {e}"))
        })?;
        attach_tracing(&mut headers, ctx);

        let timeout = req.timeout.unwrap_or(if req.transfer {
            self.transfer_timeout
        } else {
            self.timeout
        });
        let builder = self
            .http
            .request(req.method.clone(), url.clone())
            .headers(headers)
            .timeout(timeout);
        let builder = match &req.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(body) => {
                let form = body.to_form().map_err(|e| {
                    self.fail(req, ErrorKind::RequestRejected, None, format!("invalid upload: {e}"))
                })?;
                builder.multipart(form)
            }
        };
        builder
            .build()
            .map_err(|e| self.fail(req, ErrorKind::Unknown, None, e.to_string()))
    }

    /// Refresh after a 401. The exchange runs in its own task so a
    /// cancelled caller never abandons it halfway through rotating the
    /// refresh token.
    async fn refresh_credentials(&self, req: &ApiRequest) -> ApiResult<bool> {
        let store = self.store.clone();
        let exchange = tokio::spawn(async move { store.refresh().await });

        let joined = match &req.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(req)),
                joined = exchange => joined,
            },
            None => exchange.await,
        };

        match joined {
            Ok(Ok(())) => {
                metrics::record_refresh("reactive", "success");
                Ok(true)
            }
            Ok(Err(e)) => {
                metrics::record_refresh("reactive", "failure");
                warn!(error = %e, "credential refresh failed");
                Ok(false)
            }
            Err(e) => {
                metrics::record_refresh("reactive", "failure");
                warn!(error = %e, "credential refresh task failed");
                Ok(false)
            }
        }
    }

    /// maybe-backoff-and-retry: sleep before the next attempt, or return
    /// `exhausted` when the retry budget is spent.
    async fn backoff(
        &self,
        req: &ApiRequest,
        ctx: &mut RequestContext,
        reason: &str,
        retry_after: Option<Duration>,
        exhausted: ApiError,
    ) -> ApiResult<()> {
        if !self.policy.should_retry(ctx.retry_count) {
            warn!(
                request_id = %ctx.request_id,
                attempts = ctx.attempts,
                reason,
                "retries exhausted"
            );
            return Err(exhausted);
        }
        ctx.retry_count += 1;
        let delay = self.policy.delay_for(ctx.retry_count, retry_after);
        metrics::record_retry(reason);
        info!(
            request_id = %ctx.request_id,
            retry = ctx.retry_count,
            delay_ms = delay.as_millis() as u64,
            reason,
            "backing off before retry"
        );

        match &req.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(self.cancelled(req)),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn authentication_required(
        &self,
        req: &ApiRequest,
        destination: &str,
        message: &str,
    ) -> ApiError {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credentials");
        }
        self.reauth.on_authentication_required(destination);
        self.fail(req, ErrorKind::AuthenticationRequired, Some(401), message)
    }

    fn check_cancelled(&self, req: &ApiRequest) -> ApiResult<()> {
        match &req.cancel {
            Some(token) if token.is_cancelled() => Err(self.cancelled(req)),
            _ => Ok(()),
        }
    }

    fn cancelled(&self, req: &ApiRequest) -> ApiError {
        info!("request cancelled by caller");
        self.fail(req, ErrorKind::Cancelled, None, "request cancelled")
    }

    fn fail(
        &self,
        req: &ApiRequest,
        kind: ErrorKind,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> ApiError {
        ApiError::new(kind, &req.method, &req.path, status, message)
    }
}

/// Path and query of the intended destination, handed to the
/// re-authentication hook.
fn destination(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

async fn read_message(status: u16, response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    extract_message(status, &body)
}

fn transport_message(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "connection failed".to_string()
    } else {
        format!("transport error: {e}")
    }
}
