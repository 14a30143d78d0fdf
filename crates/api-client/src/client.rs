//! Caller-facing client
//!
//! Typed request methods over the shared pipeline. Each method builds an
//! `ApiRequest`, runs it to a 2xx response or a classified `ApiError`, then
//! decodes the (envelope-unwrapped) JSON payload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use credential_store::{
    AuthStatus, CredentialStore, FileStore, KeyValueStore, MemoryStore, TokenResponse,
};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{BatchItem, run_batch};
use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult, Error, ErrorKind, Result};
use crate::metrics;
use crate::middleware::unwrap_envelope;
use crate::pipeline::{ApiRequest, Pipeline, RequestBody};
use crate::reauth::ReauthHandler;
use crate::transfer::{
    DownloadError, FilePart, MultipartBody, ProgressFn, filename_from_headers,
    filename_from_path, write_download,
};

/// Per-call options shared by every request method.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured per-attempt timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One entry of a `batch` call.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub options: RequestOptions,
}

impl BatchRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn with_body(method: Method, path: impl Into<String>, body: Value) -> Self {
        Self {
            method,
            path: path.into(),
            body: Some(body),
            options: RequestOptions::default(),
        }
    }
}

/// Authenticated, retrying API client. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<Pipeline>,
}

impl ApiClient {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Build the transport, open the credential store and assemble the
    /// pipeline from configuration.
    pub async fn from_config(config: &ClientConfig, reauth: Arc<dyn ReauthHandler>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("api-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;

        let kv: Arc<dyn KeyValueStore> = match &config.credentials.store_path {
            Some(path) => Arc::new(FileStore::load(path.clone()).await?),
            None => Arc::new(MemoryStore::new()),
        };
        let store = CredentialStore::open(
            kv,
            config.encryption_key()?,
            http.clone(),
            config.store_config(),
        )
        .await?;

        let pipeline = Pipeline::new(http, &config.client.base_url, store)
            .with_retry_policy(config.retry_policy())
            .with_timeouts(config.timeout(), config.transfer_timeout())
            .with_reauth_handler(reauth);
        info!(base_url = %config.client.base_url, "api client ready");
        Ok(Self::new(pipeline))
    }

    /// The shared credential store.
    pub fn credentials(&self) -> &CredentialStore {
        self.pipeline.store()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> ApiResult<T> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let body = self.encode(&Method::POST, path, body)?;
        self.request(Method::POST, path, Some(body), options).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let body = self.encode(&Method::PUT, path, body)?;
        self.request(Method::PUT, path, Some(body), options).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let body = self.encode(&Method::PATCH, path, body)?;
        self.request(Method::PATCH, path, Some(body), options).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> ApiResult<T> {
        self.request(Method::DELETE, path, None, options).await
    }

    /// Any method with an optional JSON body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let mut req = request_for(method, path, options);
        if let Some(body) = body {
            req.body = RequestBody::Json(body);
        }
        let response = self.pipeline.execute(&req).await?;
        decode(&req, response).await
    }

    /// Upload one file as multipart form data.
    pub async fn upload_file<T: DeserializeOwned>(
        &self,
        path: &str,
        file: FilePart,
        fields: Vec<(String, String)>,
        progress: Option<ProgressFn>,
        options: RequestOptions,
    ) -> ApiResult<T> {
        self.upload_multiple_files(path, vec![file], fields, progress, options)
            .await
    }

    /// Upload several files in one multipart request. Progress covers the
    /// combined size of all files.
    pub async fn upload_multiple_files<T: DeserializeOwned>(
        &self,
        path: &str,
        files: Vec<FilePart>,
        fields: Vec<(String, String)>,
        progress: Option<ProgressFn>,
        options: RequestOptions,
    ) -> ApiResult<T> {
        let mut req = request_for(Method::POST, path, options);
        req.transfer = true;
        req.body = RequestBody::Multipart(MultipartBody {
            files,
            fields,
            progress,
        });
        let response = self.pipeline.execute(&req).await?;
        decode(&req, response).await
    }

    /// Download `path` into `dest_dir`.
    ///
    /// The file name is `filename` when given, else the response's
    /// `Content-Disposition`, else the last path segment. Returns the path
    /// written.
    pub async fn download_file(
        &self,
        path: &str,
        dest_dir: &Path,
        filename: Option<&str>,
        progress: Option<ProgressFn>,
        options: RequestOptions,
    ) -> ApiResult<PathBuf> {
        let mut req = request_for(Method::GET, path, options);
        req.transfer = true;
        let response = self.pipeline.execute(&req).await?;
        let status = response.status().as_u16();

        let name = filename
            .map(str::to_string)
            .or_else(|| filename_from_headers(response.headers()))
            .or_else(|| filename_from_path(path))
            .unwrap_or_else(|| "download".to_string());
        let dest = dest_dir.join(name);

        let written = write_download(response, &dest, progress.as_ref(), req.cancel.as_ref())
            .await
            .map_err(|e| {
                let (kind, status) = match e {
                    DownloadError::Body(_) => (ErrorKind::TransientFailure, Some(status)),
                    DownloadError::Io(_) => (ErrorKind::Unknown, Some(status)),
                    DownloadError::Cancelled => (ErrorKind::Cancelled, None),
                };
                record(ApiError::new(kind, &req.method, &req.path, status, e.to_string()))
            })?;
        info!(path, dest = %dest.display(), bytes = written, "download complete");
        Ok(dest)
    }

    /// Run requests in groups of `concurrency`, results in input order.
    pub async fn batch<T: DeserializeOwned>(
        &self,
        requests: Vec<BatchRequest>,
        concurrency: usize,
        fail_fast: bool,
    ) -> ApiResult<Vec<BatchItem<T>>> {
        run_batch(requests, concurrency, fail_fast, |req| async move {
            self.request(req.method, &req.path, req.body, req.options)
                .await
        })
        .await
    }

    /// Synchronous authentication snapshot.
    pub fn get_auth_status(&self) -> AuthStatus {
        self.credentials().status()
    }

    /// Force a refresh exchange. On failure the store is cleared.
    pub async fn refresh_authentication(&self) -> Result<()> {
        let outcome = self.credentials().refresh().await;
        metrics::record_refresh("manual", if outcome.is_ok() { "success" } else { "failure" });
        Ok(outcome?)
    }

    /// Store the pair obtained by a login flow.
    pub async fn set_credentials(&self, access: &str, refresh: &str, lifetime_secs: u64) -> Result<()> {
        Ok(self
            .credentials()
            .set_credentials(access, refresh, lifetime_secs)
            .await?)
    }

    /// Store a login exchange response as-is.
    pub async fn set_credential_pair(&self, token: &TokenResponse) -> Result<()> {
        Ok(self.credentials().set_credential_pair(token).await?)
    }

    /// Revoke server-side (best effort) and clear local credentials.
    pub async fn logout(&self) -> Result<()> {
        self.credentials().revoke().await?;
        info!("logged out");
        Ok(())
    }

    fn encode<B: Serialize + ?Sized>(&self, method: &Method, path: &str, body: &B) -> ApiResult<Value> {
        serde_json::to_value(body).map_err(|e| {
            record(ApiError::new(
                ErrorKind::Unknown,
                method,
                path,
                None,
                format!("serializing request body: {e}"),
            ))
        })
    }
}

fn request_for(method: Method, path: &str, options: RequestOptions) -> ApiRequest {
    ApiRequest {
        query: options.query,
        headers: options.headers,
        timeout: options.timeout,
        cancel: options.cancel,
        ..ApiRequest::new(method, path)
    }
}

/// Empty body decodes as `null`; an envelope's `data` field is unwrapped.
/// Reading the body still honours the caller's cancellation token.
async fn decode<T: DeserializeOwned>(req: &ApiRequest, response: reqwest::Response) -> ApiResult<T> {
    let status = response.status().as_u16();
    let read = match &req.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(path = %req.path, "request cancelled while reading response");
                return Err(record(ApiError::new(
                    ErrorKind::Cancelled,
                    &req.method,
                    &req.path,
                    None,
                    "request cancelled",
                )));
            }
            bytes = response.bytes() => bytes,
        },
        None => response.bytes().await,
    };
    let bytes = read.map_err(|e| {
        record(ApiError::new(
            ErrorKind::TransientFailure,
            &req.method,
            &req.path,
            Some(status),
            format!("reading response body: {e}"),
        ))
    })?;

    let payload = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(path = %req.path, status, error = %e, "response body is not JSON");
            record(ApiError::new(
                ErrorKind::Unknown,
                &req.method,
                &req.path,
                Some(status),
                format!("invalid JSON response: {e}"),
            ))
        })?
    };

    serde_json::from_value(unwrap_envelope(payload)).map_err(|e| {
        record(ApiError::new(
            ErrorKind::Unknown,
            &req.method,
            &req.path,
            Some(status),
            format!("unexpected response shape: {e}"),
        ))
    })
}

fn record(err: ApiError) -> ApiError {
    metrics::record_error(err.kind);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reauth::LogReauthHandler;
    use crate::retry::RetryPolicy;
    use crate::transfer::Progress;
    use credential_store::TokenCipher;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Invoice {
        id: u64,
        total: f64,
    }

    async fn client_for(server: &MockServer) -> ApiClient {
        client_at(&server.uri()).await
    }

    async fn client_at(base_url: &str) -> ApiClient {
        let config = credential_store::StoreConfig {
            proactive_refresh: false,
            ..credential_store::StoreConfig::new(base_url)
        };
        let store = CredentialStore::open(
            Arc::new(MemoryStore::new()),
            &TokenCipher::generate_key(),
            reqwest::Client::new(),
            config,
        )
        .await
        .unwrap();
        store.set_credentials("at_1", "rt_1", 3600).await.unwrap();

        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        };
        ApiClient::new(
            Pipeline::new(reqwest::Client::new(), base_url, store).with_retry_policy(policy),
        )
    }

    /// Answers one request with a 200 whose body stops after its first byte.
    async fn stalled_body_server(extra_headers: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 1000\r\n{extra_headers}\r\n{{"
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });
        format!("http://{addr}")
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        token
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<Progress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |p: Progress| sink.lock().unwrap().push(p)), seen)
    }

    #[tokio::test]
    async fn get_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": 7, "total": 120.5},
                "meta": {"currency": "EUR"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let invoice: Invoice = client.get("/invoices/7", RequestOptions::new()).await.unwrap();
        assert_eq!(invoice, Invoice { id: 7, total: 120.5 });
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoices"))
            .and(body_json(serde_json::json!({"customer": "acme", "lines": 3})))
            .and(header("x-idempotency-key", "k-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 9, "total": 0.0})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let options = RequestOptions::new().header(
            HeaderName::from_static("x-idempotency-key"),
            HeaderValue::from_static("k-1"),
        );
        let invoice: Invoice = client
            .post("/invoices", &serde_json::json!({"customer": "acme", "lines": 3}), options)
            .await
            .unwrap();
        assert_eq!(invoice.id, 9);
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/invoices/7"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let value: Value = client.delete("/invoices/7", RequestOptions::new()).await.unwrap();
        assert_eq!(value, Value::Null);
        let _: () = client.delete("/invoices/7", RequestOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn shape_mismatch_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices/7"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .get::<Invoice>("/invoices/7", RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.status, Some(200));
    }

    #[tokio::test]
    async fn batch_collects_partial_failures() {
        let server = MockServer::start().await;
        for n in 0..10u64 {
            let response = if n % 2 == 0 {
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": n, "total": 1.0}))
            } else {
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"detail": "no such invoice"}))
            };
            Mock::given(method("GET"))
                .and(path(format!("/invoices/{n}")))
                .respond_with(response)
                .mount(&server)
                .await;
        }

        let client = client_for(&server).await;
        let requests = (0..10).map(|n| BatchRequest::get(format!("/invoices/{n}"))).collect();
        let results = client.batch::<Invoice>(requests, 4, false).await.unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
        let failed = results[3].result.as_ref().unwrap_err();
        assert_eq!(failed.kind, ErrorKind::RequestRejected);
        assert_eq!(failed.message, "no such invoice");
        assert_eq!(results[8].result.as_ref().unwrap().id, 8);
    }

    #[tokio::test]
    async fn batch_fail_fast_returns_first_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices/1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 0, "total": 0.0})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let requests = (0..6).map(|n| BatchRequest::get(format!("/invoices/{n}"))).collect();
        let err = client.batch::<Invoice>(requests, 2, true).await.unwrap_err();
        assert_eq!(err.path, "/invoices/1");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn logout_clears_even_when_revoke_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/revoke"))
            .and(header("authorization", "Bearer at_1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.get_auth_status().is_authenticated);
        client.logout().await.unwrap();

        assert!(client.credentials().get_access_token().await.is_none());
        assert!(!client.get_auth_status().is_authenticated);
    }

    #[tokio::test]
    async fn refresh_authentication_failure_clears() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.refresh_authentication().await.is_err());
        assert!(client.credentials().get_access_token().await.is_none());
    }

    #[tokio::test]
    async fn upload_streams_parts_and_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attachments"))
            .and(body_string_contains("filename=\"notes.txt\""))
            .and(body_string_contains("quarterly numbers"))
            .and(body_string_contains("name=\"folder\""))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"data": {"stored": 1}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let (progress, seen) = recorder();
        let file = FilePart::new("file", "notes.txt", "quarterly numbers").with_content_type("text/plain");
        let stored: Value = client
            .upload_file(
                "/attachments",
                file,
                vec![("folder".into(), "reports".into())],
                Some(progress),
                RequestOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(stored, serde_json::json!({"stored": 1}));
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last, Progress { transferred: 17, total: Some(17) });
    }

    #[tokio::test]
    async fn upload_is_rebuilt_on_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attachments"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/attachments"))
            .and(body_string_contains("payload-bytes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let files = vec![
            FilePart::new("files", "a.bin", "payload-bytes"),
            FilePart::new("files", "b.bin", "more"),
        ];
        let result: Value = client
            .upload_multiple_files("/attachments", files, vec![], None, RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("payload-bytes"));
        assert!(body.contains("filename=\"b.bin\""));
    }

    #[tokio::test]
    async fn download_uses_content_disposition() {
        let server = MockServer::start().await;
        let content = vec![7u8; 200_000];
        Mock::given(method("GET"))
            .and(path("/exports/42"))
            .and(header("authorization", "Bearer at_1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"ledger.csv\"")
                    .set_body_bytes(content.clone()),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let (progress, seen) = recorder();
        let written = client
            .download_file("/exports/42", dir.path(), None, Some(progress), RequestOptions::new())
            .await
            .unwrap();

        assert_eq!(written, dir.path().join("ledger.csv"));
        assert_eq!(std::fs::read(&written).unwrap(), content);
        assert!(!dir.path().join("ledger.csv.part").exists());
        assert_eq!(seen.lock().unwrap().last().unwrap().transferred, 200_000);
    }

    #[tokio::test]
    async fn download_falls_back_to_path_or_explicit_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/exports/summary.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let dir = tempfile::tempdir().unwrap();

        let written = client
            .download_file("/exports/summary.pdf", dir.path(), None, None, RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(written, dir.path().join("summary.pdf"));

        let written = client
            .download_file(
                "/exports/summary.pdf",
                dir.path(),
                Some("q3.pdf"),
                None,
                RequestOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(written, dir.path().join("q3.pdf"));
    }

    #[tokio::test]
    async fn failed_download_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/exports/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let err = client
            .download_file("/exports/missing", dir.path(), None, None, RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RequestRejected);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancel_while_reading_body() {
        let base = stalled_body_server("").await;
        let client = client_at(&base).await;
        let options = RequestOptions::new()
            .cancel(cancel_after(Duration::from_millis(100)))
            .timeout(Duration::from_secs(3));

        let started = Instant::now();
        let err = client.get::<Value>("/reports", options).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancel_mid_download_removes_partial_file() {
        let base =
            stalled_body_server("content-disposition: attachment; filename=\"big.bin\"\r\n").await;
        let client = client_at(&base).await;
        let dir = tempfile::tempdir().unwrap();
        let options = RequestOptions::new().cancel(cancel_after(Duration::from_millis(100)));

        let started = Instant::now();
        let err = client
            .download_file("/exports/big", dir.path(), None, None, options)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn from_config_persists_to_file() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("credentials.json");
        let mut config = ClientConfig::parse(&format!(
            "[client]\nbase_url = \"{}\"\n\n[credentials]\nstore_path = \"{}\"\nproactive_refresh = false\n",
            server.uri(),
            store_path.display()
        ))
        .unwrap();
        config.credentials.key = Some(TokenCipher::generate_key());

        let client = ApiClient::from_config(&config, Arc::new(LogReauthHandler))
            .await
            .unwrap();
        client.set_credentials("at_file", "rt_file", 3600).await.unwrap();

        let raw = std::fs::read_to_string(&store_path).unwrap();
        assert!(raw.contains("api_client.auth.access_token"));
        assert!(!raw.contains("at_file"));

        let reopened = ApiClient::from_config(&config, Arc::new(LogReauthHandler))
            .await
            .unwrap();
        assert_eq!(
            reopened.credentials().get_access_token().await.as_deref(),
            Some("at_file")
        );
    }

    #[tokio::test]
    async fn from_config_requires_key() {
        let config = ClientConfig::parse("[client]\nbase_url = \"https://api.example.com\"\n").unwrap();
        let result = ApiClient::from_config(&config, Arc::new(LogReauthHandler)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
