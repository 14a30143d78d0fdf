//! Upload and download bodies
//!
//! Upload payloads are kept as `Bytes` so each retry can rebuild its
//! multipart form; the form streams the bytes in chunks and reports
//! progress as they are handed to the transport. Downloads stream the
//! response body to a temp file beside the destination and rename it into
//! place once complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};
use reqwest::multipart::{Form, Part};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Bytes moved so far out of `total` (when known).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: Option<u64>,
}

/// Progress callback shared across attempts.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// One file in a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name
    pub field_name: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FilePart {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Read a file from disk, using its file name for the part.
    pub async fn from_path(field_name: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(field_name, file_name, data))
    }
}

/// Retained multipart payload, rebuilt into a fresh `Form` per attempt.
#[derive(Clone)]
pub struct MultipartBody {
    pub files: Vec<FilePart>,
    pub fields: Vec<(String, String)>,
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for MultipartBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartBody")
            .field("files", &self.files.len())
            .field("fields", &self.fields.len())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

impl MultipartBody {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    /// Build the form for one attempt. Progress restarts from zero.
    pub fn to_form(&self) -> reqwest::Result<Form> {
        let total = self.total_bytes();
        let sent = Arc::new(AtomicU64::new(0));

        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        for file in &self.files {
            let stream = progress_stream(file.data.clone(), sent.clone(), total, self.progress.clone());
            let mut part =
                Part::stream_with_length(reqwest::Body::wrap_stream(stream), file.data.len() as u64)
                    .file_name(file.file_name.clone());
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part(file.field_name.clone(), part);
        }
        Ok(form)
    }
}

fn progress_stream(
    data: Bytes,
    sent: Arc<AtomicU64>,
    total: u64,
    progress: Option<ProgressFn>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK).min(data.len())))
        .collect();

    stream::iter(chunks.into_iter().map(move |chunk| {
        let transferred = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
        if let Some(progress) = &progress {
            progress(Progress {
                transferred,
                total: Some(total),
            });
        }
        Ok(chunk)
    }))
}

/// File name from a `Content-Disposition` header.
///
/// Prefers the RFC 5987 `filename*=` form over `filename=`. Directory
/// components are stripped so a hostile header cannot escape the
/// destination directory.
pub fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    let disposition = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let mut plain = None;
    let mut extended = None;

    for param in disposition.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = value.trim().splitn(3, '\'').nth(2).unwrap_or(value);
                extended = Some(percent_decode(encoded.trim_matches('"')));
            }
            "filename" => plain = Some(value.trim().trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended.or(plain).and_then(|name| sanitize_filename(&name))
}

/// Last non-empty segment of a request path.
pub fn filename_from_path(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .and_then(|s| sanitize_filename(&percent_decode(s)))
}

fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Stream a response body to `dest`, reporting progress per chunk.
///
/// Writes to `<dest>.part` and renames on completion, so a failed or
/// cancelled download never leaves a truncated file under the final name.
pub async fn write_download(
    mut response: reqwest::Response,
    dest: &Path,
    progress: Option<&ProgressFn>,
    cancel: Option<&CancellationToken>,
) -> Result<u64, DownloadError> {
    let total = response.content_length();
    let tmp = part_path(dest);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| DownloadError::Io(format!("creating {}: {e}", tmp.display())))?;

    let mut transferred = 0u64;
    let result = async {
        while let Some(chunk) = next_chunk(&mut response, cancel).await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::Io(format!("writing {}: {e}", tmp.display())))?;
            transferred += chunk.len() as u64;
            if let Some(progress) = progress {
                progress(Progress { transferred, total });
            }
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::Io(format!("flushing {}: {e}", tmp.display())))?;
        Ok::<(), DownloadError>(())
    }
    .await;

    drop(file);

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| DownloadError::Io(format!("renaming to {}: {e}", dest.display())))?;
    debug!(path = %dest.display(), bytes = transferred, "download written");
    Ok(transferred)
}

async fn next_chunk(
    response: &mut reqwest::Response,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Bytes>, DownloadError> {
    let chunk = match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = response.chunk() => chunk,
        },
        None => response.chunk().await,
    };
    chunk.map_err(|e| DownloadError::Body(e.to_string()))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Failure while writing a download to disk.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("response body interrupted: {0}")]
    Body(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("download cancelled")]
    Cancelled,
}
