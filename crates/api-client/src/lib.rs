//! Authenticated, retrying HTTP client
//!
//! Every request goes through one pipeline that attaches the stored
//! credential, refreshes it once on a 401, backs off on transient failures
//! and reduces everything else to a classified `ApiError`.
//!
//! Request flow:
//! 1. `ApiClient` builds an `ApiRequest` from the call and its options
//! 2. `Pipeline::execute` runs attempts until success or a terminal error
//! 3. `ApiClient` decodes the payload, unwrapping a `{"data": ...}` envelope

pub mod batch;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod reauth;
pub mod retry;
pub mod transfer;

pub use batch::BatchItem;
pub use client::{ApiClient, BatchRequest, RequestOptions};
pub use config::ClientConfig;
pub use error::{ApiError, ApiResult, Error, ErrorKind, Result};
pub use pipeline::{ApiRequest, Pipeline, RequestBody};
pub use reauth::{ChannelReauthHandler, LogReauthHandler, ReauthHandler};
pub use retry::RetryPolicy;
pub use transfer::{FilePart, Progress, ProgressFn};
