//! Encrypted credential store with proactive and single-flight refresh
//!
//! Holds one access/refresh credential pair per namespace, encrypted at rest
//! in a pluggable key-value area. This crate has no dependency on the request
//! pipeline and can be tested and used on its own.
//!
//! Credential flow:
//! 1. A login collaborator calls `CredentialStore::set_credentials()`
//! 2. The store arms a proactive refresh for `expires_at - proactive_window`
//! 3. Requests read the token via `CredentialStore::authorization()`
//! 4. A 401 in the pipeline calls `CredentialStore::refresh()` reactively;
//!    concurrent callers share one exchange
//! 5. Logout calls `CredentialStore::revoke()`, which always clears

pub mod cipher;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod scheduler;
pub mod storage;
pub mod token;

pub use cipher::TokenCipher;
pub use constants::*;
pub use credentials::{AuthStatus, CredentialStore, StoreConfig};
pub use error::{Error, Result};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use token::{TokenResponse, refresh_token, revoke_token};
