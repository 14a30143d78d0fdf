//! Error types for credential store operations

/// Errors from credential storage and the refresh/revoke exchanges.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token stored")]
    NoRefreshToken,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for credential store operations.
pub type Result<T> = std::result::Result<T, Error>;
