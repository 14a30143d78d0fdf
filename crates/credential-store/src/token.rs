//! Refresh and revocation exchanges
//!
//! The only network calls the credential store makes. Both POST JSON to
//! fixed paths on the backend origin. A refresh response replaces the whole
//! credential pair; a revocation result is advisory.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the refresh endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The store
/// converts it to an absolute unix millisecond timestamp when persisting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Scheme label, when the server reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct RevokeRequest<'a> {
    token: &'a str,
    token_type_hint: &'a str,
}

/// Exchange a refresh token for a new credential pair.
///
/// Any non-success status is unrecoverable for this attempt. 401/403 mean
/// the refresh token itself was rejected and are reported as
/// `InvalidCredentials`.
pub async fn refresh_token(
    client: &reqwest::Client,
    url: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(url)
        .timeout(timeout)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    if token.access_token.is_empty() || token.refresh_token.is_empty() {
        return Err(Error::TokenExchange(
            "refresh response contained an empty token".into(),
        ));
    }

    Ok(token)
}

/// Ask the server to invalidate an access token.
///
/// `authorization` is the full header value (`"Bearer ..."`) of the token
/// being revoked.
pub async fn revoke_token(
    client: &reqwest::Client,
    url: &str,
    authorization: &str,
    token: &str,
    timeout: Duration,
) -> Result<()> {
    let response = client
        .post(url)
        .timeout(timeout)
        .header(reqwest::header::AUTHORIZATION, authorization)
        .json(&RevokeRequest {
            token,
            token_type_hint: "access_token",
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token revocation request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::TokenExchange(format!(
            "token revocation returned {status}"
        )));
    }
    Ok(())
}
