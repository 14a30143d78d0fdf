//! Credential store
//!
//! Single source of truth for authentication state. Tokens and expiry are
//! encrypted before they reach the key-value area and decrypted only for the
//! duration of one read. Lifecycle metadata (expiry, presence, scheme) is
//! mirrored in memory so status queries never decrypt or touch the network.
//!
//! Every replace or clear bumps a generation counter. The generation drives
//! two things: stale proactive timers recognise themselves and do nothing,
//! and concurrent `refresh()` callers that queued behind an exchange return
//! its outcome instead of spending the single-use refresh token again.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use common::{Secret, unix_millis};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cipher::TokenCipher;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::scheduler::RefreshTimer;
use crate::storage::KeyValueStore;
use crate::token::{self, TokenResponse};

/// Credential store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend origin the exchanges are sent to (`https://api.example.com`)
    pub base_url: String,
    pub refresh_path: String,
    pub revoke_path: String,
    pub namespace: String,
    pub skew_buffer: Duration,
    pub proactive_window: Duration,
    pub exchange_timeout: Duration,
    /// Arm the proactive refresh timer on every credential replace
    pub proactive_refresh: bool,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.into(),
            revoke_path: DEFAULT_REVOKE_PATH.into(),
            namespace: DEFAULT_NAMESPACE.into(),
            skew_buffer: DEFAULT_SKEW_BUFFER,
            proactive_window: DEFAULT_PROACTIVE_WINDOW,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            proactive_refresh: true,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Synchronous snapshot of authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub is_authenticated: bool,
    pub has_valid_token: bool,
    /// Expiry as unix timestamp in milliseconds
    pub token_expiry: Option<u64>,
}

/// Full key names of the persisted records.
struct RecordKeys {
    access: String,
    refresh: String,
    expires_at: String,
    token_type: String,
}

impl RecordKeys {
    fn new(namespace: &str) -> Self {
        Self {
            access: format!("{namespace}.{ACCESS_TOKEN_RECORD}"),
            refresh: format!("{namespace}.{REFRESH_TOKEN_RECORD}"),
            expires_at: format!("{namespace}.{EXPIRES_AT_RECORD}"),
            token_type: format!("{namespace}.{TOKEN_TYPE_RECORD}"),
        }
    }

    fn all(&self) -> [String; 4] {
        [
            self.access.clone(),
            self.refresh.clone(),
            self.expires_at.clone(),
            self.token_type.clone(),
        ]
    }
}

/// Plaintext lifecycle metadata. `expires_at` is `Some` exactly when an
/// access token is stored.
#[derive(Debug, Clone, Default)]
struct Metadata {
    expires_at: Option<u64>,
    token_type: Option<String>,
}

struct Inner {
    kv: Arc<dyn KeyValueStore>,
    cipher: TokenCipher,
    http: reqwest::Client,
    config: StoreConfig,
    keys: RecordKeys,
    meta: RwLock<Metadata>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    timer: RefreshTimer,
}

/// Encrypted, persistent access/refresh credential pair with lifecycle
/// queries and a single-flight refresh.
///
/// Cheap to clone; clones share state. Pass one handle to every pipeline
/// that talks to the same backend.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("namespace", &self.inner.config.namespace)
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish()
    }
}

impl CredentialStore {
    /// Open a store over an existing key-value area.
    ///
    /// Rebuilds in-memory metadata from persisted records. A credential that
    /// survives from a previous process re-arms the proactive timer; records
    /// that fail to decrypt or violate the access/expiry invariant are
    /// cleared.
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        key: &Secret<Vec<u8>>,
        http: reqwest::Client,
        config: StoreConfig,
    ) -> Result<Self> {
        let cipher = TokenCipher::new(key)?;
        let keys = RecordKeys::new(&config.namespace);
        let store = Self {
            inner: Arc::new(Inner {
                kv,
                cipher,
                http,
                config,
                keys,
                meta: RwLock::new(Metadata::default()),
                generation: AtomicU64::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
                timer: RefreshTimer::new(),
            }),
        };
        store.restore().await?;
        Ok(store)
    }

    async fn restore(&self) -> Result<()> {
        let inner = &self.inner;
        let has_access = inner.kv.get(&inner.keys.access).await?.is_some();
        let token_type = inner.kv.get(&inner.keys.token_type).await?;
        let expires_at = match inner.kv.get(&inner.keys.expires_at).await? {
            Some(stored) => match inner.cipher.decrypt(&stored) {
                Ok(plain) => plain.parse::<u64>().ok(),
                Err(e) => {
                    warn!(error = %e, "stored expiry failed to decrypt, clearing credentials");
                    None
                }
            },
            None => None,
        };

        match (has_access, expires_at) {
            (true, Some(expires_at)) => {
                *self.write_meta() = Metadata {
                    expires_at: Some(expires_at),
                    token_type,
                };
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    namespace = %inner.config.namespace,
                    expires_at,
                    "restored persisted credentials"
                );
                self.arm_refresh_timer(generation, expires_at, Duration::ZERO);
                Ok(())
            }
            (false, None) => {
                debug!(namespace = %inner.config.namespace, "no persisted credentials");
                Ok(())
            }
            _ => {
                warn!(
                    namespace = %inner.config.namespace,
                    "persisted credentials incomplete, clearing"
                );
                self.clear().await
            }
        }
    }

    /// Store a new credential pair, replacing any existing one.
    ///
    /// `expires_at = now + lifetime_secs`. Cancels the outstanding proactive
    /// timer and arms a new one for the new expiry.
    pub async fn set_credentials(
        &self,
        access: &str,
        refresh: &str,
        lifetime_secs: u64,
    ) -> Result<()> {
        let expires_at = unix_millis() + lifetime_secs.saturating_mul(1000);
        self.replace(access, refresh, expires_at, None, Duration::ZERO)
            .await
    }

    /// Store the pair returned by a login or refresh exchange.
    pub async fn set_credential_pair(&self, token: &TokenResponse) -> Result<()> {
        self.store_pair(token, Duration::ZERO).await
    }

    /// Store a pair issued by our own refresh exchange. The next proactive
    /// refresh waits at least half the new lifetime, so a server that issues
    /// tokens shorter than the proactive window is not asked again at once.
    async fn store_refreshed(&self, token: &TokenResponse) -> Result<()> {
        let half_life = Duration::from_secs(token.expires_in / 2);
        self.store_pair(token, half_life.max(MIN_PROACTIVE_DELAY))
            .await
    }

    async fn store_pair(&self, token: &TokenResponse, min_delay: Duration) -> Result<()> {
        let expires_at = unix_millis() + token.expires_in.saturating_mul(1000);
        self.replace(
            &token.access_token,
            &token.refresh_token,
            expires_at,
            token.token_type.clone(),
            min_delay,
        )
        .await
    }

    async fn replace(
        &self,
        access: &str,
        refresh: &str,
        expires_at: u64,
        token_type: Option<String>,
        min_delay: Duration,
    ) -> Result<()> {
        let inner = &self.inner;
        if access.is_empty() {
            return Err(Error::InvalidCredentials("access token is empty".into()));
        }
        let token_type = token_type.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        let entries = vec![
            (inner.keys.access.clone(), inner.cipher.encrypt(access)?),
            (inner.keys.refresh.clone(), inner.cipher.encrypt(refresh)?),
            (
                inner.keys.expires_at.clone(),
                inner.cipher.encrypt(&expires_at.to_string())?,
            ),
            (inner.keys.token_type.clone(), token_type.clone()),
        ];
        inner.kv.write(entries).await?;

        let generation = {
            let mut meta = self.write_meta();
            *meta = Metadata {
                expires_at: Some(expires_at),
                token_type: Some(token_type),
            };
            inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        debug!(generation, expires_at, "stored credentials");

        self.arm_refresh_timer(generation, expires_at, min_delay);
        Ok(())
    }

    /// Decrypted access token, or `None` if absent or unreadable.
    pub async fn get_access_token(&self) -> Option<String> {
        self.read_decrypted(&self.inner.keys.access).await
    }

    /// Decrypted refresh token, or `None` if absent or unreadable.
    pub async fn get_refresh_token(&self) -> Option<String> {
        self.read_decrypted(&self.inner.keys.refresh).await
    }

    /// `Authorization` header value for the current access token.
    pub async fn authorization(&self) -> Option<String> {
        let token = self.get_access_token().await?;
        Some(format!("{} {}", self.token_type(), token))
    }

    /// Corrupted ciphertext must never be silently reused: a decryption
    /// failure clears the whole store.
    async fn read_decrypted(&self, key: &str) -> Option<String> {
        let stored = match self.inner.kv.get(key).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(error = %e, "failed to read credential record");
                return None;
            }
        };
        match self.inner.cipher.decrypt(&stored) {
            Ok(plain) => Some(plain),
            Err(e) => {
                warn!(error = %e, "credential record failed to decrypt, clearing store");
                if let Err(e) = self.clear().await {
                    warn!(error = %e, "failed to clear credential store");
                }
                None
            }
        }
    }

    /// Whether the access token is expired (or missing), allowing for the
    /// skew buffer.
    pub fn is_expired(&self) -> bool {
        self.expires_within(self.inner.config.skew_buffer)
    }

    /// Whether the access token is inside the proactive refresh window (or
    /// missing).
    pub fn is_expiring_soon(&self) -> bool {
        self.expires_within(self.inner.config.proactive_window)
    }

    fn expires_within(&self, margin: Duration) -> bool {
        expires_within(self.read_meta().expires_at, margin)
    }

    /// Synchronous snapshot, no decryption and no network call.
    pub fn status(&self) -> AuthStatus {
        let expires_at = self.read_meta().expires_at;
        AuthStatus {
            is_authenticated: expires_at.is_some(),
            has_valid_token: !expires_within(expires_at, self.inner.config.skew_buffer),
            token_expiry: expires_at,
        }
    }

    /// Scheme label for the stored credential.
    pub fn token_type(&self) -> String {
        self.read_meta()
            .token_type
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string())
    }

    /// Counter bumped on every replace and clear.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Single-flight: callers queue on one lock. A caller that finds the
    /// generation moved while it waited returns the outcome of the exchange
    /// that moved it, without issuing its own. Any failure clears the store.
    pub async fn refresh(&self) -> Result<()> {
        let observed = self.generation();
        let _guard = self.inner.refresh_lock.lock().await;

        if self.generation() != observed {
            return if self.status().has_valid_token {
                debug!("credentials replaced while waiting, reusing concurrent refresh");
                Ok(())
            } else {
                Err(Error::InvalidCredentials(
                    "credentials cleared by a concurrent refresh".into(),
                ))
            };
        }

        match self.exchange().await {
            Ok(token) => {
                if let Err(e) = self.store_refreshed(&token).await {
                    warn!(error = %e, "failed to persist refreshed credentials");
                    self.clear_logged().await;
                    return Err(e);
                }
                info!(generation = self.generation(), "token refresh succeeded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, clearing credentials");
                self.clear_logged().await;
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<TokenResponse> {
        let refresh = self
            .get_refresh_token()
            .await
            .ok_or(Error::NoRefreshToken)?;
        let config = &self.inner.config;
        token::refresh_token(
            &self.inner.http,
            &config.endpoint(&config.refresh_path),
            &refresh,
            config.exchange_timeout,
        )
        .await
    }

    /// Erase all stored records and cancel the proactive timer.
    pub async fn clear(&self) -> Result<()> {
        let inner = &self.inner;
        inner.timer.cancel();
        {
            let mut meta = self.write_meta();
            *meta = Metadata::default();
            inner.generation.fetch_add(1, Ordering::SeqCst);
        }
        let keys = inner.keys.all();
        inner.kv.remove(&keys).await?;
        debug!(namespace = %inner.config.namespace, "cleared credentials");
        Ok(())
    }

    async fn clear_logged(&self) {
        if let Err(e) = self.clear().await {
            warn!(error = %e, "failed to clear credential store");
        }
    }

    /// Best-effort server-side revocation of the access token, followed
    /// unconditionally by `clear()`.
    pub async fn revoke(&self) -> Result<()> {
        if let Some(access) = self.get_access_token().await {
            let config = &self.inner.config;
            let authorization = format!("{} {}", self.token_type(), access);
            match token::revoke_token(
                &self.inner.http,
                &config.endpoint(&config.revoke_path),
                &authorization,
                &access,
                config.exchange_timeout,
            )
            .await
            {
                Ok(()) => info!("access token revoked"),
                Err(e) => warn!(error = %e, "token revocation failed, clearing locally anyway"),
            }
        }
        self.clear().await
    }

    /// Arm the proactive timer for `expires_at - proactive_window`, but no
    /// sooner than `min_delay` from now. A zero delay fires immediately.
    fn arm_refresh_timer(&self, generation: u64, expires_at: u64, min_delay: Duration) {
        let inner = &self.inner;
        if !inner.config.proactive_refresh {
            return;
        }
        let fire_at = expires_at.saturating_sub(inner.config.proactive_window.as_millis() as u64);
        let delay = Duration::from_millis(fire_at.saturating_sub(unix_millis())).max(min_delay);
        let weak = Arc::downgrade(inner);

        debug!(generation, delay_secs = delay.as_secs(), "arming proactive refresh");
        inner.timer.arm(generation, || {
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.timer.release(generation) {
                    debug!(generation, "stale refresh timer fired, ignoring");
                    return;
                }
                let store = CredentialStore { inner };
                match store.refresh_detached().await {
                    Ok(()) => {
                        record_proactive_refresh("success");
                        info!("proactive token refresh succeeded");
                    }
                    Err(e) => {
                        record_proactive_refresh("failure");
                        warn!(error = %e, "proactive token refresh failed");
                    }
                }
            })
        });
    }

    /// Boxed `refresh()` for the timer task; the box breaks the type cycle
    /// refresh -> replace -> timer -> refresh.
    fn refresh_detached(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.refresh())
    }

    fn read_meta(&self) -> std::sync::RwLockReadGuard<'_, Metadata> {
        self.inner.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_meta(&self) -> std::sync::RwLockWriteGuard<'_, Metadata> {
        self.inner.meta.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn expires_within(expires_at: Option<u64>, margin: Duration) -> bool {
    match expires_at {
        Some(expires_at) => unix_millis() > expires_at.saturating_sub(margin.as_millis() as u64),
        None => true,
    }
}

/// Same counter the request pipeline uses for reactive and manual refreshes.
fn record_proactive_refresh(outcome: &'static str) {
    metrics::counter!(
        "api_client_refresh_total",
        "origin" => "proactive",
        "outcome" => outcome
    )
    .increment(1);
}
