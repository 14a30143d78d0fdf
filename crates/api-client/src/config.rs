//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The credential encryption key is loaded from the API_CLIENT_KEY env var
//! or `credentials.key_file`, never stored in the TOML directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use credential_store::{StoreConfig, TokenCipher};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Env var holding the base64 credential encryption key.
pub const KEY_ENV: &str = "API_CLIENT_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub credentials: CredentialsSection,
}

/// Backend and transport settings
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

/// Backoff for transient failures
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: u64,
}

/// Credential persistence and refresh settings
#[derive(Debug, Deserialize)]
pub struct CredentialsSection {
    /// Credential file; credentials live in memory only when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_revoke_path")]
    pub revoke_path: String,
    #[serde(default = "default_skew_buffer")]
    pub skew_buffer_secs: u64,
    #[serde(default = "default_proactive_window")]
    pub proactive_window_secs: u64,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub proactive_refresh: bool,
    /// Path to a file containing the base64 key (alternative to API_CLIENT_KEY)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(skip)]
    pub key: Option<Secret<Vec<u8>>>,
}

fn default_timeout() -> u64 {
    30
}

fn default_transfer_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_jitter() -> u64 {
    1000
}

fn default_namespace() -> String {
    credential_store::DEFAULT_NAMESPACE.to_string()
}

fn default_refresh_path() -> String {
    credential_store::DEFAULT_REFRESH_PATH.to_string()
}

fn default_revoke_path() -> String {
    credential_store::DEFAULT_REVOKE_PATH.to_string()
}

fn default_skew_buffer() -> u64 {
    credential_store::DEFAULT_SKEW_BUFFER.as_secs()
}

fn default_proactive_window() -> u64 {
    credential_store::DEFAULT_PROACTIVE_WINDOW.as_secs()
}

fn default_exchange_timeout() -> u64 {
    credential_store::DEFAULT_EXCHANGE_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_jitter_ms: default_max_jitter(),
        }
    }
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            store_path: None,
            namespace: default_namespace(),
            refresh_path: default_refresh_path(),
            revoke_path: default_revoke_path(),
            skew_buffer_secs: default_skew_buffer(),
            proactive_window_secs: default_proactive_window(),
            exchange_timeout_secs: default_exchange_timeout(),
            proactive_refresh: true,
            key_file: None,
            key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file, then resolve the encryption key.
    ///
    /// Key resolution order:
    /// 1. API_CLIENT_KEY env var
    /// 2. key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.resolve_key()?;
        Ok(config)
    }

    /// Parse and validate TOML without touching the environment.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.client.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        for (name, value) in [
            ("timeout_secs", self.client.timeout_secs),
            ("transfer_timeout_secs", self.client.transfer_timeout_secs),
            ("exchange_timeout_secs", self.credentials.exchange_timeout_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(common::Error::Config(
                "max_delay_ms must not be less than base_delay_ms".into(),
            ));
        }

        for (name, path) in [
            ("refresh_path", &self.credentials.refresh_path),
            ("revoke_path", &self.credentials.revoke_path),
        ] {
            if !path.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {path}"
                )));
            }
        }

        if self.credentials.namespace.is_empty() {
            return Err(common::Error::Config("namespace must not be empty".into()));
        }
        Ok(())
    }

    fn resolve_key(&mut self) -> common::Result<()> {
        let encoded = if let Ok(key) = std::env::var(KEY_ENV) {
            Some(key)
        } else if let Some(ref key_file) = self.credentials.key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            Some(key)
        } else {
            None
        };

        if let Some(encoded) = encoded {
            let encoded = encoded.trim();
            if !encoded.is_empty() {
                let key = TokenCipher::key_from_base64(encoded)
                    .map_err(|e| common::Error::Config(format!("invalid encryption key: {e}")))?;
                self.credentials.key = Some(key);
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("api-client.toml")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        let creds = &self.credentials;
        StoreConfig {
            base_url: self.client.base_url.clone(),
            refresh_path: creds.refresh_path.clone(),
            revoke_path: creds.revoke_path.clone(),
            namespace: creds.namespace.clone(),
            skew_buffer: Duration::from_secs(creds.skew_buffer_secs),
            proactive_window: Duration::from_secs(creds.proactive_window_secs),
            exchange_timeout: Duration::from_secs(creds.exchange_timeout_secs),
            proactive_refresh: creds.proactive_refresh,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.client.transfer_timeout_secs)
    }

    /// The resolved encryption key.
    pub fn encryption_key(&self) -> common::Result<&Secret<Vec<u8>>> {
        self.credentials.key.as_ref().ok_or_else(|| {
            common::Error::Config(format!(
                "no encryption key: set {KEY_ENV} or credentials.key_file"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const TEST_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    fn minimal_toml() -> &'static str {
        r#"
[client]
base_url = "https://api.example.com"
"#
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::parse(minimal_toml()).unwrap();
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.client.transfer_timeout_secs, 300);
        assert_eq!(config.retry.max_retries, 3);

        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_jitter, Duration::from_secs(1));

        let store = config.store_config();
        assert_eq!(store.base_url, "https://api.example.com");
        assert_eq!(store.refresh_path, "/auth/refresh");
        assert_eq!(store.namespace, "api_client.auth");
        assert_eq!(store.skew_buffer, Duration::from_secs(30));
        assert_eq!(store.proactive_window, Duration::from_secs(300));
        assert!(store.proactive_refresh);
        assert!(config.credentials.store_path.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = ClientConfig::parse(
            r#"
[client]
base_url = "http://localhost:8000/api"
timeout_secs = 10
transfer_timeout_secs = 600

[retry]
max_retries = 5
base_delay_ms = 200
max_delay_ms = 5000
max_jitter_ms = 0

[credentials]
store_path = "/var/lib/api-client/credentials.json"
namespace = "billing.auth"
refresh_path = "/v2/token/refresh"
proactive_refresh = false
"#,
        )
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(600));
        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(config.retry_policy().max_jitter, Duration::ZERO);
        let store = config.store_config();
        assert_eq!(store.namespace, "billing.auth");
        assert_eq!(store.refresh_path, "/v2/token/refresh");
        assert_eq!(store.revoke_path, "/auth/revoke");
        assert!(!store.proactive_refresh);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load(Path::new("/nonexistent/path/api-client.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let err = ClientConfig::parse("not valid {{{{ toml").unwrap_err();
        assert!(matches!(err, common::Error::Toml(_)));
    }

    #[test]
    fn test_missing_client_section() {
        assert!(ClientConfig::parse("[retry]\nmax_retries = 1\n").is_err());
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let err = ClientConfig::parse("[client]\nbase_url = \"ftp://files.example.com\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = ClientConfig::parse(
            "[client]\nbase_url = \"https://api.example.com\"\ntimeout_secs = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let toml = format!(
            "{}\n[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n",
            minimal_toml()
        );
        assert!(ClientConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_rejects_relative_refresh_path() {
        let toml = format!("{}\n[credentials]\nrefresh_path = \"auth/refresh\"\n", minimal_toml());
        let err = ClientConfig::parse(&toml).unwrap_err();
        assert!(err.to_string().contains("refresh_path"));
    }

    #[test]
    fn test_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-client.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        unsafe { set_env(KEY_ENV, TEST_KEY) };
        let config = ClientConfig::load(&path).unwrap();
        unsafe { remove_env(KEY_ENV) };

        let key = config.encryption_key().unwrap();
        assert_eq!(key.expose().len(), 32);
        assert_eq!(key.expose()[1], 1);
    }

    #[test]
    fn test_key_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, format!("{TEST_KEY}\n")).unwrap();
        let config_path = dir.path().join("api-client.toml");
        std::fs::write(
            &config_path,
            format!(
                "{}\n[credentials]\nkey_file = \"{}\"\n",
                minimal_toml(),
                key_path.display()
            ),
        )
        .unwrap();

        unsafe { remove_env(KEY_ENV) };
        let config = ClientConfig::load(&config_path).unwrap();
        assert!(config.encryption_key().is_ok());
    }

    #[test]
    fn test_missing_key_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("api-client.toml");
        std::fs::write(
            &config_path,
            format!("{}\n[credentials]\nkey_file = \"/nonexistent/key\"\n", minimal_toml()),
        )
        .unwrap();

        unsafe { remove_env(KEY_ENV) };
        let err = ClientConfig::load(&config_path).unwrap_err();
        assert!(err.to_string().contains("key_file"));
    }

    #[test]
    fn test_invalid_key_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-client.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        unsafe { set_env(KEY_ENV, "c2hvcnQ=") };
        let result = ClientConfig::load(&path);
        unsafe { remove_env(KEY_ENV) };

        assert!(result.unwrap_err().to_string().contains("encryption key"));
    }

    #[test]
    fn test_no_key_configured() {
        let config = ClientConfig::parse(minimal_toml()).unwrap();
        assert!(config.encryption_key().is_err());
    }

    #[test]
    fn test_resolve_path_cli_wins() {
        let path = ClientConfig::resolve_path(Some("/etc/api-client/custom.toml"));
        assert_eq!(path, PathBuf::from("/etc/api-client/custom.toml"));
    }

    #[test]
    fn test_resolve_path_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/tmp/from-env.toml") };
        assert_eq!(
            ClientConfig::resolve_path(None),
            PathBuf::from("/tmp/from-env.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            ClientConfig::resolve_path(None),
            PathBuf::from("api-client.toml")
        );
    }
}
