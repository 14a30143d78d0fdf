//! Persistent key-value area for credential records
//!
//! The credential store only needs string records under fixed keys, so the
//! backing area is abstracted behind `KeyValueStore`. `FileStore` keeps a
//! JSON map on disk; every write uses atomic temp-file + rename so a crash
//! mid-write never leaves a half-written file. `MemoryStore` backs tests and
//! sessions that must not touch disk.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn KeyValueStore>`).

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by `KeyValueStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// String key-value area holding credential records.
pub trait KeyValueStore: Send + Sync {
    /// Read a single record.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Insert or replace several records in one write.
    fn write(&self, entries: Vec<(String, String)>) -> StoreFuture<'_, ()>;

    /// Remove records. Missing keys are ignored.
    fn remove<'a>(&'a self, keys: &'a [String]) -> StoreFuture<'a, ()>;
}

/// JSON-file backed key-value area.
///
/// The Mutex serializes all writes; the lock is held across the disk write
/// so two writers can never interleave their temp files.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Load records from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` so the next load skips
    /// the cold-start path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let records: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), records = records.len(), "loaded credential records");
            records
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn write(&self, entries: Vec<(String, String)>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.extend(entries);
            write_atomic(&self.path, &next).await?;
            *state = next;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, keys: &'a [String]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            for key in keys {
                next.remove(key);
            }
            if next.len() != state.len() {
                debug!(removed = state.len() - next.len(), "removed credential records");
                write_atomic(&self.path, &next).await?;
                *state = next;
            }
            Ok(())
        })
    }
}

/// In-memory key-value area. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw record, bypassing encryption. Lets tests plant
    /// corrupted ciphertext.
    pub async fn insert_raw(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn write(&self, entries: Vec<(String, String)>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.extend(entries);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, keys: &'a [String]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for key in keys {
                state.remove(key);
            }
            Ok(())
        })
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The temp name carries the target's file name and a
/// per-process sequence number, so stores sharing a directory never
/// collide. Sets file permissions to 0600 (owner read/write only) since
/// the file holds credential material, even if encrypted.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credential records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("credential path has no file name".into()))?
        .to_string_lossy();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}.{seq}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential records");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn file_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store
            .write(entries(&[("ns.access_token", "enc_a"), ("ns.token_type", "Bearer")]))
            .await
            .unwrap();

        let reloaded = FileStore::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("ns.access_token").await.unwrap().as_deref(),
            Some("enc_a")
        );
        assert_eq!(
            reloaded.get("ns.token_type").await.unwrap().as_deref(),
            Some("Bearer")
        );
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = FileStore::load(path.clone()).await.unwrap();
        assert!(store.get("anything").await.unwrap().is_none());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = FileStore::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn remove_ignores_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(dir.path().join("credentials.json"))
            .await
            .unwrap();
        store.write(entries(&[("a", "1"), ("b", "2")])).await.unwrap();

        let keys = vec!["a".to_string(), "missing".to_string()];
        store.remove(&keys).await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileStore::load(path.clone()).await.unwrap();
        store.write(entries(&[("a", "1")])).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(FileStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .write(vec![(format!("key-{i}"), format!("value-{i}"))])
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stores_sharing_a_directory_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(FileStore::load(dir.path().join("tenant_a.json")).await.unwrap());
        let b = Arc::new(FileStore::load(dir.path().join("tenant_b.json")).await.unwrap());

        for round in 0..100 {
            let round = round.to_string();
            let (ra, rb) = tokio::join!(
                a.write(entries(&[("owner", "a"), ("round", &round)])),
                b.write(entries(&[("owner", "b"), ("round", &round)])),
            );
            ra.unwrap();
            rb.unwrap();
        }

        for (name, owner) in [("tenant_a.json", "a"), ("tenant_b.json", "b")] {
            let contents = tokio::fs::read_to_string(dir.path().join(name)).await.unwrap();
            let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
            assert_eq!(parsed.get("owner").map(String::as_str), Some(owner), "{name}");
            assert_eq!(parsed.get("round").map(String::as_str), Some("99"));
        }
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("state");
        std::fs::create_dir(&store_dir).unwrap();
        let store = FileStore::load(store_dir.join("credentials.json")).await.unwrap();
        store.write(entries(&[("a", "1")])).await.unwrap();

        std::fs::remove_dir_all(&store_dir).unwrap();
        assert!(store.write(entries(&[("a", "2"), ("b", "3")])).await.is_err());
        assert!(store.remove(&["a".to_string()]).await.is_err());

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_basics() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await);

        store.write(entries(&[("x", "1")])).await.unwrap();
        store.insert_raw("y", "raw").await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("y").await.unwrap().as_deref(), Some("raw"));

        store.remove(&["x".to_string(), "y".to_string()]).await.unwrap();
        assert!(store.is_empty().await);
    }
}
