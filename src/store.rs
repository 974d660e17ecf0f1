//! Replace-whole-collection stores for shared negotiation state
//!
//! Recent targets, cached tokens, client registrations and pending
//! authorization handoffs are process-wide state that several attempts may
//! read and write concurrently. Every store exposes only two operations:
//! [`Store::get`] returns a snapshot and [`Store::replace_all`] swaps in a
//! complete new value. No store offers in-place mutation, so a reader can
//! never observe a half-applied update.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{NegotiatorError, Result};

/// Narrow persistence interface used by every shared cache.
pub trait Store<T>: Send + Sync + Debug {
    /// Returns a snapshot of the stored value, or `T::default()` when
    /// nothing has been stored yet.
    fn get(&self) -> Result<T>;

    /// Atomically replaces the stored value.
    fn replace_all(&self, value: T) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Process-local store.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::store::{MemoryStore, Store};
///
/// let store: MemoryStore<Vec<String>> = MemoryStore::default();
/// store.replace_all(vec!["a".to_string()]).unwrap();
/// assert_eq!(store.get().unwrap(), vec!["a".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    value: RwLock<T>,
}

impl<T> MemoryStore<T> {
    /// Creates a store seeded with `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + Debug,
{
    fn get(&self) -> Result<T> {
        let guard = self
            .value
            .read()
            .map_err(|_| NegotiatorError::Storage("memory store lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn replace_all(&self, value: T) -> Result<()> {
        let mut guard = self
            .value
            .write()
            .map_err(|_| NegotiatorError::Storage("memory store lock poisoned".to_string()))?;
        *guard = value;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// Store backed by a JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a concurrent reader sees either the old or the new document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store writing to `path`. The parent directory is created on
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl<T> Store<T> for JsonFileStore
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    fn get(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            NegotiatorError::Storage(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        if contents.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn replace_all(&self, value: T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&value)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            NegotiatorError::Storage(format!("failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KeyringStore
// ---------------------------------------------------------------------------

/// Store backed by the operating system credential store.
///
/// Used for secrets (tokens, client registrations). The whole collection is
/// serialized to JSON and stored as a single credential entry.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
    account: String,
}

impl KeyringStore {
    /// Service name prefix used for every entry.
    pub const SERVICE_PREFIX: &'static str = "mcp-negotiator";

    /// Creates a store for the named collection.
    pub fn new(collection: &str) -> Self {
        Self {
            service: format!("{}-{}", Self::SERVICE_PREFIX, collection),
            account: "default".to_string(),
        }
    }

    /// Service name of the underlying keyring entry.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service, &self.account)?)
    }
}

impl<T> Store<T> for KeyringStore
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    fn get(&self) -> Result<T> {
        match self.entry()?.get_password() {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(keyring::Error::NoEntry) => Ok(T::default()),
            Err(e) => Err(NegotiatorError::Keyring(e).into()),
        }
    }

    fn replace_all(&self, value: T) -> Result<()> {
        let json = serde_json::to_string(&value)?;
        self.entry()?.set_password(&json)?;
        tracing::debug!(service = %self.service, "Replaced keyring collection");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KeyedCache
// ---------------------------------------------------------------------------

/// A map-shaped cache layered over a [`Store`].
///
/// Every mutation reads a snapshot, builds a new map and replaces the whole
/// collection. Mutations through one cache (and its clones) are serialized,
/// so a concurrent `take` hands a value to exactly one caller and concurrent
/// `put`s for different keys never drop each other.
#[derive(Debug, Clone)]
pub struct KeyedCache<V> {
    store: Arc<dyn Store<HashMap<String, V>>>,
    writer: Arc<Mutex<()>>,
}

impl<V> KeyedCache<V>
where
    V: Clone,
{
    /// Wraps `store`.
    pub fn new(store: Arc<dyn Store<HashMap<String, V>>>) -> Self {
        Self {
            store,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// In-memory cache, mostly for tests and ephemeral sessions.
    pub fn in_memory() -> Self
    where
        V: Send + Sync + Debug + 'static,
    {
        Self::new(Arc::new(MemoryStore::<HashMap<String, V>>::default()))
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.store.get()?.get(key).cloned())
    }

    /// Applies `f` to the current map and stores the result.
    ///
    /// The snapshot read and the replacement happen under one lock. The
    /// collection is only written back when `f` reports a change.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, V>) -> (R, bool)) -> Result<R> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| NegotiatorError::Storage("keyed cache lock poisoned".to_string()))?;
        let mut next = self.store.get()?;
        let (result, changed) = f(&mut next);
        if changed {
            self.store.replace_all(next)?;
        }
        Ok(result)
    }

    /// Stores `value` under `key`, replacing the whole collection.
    pub fn put(&self, key: &str, value: V) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_string(), value);
            ((), true)
        })
    }

    /// Removes and returns the value under `key`.
    pub fn take(&self, key: &str) -> Result<Option<V>> {
        self.update(|map| {
            let taken = map.remove(key);
            let changed = taken.is_some();
            (taken, changed)
        })
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Opens the store for `collection` on the configured backend.
///
/// With [`StorageBackend::Keyring`] only `secret` collections go to the OS
/// credential store; the rest are JSON files in the storage directory.
pub fn open<T>(config: &StorageConfig, collection: &str, secret: bool) -> Arc<dyn Store<T>>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + Debug + 'static,
{
    let file = || -> Arc<dyn Store<T>> {
        Arc::new(JsonFileStore::new(
            config.directory.join(format!("{}.json", collection)),
        ))
    };
    match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::<T>::default()),
        StorageBackend::File => file(),
        StorageBackend::Keyring if secret => Arc::new(KeyringStore::new(collection)),
        StorageBackend::Keyring => file(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_defaults_to_empty() {
        let store: MemoryStore<Vec<String>> = MemoryStore::default();
        assert!(store.get().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_replace_all_swaps_whole_value() {
        let store = MemoryStore::new(vec!["a".to_string(), "b".to_string()]);
        store.replace_all(vec!["c".to_string()]).unwrap();
        assert_eq!(store.get().unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_memory_store_snapshot_is_detached() {
        let store = MemoryStore::new(vec![1u32]);
        let mut snapshot = store.get().unwrap();
        snapshot.push(2);
        assert_eq!(store.get().unwrap(), vec![1]);
    }

    #[test]
    fn test_json_file_store_missing_file_reads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("recent.json"));
        let value: Vec<String> = store.get().unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_json_file_store_roundtrip_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("tokens.json"));
        let mut map = HashMap::new();
        map.insert("example.com".to_string(), "client-1".to_string());
        store.replace_all(map.clone()).unwrap();

        let loaded: HashMap<String, String> = store.get().unwrap();
        assert_eq!(loaded, map);
        assert!(!store.temp_path().exists(), "temp file must be renamed away");
    }

    #[test]
    fn test_json_file_store_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(path);
        let result: Result<Vec<String>> = store.get();
        assert!(result.is_err());
    }

    #[test]
    fn test_keyed_cache_put_get_take() {
        let cache: KeyedCache<String> = KeyedCache::in_memory();
        cache.put("a.example:443", "one".to_string()).unwrap();
        cache.put("b.example:443", "two".to_string()).unwrap();
        assert_eq!(cache.get("a.example:443").unwrap().as_deref(), Some("one"));

        assert_eq!(cache.take("a.example:443").unwrap().as_deref(), Some("one"));
        assert!(cache.get("a.example:443").unwrap().is_none());
        assert_eq!(cache.get("b.example:443").unwrap().as_deref(), Some("two"));
        assert!(cache.take("a.example:443").unwrap().is_none());
    }

    /// Memory store whose reads are slow enough for two callers to overlap.
    #[derive(Debug, Default)]
    struct SlowReadStore {
        inner: MemoryStore<HashMap<String, String>>,
    }

    impl Store<HashMap<String, String>> for SlowReadStore {
        fn get(&self) -> Result<HashMap<String, String>> {
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.inner.get()
        }

        fn replace_all(&self, value: HashMap<String, String>) -> Result<()> {
            self.inner.replace_all(value)
        }
    }

    #[test]
    fn test_keyed_cache_concurrent_take_hands_value_out_once() {
        let cache: KeyedCache<String> = KeyedCache::new(Arc::new(SlowReadStore::default()));
        cache.put("s1", "verifier".to_string()).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.take("s1").unwrap())
            })
            .collect();
        let taken: Vec<Option<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(taken.iter().filter(|t| t.is_some()).count(), 1);
        assert!(cache.get("s1").unwrap().is_none());
    }

    #[test]
    fn test_keyed_cache_concurrent_puts_keep_every_key() {
        let cache: KeyedCache<String> = KeyedCache::new(Arc::new(SlowReadStore::default()));
        let handles: Vec<_> = ["a.example:443", "b.example:443", "c.example:443"]
            .into_iter()
            .map(|key| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.put(key, key.to_string()).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for key in ["a.example:443", "b.example:443", "c.example:443"] {
            assert_eq!(cache.get(key).unwrap().as_deref(), Some(key));
        }
    }

    #[test]
    fn test_keyed_cache_update_without_change_skips_write() {
        let cache: KeyedCache<String> = KeyedCache::in_memory();
        cache.put("a", "one".to_string()).unwrap();
        let seen = cache.update(|map| (map.len(), false)).unwrap();
        assert_eq!(seen, 1);
        assert_eq!(cache.get("a").unwrap().as_deref(), Some("one"));
    }

    #[test]
    fn test_keyring_store_service_name_has_prefix() {
        let store = KeyringStore::new("tokens");
        assert_eq!(store.service(), "mcp-negotiator-tokens");
    }

    #[test]
    #[ignore = "requires an OS credential store"]
    fn test_keyring_store_roundtrip() {
        let store = KeyringStore::new("test-roundtrip");
        store.replace_all(vec!["x".to_string()]).unwrap();
        let loaded: Vec<String> = store.get().unwrap();
        assert_eq!(loaded, vec!["x".to_string()]);
        store.replace_all(Vec::<String>::new()).unwrap();
    }

    #[test]
    fn test_open_file_backend_writes_under_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::File,
            directory: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let store: Arc<dyn Store<Vec<String>>> = open(&config, "recent", false);
        store.replace_all(vec!["example.com".to_string()]).unwrap();
        assert!(dir.path().join("recent.json").exists());
    }

    #[test]
    fn test_open_keyring_backend_keeps_lists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Keyring,
            directory: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let store: Arc<dyn Store<Vec<String>>> = open(&config, "recent", false);
        store.replace_all(Vec::new()).unwrap();
        assert!(dir.path().join("recent.json").exists());
    }
}
