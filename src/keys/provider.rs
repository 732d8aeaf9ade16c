//! Key-material backing store abstraction
//!
//! The lifecycle manager and the material store only talk to a
//! [`KeyProvider`]. Two implementations ship with the crate:
//!
//! - [`LocalKeyProvider`]: development provider that derives every version
//!   from the master secret with Argon2id. Only metadata (including the
//!   per-version salt) is persisted; key bytes are re-derived on load.
//! - [`TimeoutProvider`]: wraps any provider and turns slow round trips into
//!   [`FinguardError::KeyStoreUnavailable`].
//!
//! A managed key service plugs in by implementing the same trait.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{derive_key, generate_salt, DerivedKey, KeyDerivationParams, SecureString};
use crate::error::{FinguardError, FinguardResult};
use crate::storage::{read_json, write_json_atomic};

use super::material::{KeyMaterial, KeyMetadata, KeyStatus};

/// Pluggable key-material backing store
pub trait KeyProvider: Send + Sync {
    /// Load a version with its raw key bytes
    fn load_key(&self, key_id: &str, version: u32) -> FinguardResult<KeyMaterial>;

    /// Persist a version (metadata and key bytes)
    fn store_key(&self, material: &KeyMaterial) -> FinguardResult<()>;

    /// Replace the metadata of an existing version
    fn update_metadata(&self, metadata: &KeyMetadata) -> FinguardResult<()>;

    /// Metadata of every known version, destroyed ones included
    fn list_keys(&self) -> FinguardResult<Vec<KeyMetadata>>;

    /// Overwrite and drop the key bytes of a version
    fn destroy_key(&self, key_id: &str, version: u32) -> FinguardResult<()>;

    /// Create fresh key material for a new version; not persisted
    fn generate_key(
        &self,
        key_id: &str,
        version: u32,
        purpose: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> FinguardResult<KeyMaterial>;
}

/// On-disk layout of the local provider
#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalKeyFile {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    keys: Vec<KeyMetadata>,
}

fn default_schema_version() -> u32 {
    1
}

type VersionRef = (String, u32);

#[derive(Default)]
struct LocalState {
    records: BTreeMap<VersionRef, KeyMetadata>,
    keys: HashMap<VersionRef, DerivedKey>,
}

/// Development provider deriving keys from the master secret
///
/// NOT for production: anyone holding the master secret and the metadata
/// file can re-derive every key.
pub struct LocalKeyProvider {
    master_secret: SecureString,
    master_salt: SecureString,
    params: KeyDerivationParams,
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalKeyProvider {
    /// Create an in-memory provider
    pub fn new(
        master_secret: SecureString,
        master_salt: SecureString,
        params: KeyDerivationParams,
    ) -> Self {
        Self {
            master_secret,
            master_salt,
            params,
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Create a provider persisting metadata to `path`, loading what is there
    pub fn with_file(
        master_secret: SecureString,
        master_salt: SecureString,
        params: KeyDerivationParams,
        path: PathBuf,
    ) -> FinguardResult<Self> {
        let file: LocalKeyFile = read_json(&path)?;
        let records = file
            .keys
            .into_iter()
            .map(|meta| ((meta.key_id.clone(), meta.version), meta))
            .collect();

        Ok(Self {
            master_secret,
            master_salt,
            params,
            path: Some(path),
            state: Mutex::new(LocalState {
                records,
                keys: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn derivation_salt(&self, key_id: &str, version_salt: &[u8]) -> Vec<u8> {
        let mut salt = Vec::with_capacity(self.master_salt.len() + key_id.len() + version_salt.len() + 2);
        salt.extend_from_slice(self.master_salt.as_bytes());
        salt.push(b':');
        salt.extend_from_slice(key_id.as_bytes());
        salt.push(b':');
        salt.extend_from_slice(version_salt);
        salt
    }

    fn derive(&self, key_id: &str, version_salt: &[u8]) -> FinguardResult<DerivedKey> {
        let mut salt = self.derivation_salt(key_id, version_salt);
        let key = derive_key(self.master_secret.as_bytes(), &salt, &self.params);
        salt.zeroize();
        key
    }

    fn persist(&self, state: &LocalState) -> FinguardResult<()> {
        if let Some(path) = &self.path {
            let file = LocalKeyFile {
                schema_version: default_schema_version(),
                keys: state.records.values().cloned().collect(),
            };
            write_json_atomic(path, &file)?;
        }
        Ok(())
    }
}

impl KeyProvider for LocalKeyProvider {
    fn load_key(&self, key_id: &str, version: u32) -> FinguardResult<KeyMaterial> {
        let mut state = self.lock();
        let id = (key_id.to_string(), version);

        let metadata = match state.records.get(&id) {
            Some(meta) if meta.status != KeyStatus::Destroyed => meta.clone(),
            Some(_) => return Err(FinguardError::unknown_version(key_id, version)),
            None if state.records.keys().any(|(k, _)| k == key_id) => {
                return Err(FinguardError::unknown_version(key_id, version))
            }
            None => return Err(FinguardError::UnknownKey(key_id.to_string())),
        };

        if let Some(key) = state.keys.get(&id) {
            return Ok(KeyMaterial::new(metadata, key.clone()));
        }

        let encoded_salt = metadata.salt.as_deref().ok_or_else(|| {
            FinguardError::unknown_version(key_id, version)
        })?;
        let version_salt = STANDARD.decode(encoded_salt).map_err(|e| {
            FinguardError::Storage(format!("Corrupt salt for {}: {}", metadata.label(), e))
        })?;

        let key = self.derive(key_id, &version_salt)?;
        state.keys.insert(id, key.clone());
        Ok(KeyMaterial::new(metadata, key))
    }

    fn store_key(&self, material: &KeyMaterial) -> FinguardResult<()> {
        let mut state = self.lock();
        let id = (material.key_id().to_string(), material.version());

        let mut previous_key = state.keys.insert(id.clone(), material.key().clone());
        let previous_record = state.records.insert(id.clone(), material.metadata().clone());

        if let Err(e) = self.persist(&state) {
            // Undo so memory matches disk
            match previous_record {
                Some(record) => {
                    state.records.insert(id.clone(), record);
                }
                None => {
                    state.records.remove(&id);
                }
            }
            match previous_key.take() {
                Some(key) => {
                    state.keys.insert(id, key);
                }
                None => {
                    state.keys.remove(&id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn update_metadata(&self, metadata: &KeyMetadata) -> FinguardResult<()> {
        let mut state = self.lock();
        let id = (metadata.key_id.clone(), metadata.version);

        let previous = match state.records.get_mut(&id) {
            Some(record) => std::mem::replace(record, metadata.clone()),
            None => {
                return Err(FinguardError::unknown_version(
                    metadata.key_id.clone(),
                    metadata.version,
                ))
            }
        };

        if let Err(e) = self.persist(&state) {
            state.records.insert(id, previous);
            return Err(e);
        }
        Ok(())
    }

    fn list_keys(&self) -> FinguardResult<Vec<KeyMetadata>> {
        Ok(self.lock().records.values().cloned().collect())
    }

    fn destroy_key(&self, key_id: &str, version: u32) -> FinguardResult<()> {
        let mut state = self.lock();
        let id = (key_id.to_string(), version);

        if let Some(mut key) = state.keys.remove(&id) {
            key.zeroize();
        }

        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| FinguardError::unknown_version(key_id, version))?;

        // Without the salt the version can never be re-derived
        if let Some(salt) = record.salt.as_mut() {
            salt.zeroize();
        }
        record.salt = None;
        record.status = KeyStatus::Destroyed;
        record.status_changed_at = Some(Utc::now());

        self.persist(&state)
    }

    fn generate_key(
        &self,
        key_id: &str,
        version: u32,
        purpose: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> FinguardResult<KeyMaterial> {
        if key_id.trim().is_empty() {
            return Err(FinguardError::InvalidInput("Key id cannot be empty".into()));
        }

        let version_salt = generate_salt();
        let key = self.derive(key_id, &version_salt)?;

        let mut metadata = KeyMetadata::new(key_id, version, purpose, created_at, expires_at);
        metadata.salt = Some(STANDARD.encode(version_salt));
        metadata.fingerprint = Some(key.fingerprint());

        Ok(KeyMaterial::new(metadata, key))
    }
}

/// Bounds every provider round trip by a timeout
///
/// A call that exceeds the timeout reports `KeyStoreUnavailable`; the
/// worker thread is left to finish on its own, so a timed-out write may
/// still land in the backing store.
pub struct TimeoutProvider<P> {
    inner: Arc<P>,
    timeout: Duration,
}

impl<P: KeyProvider + 'static> TimeoutProvider<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    fn call<T, F>(&self, operation: &'static str, f: F) -> FinguardResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> FinguardResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let _ = tx.send(f(&inner));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(FinguardError::KeyStoreUnavailable(format!(
                "{} timed out after {} ms",
                operation,
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(FinguardError::KeyStoreUnavailable(
                format!("{} worker exited without a result", operation),
            )),
        }
    }
}

impl<P: KeyProvider + 'static> KeyProvider for TimeoutProvider<P> {
    fn load_key(&self, key_id: &str, version: u32) -> FinguardResult<KeyMaterial> {
        let key_id = key_id.to_string();
        self.call("load_key", move |p| p.load_key(&key_id, version))
    }

    fn store_key(&self, material: &KeyMaterial) -> FinguardResult<()> {
        let material = material.clone();
        self.call("store_key", move |p| p.store_key(&material))
    }

    fn update_metadata(&self, metadata: &KeyMetadata) -> FinguardResult<()> {
        let metadata = metadata.clone();
        self.call("update_metadata", move |p| p.update_metadata(&metadata))
    }

    fn list_keys(&self) -> FinguardResult<Vec<KeyMetadata>> {
        self.call("list_keys", |p| p.list_keys())
    }

    fn destroy_key(&self, key_id: &str, version: u32) -> FinguardResult<()> {
        let key_id = key_id.to_string();
        self.call("destroy_key", move |p| p.destroy_key(&key_id, version))
    }

    fn generate_key(
        &self,
        key_id: &str,
        version: u32,
        purpose: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> FinguardResult<KeyMaterial> {
        let key_id = key_id.to_string();
        let purpose = purpose.to_string();
        self.call("generate_key", move |p| {
            p.generate_key(&key_id, version, &purpose, created_at, expires_at)
        })
    }
}

#[cfg(test)]
pub(crate) fn test_provider() -> LocalKeyProvider {
    LocalKeyProvider::new(
        SecureString::new("test-master-secret-0123456789"),
        SecureString::new("test-salt-0001"),
        crate::crypto::key_derivation::test_params(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_derivation::test_params;
    use tempfile::TempDir;

    fn stored(provider: &LocalKeyProvider, key_id: &str, version: u32) -> KeyMaterial {
        let material = provider
            .generate_key(key_id, version, "records", Utc::now(), None)
            .unwrap();
        provider.store_key(&material).unwrap();
        material
    }

    #[test]
    fn test_generate_and_load() {
        let provider = test_provider();
        let material = stored(&provider, "default", 1);

        let loaded = provider.load_key("default", 1).unwrap();
        assert_eq!(loaded.key().as_bytes(), material.key().as_bytes());
        assert_eq!(loaded.status(), KeyStatus::Pending);
        assert!(loaded.metadata().fingerprint.is_some());
    }

    #[test]
    fn test_versions_have_distinct_keys() {
        let provider = test_provider();
        let v1 = stored(&provider, "default", 1);
        let v2 = stored(&provider, "default", 2);
        assert_ne!(v1.key().as_bytes(), v2.key().as_bytes());
    }

    #[test]
    fn test_unknown_key_and_version() {
        let provider = test_provider();
        assert!(matches!(
            provider.load_key("missing", 1),
            Err(FinguardError::UnknownKey(_))
        ));

        stored(&provider, "default", 1);
        assert!(provider.load_key("default", 9).unwrap_err().is_permanent());
    }

    #[test]
    fn test_destroy_makes_version_unrecoverable() {
        let provider = test_provider();
        stored(&provider, "default", 1);

        provider.destroy_key("default", 1).unwrap();

        assert!(provider.load_key("default", 1).unwrap_err().is_permanent());
        let meta = provider.list_keys().unwrap().pop().unwrap();
        assert_eq!(meta.status, KeyStatus::Destroyed);
        assert!(meta.salt.is_none());
    }

    #[test]
    fn test_update_metadata() {
        let provider = test_provider();
        let material = stored(&provider, "default", 1);

        let mut meta = material.metadata().clone();
        meta.transition(KeyStatus::Active, Utc::now()).unwrap();
        provider.update_metadata(&meta).unwrap();

        assert_eq!(provider.load_key("default", 1).unwrap().status(), KeyStatus::Active);
    }

    #[test]
    fn test_update_unknown_metadata_fails() {
        let provider = test_provider();
        let meta = KeyMetadata::new("default", 1, "records", Utc::now(), None);
        assert!(provider.update_metadata(&meta).is_err());
    }

    #[test]
    fn test_file_reload_rederives_same_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys.json");

        let original = {
            let provider = LocalKeyProvider::with_file(
                SecureString::new("test-master-secret-0123456789"),
                SecureString::new("test-salt-0001"),
                test_params(),
                path.clone(),
            )
            .unwrap();
            stored(&provider, "default", 1)
        };

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(&hex::encode(original.key().as_bytes())));

        let reloaded = LocalKeyProvider::with_file(
            SecureString::new("test-master-secret-0123456789"),
            SecureString::new("test-salt-0001"),
            test_params(),
            path,
        )
        .unwrap();
        let loaded = reloaded.load_key("default", 1).unwrap();
        assert_eq!(loaded.key().as_bytes(), original.key().as_bytes());
    }

    #[test]
    fn test_failed_persist_leaves_state_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();

        let provider = LocalKeyProvider::with_file(
            SecureString::new("test-master-secret-0123456789"),
            SecureString::new("test-salt-0001"),
            test_params(),
            blocker.join("keys.json"),
        )
        .unwrap();

        let material = provider
            .generate_key("default", 1, "records", Utc::now(), None)
            .unwrap();
        assert!(provider.store_key(&material).is_err());
        assert!(provider.list_keys().unwrap().is_empty());
    }

    struct SlowProvider {
        inner: LocalKeyProvider,
        delay: Duration,
    }

    impl KeyProvider for SlowProvider {
        fn load_key(&self, key_id: &str, version: u32) -> FinguardResult<KeyMaterial> {
            thread::sleep(self.delay);
            self.inner.load_key(key_id, version)
        }
        fn store_key(&self, material: &KeyMaterial) -> FinguardResult<()> {
            self.inner.store_key(material)
        }
        fn update_metadata(&self, metadata: &KeyMetadata) -> FinguardResult<()> {
            self.inner.update_metadata(metadata)
        }
        fn list_keys(&self) -> FinguardResult<Vec<KeyMetadata>> {
            self.inner.list_keys()
        }
        fn destroy_key(&self, key_id: &str, version: u32) -> FinguardResult<()> {
            self.inner.destroy_key(key_id, version)
        }
        fn generate_key(
            &self,
            key_id: &str,
            version: u32,
            purpose: &str,
            created_at: DateTime<Utc>,
            expires_at: Option<DateTime<Utc>>,
        ) -> FinguardResult<KeyMaterial> {
            self.inner
                .generate_key(key_id, version, purpose, created_at, expires_at)
        }
    }

    #[test]
    fn test_timeout_maps_to_unavailable() {
        let slow = SlowProvider {
            inner: test_provider(),
            delay: Duration::from_millis(500),
        };
        stored(&slow.inner, "default", 1);

        let provider = TimeoutProvider::new(slow, Duration::from_millis(20));
        let err = provider.load_key("default", 1).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_provider_passes_through() {
        let inner = test_provider();
        stored(&inner, "default", 1);

        let provider = TimeoutProvider::new(inner, Duration::from_secs(5));
        assert_eq!(provider.load_key("default", 1).unwrap().version(), 1);
        assert!(matches!(
            provider.load_key("missing", 1),
            Err(FinguardError::UnknownKey(_))
        ));
    }
}
