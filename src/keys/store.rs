//! Key material store with a bounded-TTL cache
//!
//! The provider is the source of truth. Cached entries (both material and
//! the per-key-id active pointer) are served for at most `ttl`, so in a
//! multi-process deployment a just-rotated key may be seen with its old
//! status for up to one TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::error::{FinguardError, FinguardResult};

use super::material::{KeyMaterial, KeyMetadata, KeyResolver, KeyStatus};
use super::provider::KeyProvider;

struct CachedKey {
    material: Arc<KeyMaterial>,
    fetched_at: DateTime<Utc>,
}

struct CachedActive {
    version: u32,
    fetched_at: DateTime<Utc>,
}

/// Resolves versioned key material through a provider, with caching
pub struct KeyMaterialStore {
    provider: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, u32), CachedKey>>,
    active: Mutex<HashMap<String, CachedActive>>,
}

impl KeyMaterialStore {
    pub fn new(provider: Arc<dyn KeyProvider>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            provider,
            clock,
            ttl,
            cache: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The backing provider
    pub fn provider(&self) -> &Arc<dyn KeyProvider> {
        &self.provider
    }

    /// The clock used for cache freshness
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(String, u32), CachedKey>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CachedActive>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - fetched_at < self.ttl
    }

    /// Get key material for `(key_id, version)`, whatever its status
    ///
    /// Destroyed versions are reported as `UnknownKeyVersion`.
    pub fn get_material(&self, key_id: &str, version: u32) -> FinguardResult<Arc<KeyMaterial>> {
        let now = self.clock.now();
        let id = (key_id.to_string(), version);

        if let Some(entry) = self.cache().get(&id) {
            if self.is_fresh(entry.fetched_at, now) {
                return Ok(Arc::clone(&entry.material));
            }
        }

        let material = self.provider.load_key(key_id, version)?;
        if material.status() == KeyStatus::Destroyed {
            return Err(FinguardError::unknown_version(key_id, version));
        }

        let material = Arc::new(material);
        self.cache().insert(
            id,
            CachedKey {
                material: Arc::clone(&material),
                fetched_at: now,
            },
        );
        Ok(material)
    }

    /// The version currently used for new encryption under `key_id`
    pub fn active_material(&self, key_id: &str) -> FinguardResult<Arc<KeyMaterial>> {
        let now = self.clock.now();

        let cached = self
            .active()
            .get(key_id)
            .filter(|entry| self.is_fresh(entry.fetched_at, now))
            .map(|entry| entry.version);

        let version = match cached {
            Some(version) => version,
            None => {
                let version = self.lookup_active_version(key_id)?;
                self.active().insert(
                    key_id.to_string(),
                    CachedActive {
                        version,
                        fetched_at: now,
                    },
                );
                version
            }
        };

        let material = self.get_material(key_id, version)?;
        if !material.status().can_encrypt() {
            self.active().remove(key_id);
            return Err(FinguardError::UnknownKey(format!(
                "{} has no usable active version ({} is {})",
                key_id,
                material.metadata().label(),
                material.status()
            )));
        }
        Ok(material)
    }

    fn lookup_active_version(&self, key_id: &str) -> FinguardResult<u32> {
        let versions = self.versions(key_id)?;
        if versions.is_empty() {
            return Err(FinguardError::UnknownKey(key_id.to_string()));
        }

        versions
            .iter()
            .filter(|meta| meta.status.can_encrypt())
            .map(|meta| meta.version)
            .max()
            .ok_or_else(|| {
                FinguardError::UnknownKey(format!("{} has no active version", key_id))
            })
    }

    /// Metadata of every version of `key_id`, oldest first
    pub fn versions(&self, key_id: &str) -> FinguardResult<Vec<KeyMetadata>> {
        let mut versions: Vec<KeyMetadata> = self
            .provider
            .list_keys()?
            .into_iter()
            .filter(|meta| meta.key_id == key_id)
            .collect();
        versions.sort_by_key(|meta| meta.version);
        Ok(versions)
    }

    /// Point new encryption for `key_id` at `version`
    pub fn set_active(&self, key_id: &str, version: u32) {
        self.active().insert(
            key_id.to_string(),
            CachedActive {
                version,
                fetched_at: self.clock.now(),
            },
        );
    }

    /// Drop one cached version
    pub fn invalidate(&self, key_id: &str, version: u32) {
        self.cache().remove(&(key_id.to_string(), version));
    }

    /// Drop every cached version and the active pointer of `key_id`
    pub fn invalidate_key(&self, key_id: &str) {
        self.cache().retain(|(id, _), _| id != key_id);
        self.active().remove(key_id);
    }

    /// Remove stale cache entries; returns how many were dropped
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|_, entry| now - entry.fetched_at < self.ttl);
        let evicted = before - cache.len();
        drop(cache);

        self.active()
            .retain(|_, entry| now - entry.fetched_at < self.ttl);
        evicted
    }

    /// Number of cached versions
    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }
}

impl KeyResolver for KeyMaterialStore {
    fn resolve(&self, key_id: &str, version: u32) -> FinguardResult<Arc<KeyMaterial>> {
        let material = self.get_material(key_id, version)?;
        if !material.status().can_decrypt() {
            return Err(FinguardError::unknown_version(key_id, version));
        }
        Ok(material)
    }
}
