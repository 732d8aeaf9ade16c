//! Encrypted backups of outgoing key versions
//!
//! Before a version is demoted its raw bytes are encrypted under a separate
//! backup key (derived once from the backup secret) and kept with a
//! checksum until the retention period ends. Backups exist for disaster
//! recovery only and are never used for new encryption.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{decrypt_bytes, derive_key, encrypt_bytes, DerivedKey, EncryptedField};
use crate::crypto::{KeyDerivationParams, SecureString};
use crate::error::{FinguardError, FinguardResult};
use crate::storage::{read_json, write_json_atomic};

use super::material::KeyMaterial;

/// Default backup retention (about seven years)
pub const DEFAULT_RETENTION_DAYS: i64 = 2555;

const BACKUP_SALT_LABEL: &[u8] = b":finguard-backup";

/// One backed-up key version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackup {
    pub key_id: String,
    pub version: u32,
    /// Key bytes encrypted under the backup key
    pub payload: EncryptedField,
    /// Hex SHA-256 over key id, version and raw key bytes
    pub checksum: String,
    pub backup_date: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl KeyBackup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupFile {
    #[serde(default)]
    backups: Vec<KeyBackup>,
}

fn checksum(key_id: &str, version: u32, key: &DerivedKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(version.to_be_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn payload_label(key_id: &str) -> String {
    format!("backup:{}", key_id)
}

/// Holds key backups, optionally persisted to a JSON file
pub struct KeyBackupVault {
    backup_key: DerivedKey,
    retention: Duration,
    path: Option<PathBuf>,
    backups: Mutex<BTreeMap<(String, u32), KeyBackup>>,
}

impl KeyBackupVault {
    /// Create an in-memory vault, deriving the backup key from `backup_secret`
    pub fn new(
        backup_secret: &SecureString,
        master_salt: &SecureString,
        params: &KeyDerivationParams,
        retention_days: i64,
    ) -> FinguardResult<Self> {
        let mut salt = master_salt.as_bytes().to_vec();
        salt.extend_from_slice(BACKUP_SALT_LABEL);
        let backup_key = derive_key(backup_secret.as_bytes(), &salt, params)?;

        Ok(Self {
            backup_key,
            retention: Duration::days(retention_days),
            path: None,
            backups: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create a vault persisted to `path`, loading existing backups
    pub fn with_file(
        backup_secret: &SecureString,
        master_salt: &SecureString,
        params: &KeyDerivationParams,
        retention_days: i64,
        path: PathBuf,
    ) -> FinguardResult<Self> {
        let mut vault = Self::new(backup_secret, master_salt, params, retention_days)?;
        let file: BackupFile = read_json(&path)?;
        vault.backups = Mutex::new(
            file.backups
                .into_iter()
                .map(|b| ((b.key_id.clone(), b.version), b))
                .collect(),
        );
        vault.path = Some(path);
        Ok(vault)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, u32), KeyBackup>> {
        self.backups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, backups: &BTreeMap<(String, u32), KeyBackup>) -> FinguardResult<()> {
        if let Some(path) = &self.path {
            let file = BackupFile {
                backups: backups.values().cloned().collect(),
            };
            write_json_atomic(path, &file)?;
        }
        Ok(())
    }

    /// Back up a version; replaces an earlier backup of the same version
    pub fn backup(&self, material: &KeyMaterial, now: DateTime<Utc>) -> FinguardResult<KeyBackup> {
        let key_id = material.key_id();
        let version = material.version();

        let payload = encrypt_bytes(
            material.key().as_bytes(),
            &self.backup_key,
            &payload_label(key_id),
            version,
        )?;

        let backup = KeyBackup {
            key_id: key_id.to_string(),
            version,
            payload,
            checksum: checksum(key_id, version, material.key()),
            backup_date: now,
            expires_at: now + self.retention,
        };

        let mut backups = self.lock();
        let id = (key_id.to_string(), version);
        let previous = backups.insert(id.clone(), backup.clone());
        if let Err(e) = self.persist(&backups) {
            match previous {
                Some(prev) => backups.insert(id, prev),
                None => backups.remove(&id),
            };
            return Err(e);
        }
        Ok(backup)
    }

    pub fn get(&self, key_id: &str, version: u32) -> Option<KeyBackup> {
        self.lock().get(&(key_id.to_string(), version)).cloned()
    }

    /// Delete a backup; returns whether one existed
    pub fn remove(&self, key_id: &str, version: u32) -> FinguardResult<bool> {
        let mut backups = self.lock();
        let id = (key_id.to_string(), version);
        let removed = match backups.remove(&id) {
            Some(backup) => backup,
            None => return Ok(false),
        };
        if let Err(e) = self.persist(&backups) {
            backups.insert(id, removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Decrypt a backup and verify its checksum
    pub fn restore(&self, key_id: &str, version: u32) -> FinguardResult<DerivedKey> {
        let backup = self
            .get(key_id, version)
            .ok_or_else(|| FinguardError::unknown_version(key_id, version))?;

        if backup.payload.key_id != payload_label(key_id) || backup.payload.key_version != version {
            return Err(FinguardError::Authentication(format!(
                "Backup of {} v{} references another key",
                key_id, version
            )));
        }

        let bytes = decrypt_bytes(&backup.payload, &self.backup_key)?;
        let key = DerivedKey::from_slice(&bytes)?;

        if checksum(key_id, version, &key) != backup.checksum {
            return Err(FinguardError::Authentication(format!(
                "Backup checksum mismatch for {} v{}",
                key_id, version
            )));
        }
        Ok(key)
    }

    /// Backups past their retention date
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<KeyBackup> {
        self.lock()
            .values()
            .filter(|b| b.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
pub(crate) fn test_vault() -> KeyBackupVault {
    KeyBackupVault::new(
        &SecureString::new("test-backup-secret-0123456789"),
        &SecureString::new("test-salt-0001"),
        &crate::crypto::key_derivation::test_params(),
        DEFAULT_RETENTION_DAYS,
    )
    .unwrap()
}
