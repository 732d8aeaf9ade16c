//! Versioned key material and its lifecycle states
//!
//! ```text
//! Pending → Active → Rotating → Deprecated → Destroyed
//!                 (any state) → Revoked
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::DerivedKey;
use crate::error::{FinguardError, FinguardResult};

/// Algorithm identifier recorded on keys and encrypted fields
pub const AES_256_GCM: &str = "AES-256-GCM";

/// Key status in lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Generated during rotation, not yet promoted
    Pending,
    /// The single version used for new encryption
    Active,
    /// Due for rotation; still encrypts until the successor is committed
    Rotating,
    /// Decrypt-only, kept for legacy ciphertext until its backup expires
    Deprecated,
    /// Failed an integrity check; unusable
    Revoked,
    /// Key bytes have been overwritten and dropped
    Destroyed,
}

impl KeyStatus {
    /// Check if the key may be used for new encryption
    pub fn can_encrypt(&self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Rotating)
    }

    /// Check if the key may be used for decryption
    pub fn can_decrypt(&self) -> bool {
        matches!(
            self,
            KeyStatus::Active | KeyStatus::Rotating | KeyStatus::Deprecated
        )
    }

    /// Whether `self → next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        use KeyStatus::*;
        match (*self, next) {
            (Destroyed, _) => false,
            (_, Revoked) => *self != Revoked,
            (Pending, Active) | (Pending, Destroyed) => true,
            (Active, Rotating) | (Active, Deprecated) => true,
            (Rotating, Active) | (Rotating, Deprecated) => true,
            (Deprecated, Destroyed) | (Revoked, Destroyed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Destroyed => "destroyed",
        };
        write!(f, "{}", label)
    }
}

/// Key metadata; safe to persist and log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Key id, e.g. "default"
    pub key_id: String,
    /// Version number, starting at 1
    pub version: u32,
    /// Algorithm identifier
    pub algorithm: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the version is due for rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: KeyStatus,
    /// Purpose tag
    pub purpose: String,
    /// Provider-specific derivation salt (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// Fingerprint of the key bytes, used by the integrity self-test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime<Utc>>,
    /// Why the key was revoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl KeyMetadata {
    /// Create metadata for a new, pending version
    pub fn new(
        key_id: impl Into<String>,
        version: u32,
        purpose: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            version,
            algorithm: AES_256_GCM.to_string(),
            created_at,
            expires_at,
            status: KeyStatus::Pending,
            purpose: purpose.into(),
            salt: None,
            fingerprint: None,
            status_changed_at: None,
            revocation_reason: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: KeyStatus, at: DateTime<Utc>) -> FinguardResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(FinguardError::InvalidInput(format!(
                "Key {} v{} cannot move from {} to {}",
                self.key_id, self.version, self.status, next
            )));
        }
        self.status = next;
        self.status_changed_at = Some(at);
        Ok(())
    }

    /// Whether the version is past its rotation date
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }

    /// "key_id v3" label for messages
    pub fn label(&self) -> String {
        format!("{} v{}", self.key_id, self.version)
    }
}

/// Key metadata together with the raw key bytes
///
/// Never serialized; Debug output omits the key bytes.
#[derive(Clone)]
pub struct KeyMaterial {
    metadata: KeyMetadata,
    key: DerivedKey,
}

impl KeyMaterial {
    /// Pair metadata with key bytes
    pub fn new(metadata: KeyMetadata, key: DerivedKey) -> Self {
        Self { metadata, key }
    }

    pub fn metadata(&self) -> &KeyMetadata {
        &self.metadata
    }

    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    pub fn key_id(&self) -> &str {
        &self.metadata.key_id
    }

    pub fn version(&self) -> u32 {
        self.metadata.version
    }

    pub fn status(&self) -> KeyStatus {
        self.metadata.status
    }

    /// Replace the metadata, keeping the key bytes
    pub fn with_metadata(mut self, metadata: KeyMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("metadata", &self.metadata)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Resolves `(key id, version)` to key material for decryption
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, key_id: &str, version: u32) -> FinguardResult<Arc<KeyMaterial>>;
}
