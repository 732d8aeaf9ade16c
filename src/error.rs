//! Custom error types for finguard
//!
//! This module defines the error hierarchy for the subsystem using thiserror.
//! Cryptographic and session failures are always surfaced as typed variants;
//! callers decide whether to degrade (skip personalization) or abort.

use thiserror::Error;

/// The main error type for finguard operations
#[derive(Error, Debug)]
pub enum FinguardError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad caller input, e.g. empty plaintext or a malformed encrypted field
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Authentication tag did not verify (tampering or corruption)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The referenced key version cannot be resolved
    #[error("Unknown key version: {key_id} v{version}")]
    UnknownKeyVersion { key_id: String, version: u32 },

    /// The key id has no versions at all
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Redaction session is missing or past its idle expiry
    #[error("Redaction session expired or unknown: {0}")]
    SessionExpired(String),

    /// The key-material backing store could not be reached in time
    #[error("Key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    /// A rotation step failed and was rolled back
    #[error("Rotation of key '{key_id}' failed: {reason}")]
    RotationFailed { key_id: String, reason: String },

    /// Generic cryptographic failures (cipher construction, KDF parameters)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(String),
}

impl FinguardError {
    /// Create an "unknown key version" error
    pub fn unknown_version(key_id: impl Into<String>, version: u32) -> Self {
        Self::UnknownKeyVersion {
            key_id: key_id.into(),
            version,
        }
    }

    /// Create a "rotation failed" error
    pub fn rotation_failed(key_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RotationFailed {
            key_id: key_id.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyStoreUnavailable(_))
    }

    /// Tag verification failures; never retry with the same ciphertext
    pub fn is_tampering(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// The data protected by the referenced key is unrecoverable
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnknownKeyVersion { .. })
    }

    /// Check if this is a session error
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

impl From<std::io::Error> for FinguardError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FinguardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for finguard operations
pub type FinguardResult<T> = Result<T, FinguardError>;
