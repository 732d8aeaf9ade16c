//! Key derivation using Argon2id
//!
//! Derives 256-bit keys from a master secret and a salt using Argon2id,
//! a memory-hard key derivation function resistant to GPU/ASIC attacks.

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FinguardError, FinguardResult};

/// Size of derived keys in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Minimum accepted salt length in bytes
pub const MIN_SALT_LEN: usize = 8;

/// Size of randomly generated salts in bytes
pub const SALT_SIZE: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivationParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    /// Time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Parallelism degree (default: 4)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// Create params with specific values
    pub fn with_values(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    fn to_argon2(&self) -> FinguardResult<Argon2<'static>> {
        let params = Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| FinguardError::Config(format!("Invalid Argon2 parameters: {}", e)))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// A 256-bit symmetric key, zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Wrap existing key bytes
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Build a key from a slice, rejecting anything that is not 32 bytes
    pub fn from_slice(bytes: &[u8]) -> FinguardResult<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            FinguardError::InvalidInput(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Short, non-reversible fingerprint used to detect derivation drift
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"finguard-key-fingerprint");
        hasher.update(self.key);
        hex::encode(&hasher.finalize()[..8])
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKey([REDACTED {} bytes])", KEY_SIZE)
    }
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit key from a secret and salt
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    params: &KeyDerivationParams,
) -> FinguardResult<DerivedKey> {
    if secret.is_empty() {
        return Err(FinguardError::InvalidInput(
            "Key derivation secret cannot be empty".to_string(),
        ));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(FinguardError::InvalidInput(format!(
            "Salt must be at least {} bytes",
            MIN_SALT_LEN
        )));
    }

    let argon2 = params.to_argon2()?;

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| FinguardError::Encryption(format!("Key derivation failed: {}", e)))?;

    let derived = DerivedKey { key };
    key.zeroize();
    Ok(derived)
}

#[cfg(test)]
pub(crate) fn test_params() -> KeyDerivationParams {
    KeyDerivationParams::with_values(1024, 1, 1)
}
