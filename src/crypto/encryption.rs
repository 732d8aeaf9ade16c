//! AES-256-GCM field encryption/decryption
//!
//! Every call generates a fresh 96-bit IV and a fresh 128-bit salt. The salt
//! selects a per-field subkey (HMAC-SHA256 over the version key), and the
//! key reference is bound as associated data, so a field cannot be replayed
//! under another key id or version. Ciphertext and tag are stored separately.
//! Decryption fails closed: no plaintext is returned unless the tag verifies.

use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{FinguardError, FinguardResult};
use crate::keys::{KeyMaterial, KeyResolver, AES_256_GCM};

use super::key_derivation::{DerivedKey, KEY_SIZE, SALT_SIZE};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

const FIELD_KEY_LABEL: &[u8] = b"finguard-field-v1";

type HmacSha256 = Hmac<Sha256>;

/// One encrypted value with everything needed to decrypt it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedField {
    /// Ciphertext without the tag (base64)
    pub ciphertext: String,
    /// Initialization vector (base64)
    pub iv: String,
    /// Authentication tag (base64)
    pub tag: String,
    /// Per-field subkey salt (base64)
    pub salt: String,
    /// Key id the field was encrypted under
    pub key_id: String,
    /// Key version the field was encrypted under
    pub key_version: u32,
    /// Algorithm identifier
    pub algorithm: String,
    /// When the field was encrypted
    pub encrypted_at: DateTime<Utc>,
}

impl EncryptedField {
    /// Parse a JSON value as an encrypted field, if it conforms exactly
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Serialize to a JSON value
    pub fn to_value(&self) -> FinguardResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn decode(&self, field: &'static str, encoded: &str) -> FinguardResult<Vec<u8>> {
        STANDARD.decode(encoded).map_err(|e| {
            FinguardError::InvalidInput(format!("Invalid {} encoding: {}", field, e))
        })
    }
}

/// Encrypt a string value under versioned key material
pub fn encrypt(plaintext: &str, key: &KeyMaterial) -> FinguardResult<EncryptedField> {
    encrypt_bytes(plaintext.as_bytes(), key.key(), key.key_id(), key.version())
}

/// Encrypt raw bytes under a key identified by `key_id`/`version`
pub fn encrypt_bytes(
    plaintext: &[u8],
    key: &DerivedKey,
    key_id: &str,
    version: u32,
) -> FinguardResult<EncryptedField> {
    if plaintext.is_empty() {
        return Err(FinguardError::InvalidInput(
            "Cannot encrypt an empty value".to_string(),
        ));
    }

    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let cipher = field_cipher(key, &salt)?;
    let aad = associated_data(AES_256_GCM, key_id, version);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad.as_bytes(), &mut buffer)
        .map_err(|e| FinguardError::Encryption(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedField {
        ciphertext: STANDARD.encode(&buffer),
        iv: STANDARD.encode(iv),
        tag: STANDARD.encode(tag),
        salt: STANDARD.encode(salt),
        key_id: key_id.to_string(),
        key_version: version,
        algorithm: AES_256_GCM.to_string(),
        encrypted_at: Utc::now(),
    })
}

/// Decrypt a field, resolving its key through `resolver`
pub fn decrypt(field: &EncryptedField, resolver: &dyn KeyResolver) -> FinguardResult<String> {
    check_algorithm(field)?;
    let key = resolver.resolve(&field.key_id, field.key_version)?;
    decrypt_with_key(field, &key)
}

/// Decrypt a field with already-resolved key material
pub fn decrypt_with_key(field: &EncryptedField, key: &KeyMaterial) -> FinguardResult<String> {
    if field.key_id != key.key_id() || field.key_version != key.version() {
        return Err(FinguardError::unknown_version(
            field.key_id.clone(),
            field.key_version,
        ));
    }
    let plaintext = decrypt_bytes(field, key.key())?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|e| FinguardError::Encryption(format!("Invalid UTF-8 in decrypted data: {}", e)))
}

/// Decrypt raw bytes with a bare key
pub fn decrypt_bytes(field: &EncryptedField, key: &DerivedKey) -> FinguardResult<Zeroizing<Vec<u8>>> {
    check_algorithm(field)?;

    let iv = field.decode("iv", &field.iv)?;
    let tag = field.decode("tag", &field.tag)?;
    let salt = field.decode("salt", &field.salt)?;
    let ciphertext = field.decode("ciphertext", &field.ciphertext)?;

    if iv.len() != IV_SIZE || tag.len() != TAG_SIZE || salt.len() != SALT_SIZE {
        return Err(FinguardError::Authentication(
            "Encrypted field has malformed IV, tag or salt".to_string(),
        ));
    }

    let cipher = field_cipher(key, &salt)?;
    let aad = associated_data(&field.algorithm, &field.key_id, field.key_version);

    let mut buffer = Zeroizing::new(ciphertext);
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            aad.as_bytes(),
            &mut buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|_| {
            FinguardError::Authentication(format!(
                "Tag verification failed for {} v{}",
                field.key_id, field.key_version
            ))
        })?;

    Ok(buffer)
}

fn check_algorithm(field: &EncryptedField) -> FinguardResult<()> {
    if field.algorithm != AES_256_GCM {
        return Err(FinguardError::InvalidInput(format!(
            "Unsupported algorithm: {}",
            field.algorithm
        )));
    }
    Ok(())
}

fn associated_data(algorithm: &str, key_id: &str, version: u32) -> String {
    format!("{}|{}|{}", algorithm, key_id, version)
}

/// Derive the per-field AES key from the version key and field salt
fn field_cipher(key: &DerivedKey, salt: &[u8]) -> FinguardResult<Aes256Gcm> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| FinguardError::Encryption(format!("Failed to derive field key: {}", e)))?;
    mac.update(FIELD_KEY_LABEL);
    mac.update(salt);
    let mut output = mac.finalize().into_bytes();

    let mut field_key = Zeroizing::new([0u8; KEY_SIZE]);
    field_key.copy_from_slice(&output[..KEY_SIZE]);
    output.as_mut_slice().zeroize();

    Aes256Gcm::new_from_slice(field_key.as_slice())
        .map_err(|e| FinguardError::Encryption(format!("Failed to create cipher: {}", e)))
}
