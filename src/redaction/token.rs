//! Placeholder tokens
//!
//! A token is `[<CATEGORY>_<hash>]` where the hash is HMAC-SHA256 keyed by
//! the session id over `category || 0x00 || value`. The same value in the
//! same session always produces the same token; a different session
//! produces an unrelated one.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{FinguardError, FinguardResult};
use crate::schema::Category;

type HmacSha256 = Hmac<Sha256>;

/// Default number of hex characters kept from the hash
pub const DEFAULT_TOKEN_HEX_LEN: usize = 10;

pub const MIN_TOKEN_HEX_LEN: usize = 8;
pub const MAX_TOKEN_HEX_LEN: usize = 32;

/// Length of an untruncated hash, used when a truncated one collides
pub const FULL_HASH_HEX_LEN: usize = 64;

/// Check a configured truncation length
pub fn validate_hex_len(hex_len: usize) -> FinguardResult<()> {
    if !(MIN_TOKEN_HEX_LEN..=MAX_TOKEN_HEX_LEN).contains(&hex_len) {
        return Err(FinguardError::Config(format!(
            "token length must be between {} and {} hex characters, got {}",
            MIN_TOKEN_HEX_LEN, MAX_TOKEN_HEX_LEN, hex_len
        )));
    }
    Ok(())
}

/// Full lowercase hex HMAC of a value
pub fn token_hash(session_key: &[u8], category: Category, value: &str) -> FinguardResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(session_key)
        .map_err(|e| FinguardError::Encryption(format!("Failed to key token hash: {}", e)))?;
    mac.update(category.label().as_bytes());
    mac.update(&[0u8]);
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Render a placeholder from a category and a (possibly truncated) hash
pub fn placeholder(category: Category, hash: &str) -> String {
    format!("[{}_{}]", category.label(), hash)
}
