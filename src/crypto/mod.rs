//! Cryptographic functions for finguard
//!
//! Provides AES-256-GCM field encryption with Argon2id key derivation
//! and zeroizing containers for secrets.

pub mod encryption;
pub mod key_derivation;
pub mod secure_memory;

pub use encryption::{
    decrypt, decrypt_bytes, decrypt_with_key, encrypt, encrypt_bytes, EncryptedField,
};
pub use key_derivation::{derive_key, generate_salt, DerivedKey, KeyDerivationParams};
pub use secure_memory::SecureString;
