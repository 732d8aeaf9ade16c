//! Record encryption mapper
//!
//! Encrypts and decrypts only the fields a [`FieldSchema`] marks
//! `sensitive && encrypted`. Each value is encrypted as its JSON encoding,
//! so strings, numbers, booleans and whole sub-trees round-trip exactly.
//! Everything else passes through untouched.

use std::sync::Arc;

use serde_json::Value;
use zeroize::Zeroizing;

use crate::audit::{AuditEntry, AuditLogger, SecurityEvent};
use crate::crypto::{decrypt, encrypt, EncryptedField};
use crate::error::{FinguardError, FinguardResult};
use crate::keys::{KeyMaterial, KeyMaterialStore};
use crate::schema::{format_path, FieldSchema};

/// Key id used by rules that don't name one
pub const DEFAULT_KEY_ID: &str = "default";

/// A decrypted record plus the marked fields that could not be decrypted
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptReport {
    pub record: Value,
    /// Locations holding something other than an encrypted field
    pub skipped: Vec<String>,
}

/// Applies field-level encryption to JSON records
pub struct RecordEncryptionMapper {
    store: Arc<KeyMaterialStore>,
    log: Arc<AuditLogger>,
    default_key_id: String,
}

impl RecordEncryptionMapper {
    pub fn new(store: Arc<KeyMaterialStore>, log: Arc<AuditLogger>) -> Self {
        Self {
            store,
            log,
            default_key_id: DEFAULT_KEY_ID.to_string(),
        }
    }

    pub fn with_default_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.default_key_id = key_id.into();
        self
    }

    /// Encrypt every marked field under the active version of its key id
    ///
    /// Missing and null values are left alone, as are values that already
    /// are encrypted fields.
    pub fn encrypt_record(&self, record: &Value, schema: &FieldSchema) -> FinguardResult<Value> {
        let mut output = record.clone();

        for rule in schema.encrypted_rules() {
            let key_id = rule.key_id.as_deref().unwrap_or(&self.default_key_id);
            let mut material: Option<Arc<KeyMaterial>> = None;
            let mut failure: Option<FinguardError> = None;

            rule.path.for_each_match_mut(&mut output, |_, value| {
                if failure.is_some() || value.is_null() || EncryptedField::from_value(value).is_some() {
                    return;
                }

                let key = match &material {
                    Some(key) => Arc::clone(key),
                    None => match self.store.active_material(key_id) {
                        Ok(key) => {
                            material = Some(Arc::clone(&key));
                            key
                        }
                        Err(e) => {
                            failure = Some(e);
                            return;
                        }
                    },
                };

                match encrypt_value(value, &key) {
                    Ok(encrypted) => *value = encrypted,
                    Err(e) => failure = Some(e),
                }
            });

            if let Some(e) = failure {
                return Err(e);
            }
        }

        Ok(output)
    }

    /// Decrypt every marked field
    pub fn decrypt_record(&self, record: &Value, schema: &FieldSchema) -> FinguardResult<Value> {
        Ok(self.decrypt_record_report(record, schema)?.record)
    }

    /// Decrypt every marked field, reporting the ones that were skipped
    ///
    /// A marked value that is not an encrypted field is left as-is, logged
    /// as a warning and listed in `skipped`. Authentication and key errors
    /// abort the whole record.
    pub fn decrypt_record_report(
        &self,
        record: &Value,
        schema: &FieldSchema,
    ) -> FinguardResult<DecryptReport> {
        let mut output = record.clone();
        let mut skipped = Vec::new();

        // Reverse order so a rule nested inside another is undone last-in first-out
        let rules: Vec<_> = schema.encrypted_rules().collect();
        for rule in rules.into_iter().rev() {
            let mut failure: Option<FinguardError> = None;

            rule.path.for_each_match_mut(&mut output, |steps, value| {
                if failure.is_some() || value.is_null() {
                    return;
                }

                let field = match EncryptedField::from_value(value) {
                    Some(field) => field,
                    None => {
                        let location = format_path(steps);
                        self.log.record(
                            AuditEntry::warning(SecurityEvent::NonConformingField)
                                .with_detail(format!("{} (rule {})", location, rule.path)),
                        );
                        skipped.push(location);
                        return;
                    }
                };

                match decrypt_value(&field, &self.store) {
                    Ok(plain) => *value = plain,
                    Err(e) => failure = Some(e),
                }
            });

            if let Some(e) = failure {
                return Err(e);
            }
        }

        Ok(DecryptReport {
            record: output,
            skipped,
        })
    }
}

fn encrypt_value(value: &Value, key: &KeyMaterial) -> FinguardResult<Value> {
    let plaintext = Zeroizing::new(serde_json::to_string(value)?);
    encrypt(&plaintext, key)?.to_value()
}

fn decrypt_value(field: &EncryptedField, store: &KeyMaterialStore) -> FinguardResult<Value> {
    let plaintext = Zeroizing::new(decrypt(field, store)?);
    // Values encrypted outside the mapper are bare strings, not JSON
    Ok(serde_json::from_str(&plaintext).unwrap_or_else(|_| Value::String(plaintext.to_string())))
}
