//! Settings for finguard
//!
//! Tunables for key derivation, rotation, the key cache and redaction
//! sessions. Every field has a default, so a partial or empty `config.json`
//! is valid.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::paths::FinguardPaths;
use crate::crypto::key_derivation::KeyDerivationParams;
use crate::error::{FinguardError, FinguardResult};
use crate::keys::backup::DEFAULT_RETENTION_DAYS;
use crate::keys::lifecycle::RotationPolicy;
use crate::mapper::DEFAULT_KEY_ID;
use crate::redaction::session::{
    SessionConfig, DEFAULT_CONTEXT_WINDOW_MINUTES, DEFAULT_IDLE_EXPIRY_HOURS,
};
use crate::redaction::token::DEFAULT_TOKEN_HEX_LEN;
use crate::storage::write_json_atomic;

/// Key store and cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    /// Key id used by schema rules that don't name one
    pub default_key_id: String,
    /// How long resolved key material stays cached
    pub cache_ttl_seconds: i64,
    /// Bound on one key-store round trip
    pub key_store_timeout_ms: u64,
    /// How long backups of retired versions are kept (about 7 years)
    pub backup_retention_days: i64,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            default_key_id: DEFAULT_KEY_ID.to_string(),
            cache_ttl_seconds: 300,
            key_store_timeout_ms: 5_000,
            backup_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl KeySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(self.cache_ttl_seconds)
    }

    pub fn key_store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.key_store_timeout_ms)
    }
}

/// Redaction session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    /// Inactivity after which a (user, purpose) pair gets a fresh session
    pub context_window_minutes: i64,
    /// Inactivity after which a session can no longer restore
    pub idle_expiry_hours: i64,
    /// Hex characters kept from each placeholder hash (8-32)
    pub token_hex_len: usize,
    /// Also run unmarked string fields through the free-text detector
    pub scan_free_text: bool,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            context_window_minutes: DEFAULT_CONTEXT_WINDOW_MINUTES,
            idle_expiry_hours: DEFAULT_IDLE_EXPIRY_HOURS,
            token_hex_len: DEFAULT_TOKEN_HEX_LEN,
            scan_free_text: true,
        }
    }
}

impl RedactionSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            context_window: Duration::minutes(self.context_window_minutes),
            idle_expiry: Duration::hours(self.idle_expiry_hours),
            token_hex_len: self.token_hex_len,
        }
    }
}

/// Settings for finguard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Argon2id cost parameters for key derivation
    #[serde(default)]
    pub kdf: KeyDerivationParams,

    #[serde(default)]
    pub rotation: RotationPolicy,

    #[serde(default)]
    pub keys: KeySettings,

    #[serde(default)]
    pub redaction: RedactionSettings,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            kdf: KeyDerivationParams::default(),
            rotation: RotationPolicy::default(),
            keys: KeySettings::default(),
            redaction: RedactionSettings::default(),
        }
    }
}

impl Settings {
    /// Reject settings the components cannot run with
    pub fn validate(&self) -> FinguardResult<()> {
        if self.kdf.time_cost == 0 || self.kdf.parallelism == 0 {
            return Err(FinguardError::Config(
                "KDF time cost and parallelism must be at least 1".into(),
            ));
        }
        if self.kdf.memory_cost < 8 * self.kdf.parallelism {
            return Err(FinguardError::Config(
                "KDF memory cost must be at least 8 KiB per lane".into(),
            ));
        }
        if self.rotation.interval_days <= 0 {
            return Err(FinguardError::Config(
                "Rotation interval must be at least one day".into(),
            ));
        }
        if self.keys.default_key_id.trim().is_empty() {
            return Err(FinguardError::Config("Default key id cannot be empty".into()));
        }
        if self.keys.cache_ttl_seconds < 0 {
            return Err(FinguardError::Config("Key cache TTL cannot be negative".into()));
        }
        if self.keys.key_store_timeout_ms == 0 {
            return Err(FinguardError::Config("Key store timeout must be positive".into()));
        }
        if self.keys.backup_retention_days <= 0 {
            return Err(FinguardError::Config(
                "Backup retention must be at least one day".into(),
            ));
        }
        self.redaction.session_config().validate()
    }

    /// Load settings from disk, or defaults if the file doesn't exist
    pub fn load_or_create(paths: &FinguardPaths) -> FinguardResult<Self> {
        let settings_path = paths.settings_file();

        let settings = if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path).map_err(|e| {
                FinguardError::Io(format!("Failed to read settings file: {}", e))
            })?;

            serde_json::from_str(&contents).map_err(|e| {
                FinguardError::Config(format!("Failed to parse settings file: {}", e))
            })?
        } else {
            // Not persisted until the caller saves
            Settings::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, paths: &FinguardPaths) -> FinguardResult<()> {
        self.validate()?;
        paths.ensure_directories()?;
        write_json_atomic(paths.settings_file(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.rotation.interval_days, 90);
        assert!(settings.rotation.auto_rotate);
        assert_eq!(settings.keys.default_key_id, "default");
        assert_eq!(settings.keys.backup_retention_days, 2555);
        assert_eq!(settings.redaction.token_hex_len, 10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());

        let mut settings = Settings::default();
        settings.rotation.interval_days = 30;
        settings.redaction.scan_free_text = false;
        settings.save(&paths).unwrap();

        let loaded = Settings::load_or_create(&paths).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());
        std::fs::write(paths.settings_file(), r#"{"rotation": {"interval_days": 45}}"#).unwrap();

        let loaded = Settings::load_or_create(&paths).unwrap();
        assert_eq!(loaded.rotation.interval_days, 45);
        assert!(loaded.rotation.auto_rotate);
        assert_eq!(loaded.redaction, RedactionSettings::default());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.redaction.token_hex_len = 64;
        assert!(matches!(settings.validate(), Err(FinguardError::Config(_))));

        let mut settings = Settings::default();
        settings.rotation.interval_days = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.kdf.memory_cost = 8;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());
        std::fs::write(paths.settings_file(), "{not json").unwrap();

        assert!(matches!(
            Settings::load_or_create(&paths),
            Err(FinguardError::Config(_))
        ));
    }
}
