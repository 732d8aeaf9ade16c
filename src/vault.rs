//! The `Finguard` facade
//!
//! Wires the key store, lifecycle manager, record mapper and redaction
//! engine together from settings and root secrets. Startup runs the key
//! audit and makes sure the default key id exists, so configuration and
//! key-integrity problems surface before the first call.

use std::sync::Arc;

use serde_json::Value;

use crate::audit::AuditLogger;
use crate::clock::{Clock, SystemClock};
use crate::config::{FinguardPaths, Secrets, Settings};
use crate::error::{FinguardError, FinguardResult};
use crate::keys::{
    AuditReport, KeyBackupVault, KeyLifecycleManager, KeyMaterialStore, KeyProvider, KeyStats,
    LocalKeyProvider, RotationOutcome, RotationResult, ScheduledRotation, TickerHandle,
    TimeoutProvider,
};
use crate::mapper::{DecryptReport, RecordEncryptionMapper};
use crate::redaction::{
    ContextShape, ContextSummary, Redacted, RedactionEngine, ResidualReport, SessionId,
    SessionRegistry,
};
use crate::schema::FieldSchema;

/// Purpose tag of the key id created at startup
const DEFAULT_KEY_PURPOSE: &str = "records";

/// Builder for [`Finguard`]
pub struct FinguardBuilder {
    settings: Settings,
    secrets: Option<Secrets>,
    paths: Option<FinguardPaths>,
    schema: FieldSchema,
    clock: Option<Arc<dyn Clock>>,
    provider: Option<Arc<dyn KeyProvider>>,
    log: Option<Arc<AuditLogger>>,
}

impl FinguardBuilder {
    pub fn new(schema: FieldSchema) -> Self {
        Self {
            settings: Settings::default(),
            secrets: None,
            paths: None,
            schema,
            clock: None,
            provider: None,
            log: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Persist key metadata, backups and the audit log under `paths`
    ///
    /// Without paths everything stays in memory.
    pub fn paths(mut self, paths: FinguardPaths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a managed key service instead of local derivation
    pub fn provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn audit_log(mut self, log: Arc<AuditLogger>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> FinguardResult<Finguard> {
        let settings = self.settings;
        settings.validate()?;

        let secrets = self
            .secrets
            .ok_or_else(|| FinguardError::Config("Root secrets were not provided".into()))?;

        if let Some(paths) = &self.paths {
            paths.ensure_directories()?;
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let log = match (self.log, &self.paths) {
            (Some(log), _) => log,
            (None, Some(paths)) => Arc::new(AuditLogger::new(paths.audit_log())),
            (None, None) => Arc::new(AuditLogger::in_memory()),
        };

        let provider: Arc<dyn KeyProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                let local = match &self.paths {
                    Some(paths) => LocalKeyProvider::with_file(
                        secrets.master_secret().clone(),
                        secrets.master_salt().clone(),
                        settings.kdf.clone(),
                        paths.keys_file(),
                    )?,
                    None => LocalKeyProvider::new(
                        secrets.master_secret().clone(),
                        secrets.master_salt().clone(),
                        settings.kdf.clone(),
                    ),
                };
                Arc::new(TimeoutProvider::new(local, settings.keys.key_store_timeout()))
            }
        };

        let backups = match &self.paths {
            Some(paths) => KeyBackupVault::with_file(
                secrets.backup_secret(),
                secrets.master_salt(),
                &settings.kdf,
                settings.keys.backup_retention_days,
                paths.key_backups_file(),
            )?,
            None => KeyBackupVault::new(
                secrets.backup_secret(),
                secrets.master_salt(),
                &settings.kdf,
                settings.keys.backup_retention_days,
            )?,
        };

        let store = Arc::new(KeyMaterialStore::new(
            provider,
            Arc::clone(&clock),
            settings.keys.cache_ttl(),
        ));
        let lifecycle = Arc::new(KeyLifecycleManager::new(
            Arc::clone(&store),
            Arc::new(backups),
            Arc::clone(&log),
            settings.rotation.clone(),
        ));

        let startup_report = lifecycle.audit()?;
        lifecycle.ensure_key(&settings.keys.default_key_id, DEFAULT_KEY_PURPOSE)?;

        let sessions = Arc::new(SessionRegistry::new(
            settings.redaction.session_config(),
            clock,
            Arc::clone(&log),
        )?);
        let redaction = RedactionEngine::new(self.schema.clone(), sessions)
            .with_free_text_scan(settings.redaction.scan_free_text);
        let mapper = RecordEncryptionMapper::new(store, Arc::clone(&log))
            .with_default_key_id(settings.keys.default_key_id.clone());

        Ok(Finguard {
            settings,
            schema: self.schema,
            log,
            lifecycle,
            mapper,
            redaction,
            startup_report,
        })
    }
}

/// Redaction, field encryption and key lifecycle behind one handle
pub struct Finguard {
    settings: Settings,
    schema: FieldSchema,
    log: Arc<AuditLogger>,
    lifecycle: Arc<KeyLifecycleManager>,
    mapper: RecordEncryptionMapper,
    redaction: RedactionEngine,
    startup_report: AuditReport,
}

impl Finguard {
    pub fn builder(schema: FieldSchema) -> FinguardBuilder {
        FinguardBuilder::new(schema)
    }

    /// Start from the environment: data directory, settings file and secrets
    ///
    /// Missing or weak secrets stop startup with a configuration error.
    pub fn from_env(schema: FieldSchema) -> FinguardResult<Self> {
        let paths = FinguardPaths::new()?;
        let settings = Settings::load_or_create(&paths)?;
        let secrets = Secrets::from_env()?;

        FinguardBuilder::new(schema)
            .settings(settings)
            .secrets(secrets)
            .paths(paths)
            .build()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn audit_log(&self) -> &Arc<AuditLogger> {
        &self.log
    }

    pub fn lifecycle(&self) -> &Arc<KeyLifecycleManager> {
        &self.lifecycle
    }

    pub fn redaction(&self) -> &RedactionEngine {
        &self.redaction
    }

    pub fn mapper(&self) -> &RecordEncryptionMapper {
        &self.mapper
    }

    /// Key audit performed during startup
    pub fn startup_report(&self) -> &AuditReport {
        &self.startup_report
    }

    // Storage path

    pub fn encrypt_record(&self, record: &Value) -> FinguardResult<Value> {
        self.mapper.encrypt_record(record, &self.schema)
    }

    pub fn decrypt_record(&self, record: &Value) -> FinguardResult<Value> {
        self.mapper.decrypt_record(record, &self.schema)
    }

    pub fn decrypt_record_report(&self, record: &Value) -> FinguardResult<DecryptReport> {
        self.mapper.decrypt_record_report(record, &self.schema)
    }

    // Reasoning-service path

    pub fn redact_record(
        &self,
        record: &Value,
        purpose: &str,
        user_id: &str,
    ) -> FinguardResult<Redacted<Value>> {
        self.redaction.redact_record(record, purpose, user_id)
    }

    pub fn redact_text(
        &self,
        text: &str,
        purpose: &str,
        user_id: &str,
    ) -> FinguardResult<Redacted<String>> {
        self.redaction.redact_text(text, purpose, user_id)
    }

    pub fn restore(&self, text: &str, session_id: SessionId) -> FinguardResult<String> {
        self.redaction.restore(text, session_id)
    }

    pub fn restore_record(&self, value: &Value, session_id: SessionId) -> FinguardResult<Value> {
        self.redaction.restore_record(value, session_id)
    }

    pub fn validate_no_residual_sensitive_data(&self, text: &str) -> ResidualReport {
        self.redaction.validate_no_residual_sensitive_data(text)
    }

    pub fn minimize_context(&self, redacted: &Value, shape: &ContextShape) -> ContextSummary {
        self.redaction.minimize_context(redacted, shape)
    }

    pub fn end_session(&self, session_id: SessionId) -> bool {
        self.redaction.end_session(session_id)
    }

    // Key lifecycle

    pub fn audit_keys(&self) -> FinguardResult<AuditReport> {
        self.lifecycle.audit()
    }

    pub fn rotate(&self, key_id: &str) -> FinguardResult<RotationResult> {
        self.lifecycle.rotate(key_id)
    }

    pub fn run_due_rotations(&self) -> Vec<(ScheduledRotation, FinguardResult<RotationOutcome>)> {
        self.lifecycle.run_due()
    }

    pub fn retire_expired_keys(&self) -> FinguardResult<Vec<(String, u32)>> {
        self.lifecycle.retire_expired()
    }

    pub fn key_stats(&self) -> FinguardResult<KeyStats> {
        self.lifecycle.stats()
    }

    /// Run due rotations on a background thread every `period`
    pub fn start_rotation_ticker(&self, period: std::time::Duration) -> FinguardResult<TickerHandle> {
        self.lifecycle.spawn_ticker(period)
    }

    /// Drop idle sessions and stale cached key material
    ///
    /// Returns (sessions evicted, cache entries evicted).
    pub fn evict_expired(&self) -> (usize, usize) {
        (
            self.redaction.evict_expired(),
            self.lifecycle.store().evict_expired(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::key_derivation::test_params;
    use crate::crypto::{EncryptedField, SecureString};
    use crate::keys::provider::test_provider;
    use crate::schema::{Category, FieldRule};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn secrets() -> Secrets {
        Secrets::new(
            SecureString::new("test-master-secret-0123456789"),
            SecureString::new("test-salt-0001"),
            SecureString::new("test-backup-secret-0123456789"),
        )
        .unwrap()
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.kdf = test_params();
        settings
    }

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .with_rule(FieldRule::new("ahv").unwrap().encrypted())
            .with_rule(
                FieldRule::new("first_name")
                    .unwrap()
                    .anonymized(Category::Name)
                    .encrypted(),
            )
            .with_rule(FieldRule::new("accounts[].iban").unwrap().encrypted())
    }

    fn record() -> Value {
        json!({
            "first_name": "Jean",
            "ahv": "756.1234.5678.90",
            "canton": "VD",
            "accounts": [{"iban": "CH93 0076 2011 6238 5295 7", "balance": 1200}]
        })
    }

    fn finguard(clock: Arc<ManualClock>) -> Finguard {
        Finguard::builder(schema())
            .settings(settings())
            .secrets(secrets())
            .clock(clock)
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_secrets_is_config_error() {
        let err = Finguard::builder(schema())
            .settings(settings())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FinguardError::Config(_)));
    }

    #[test]
    fn test_startup_creates_default_key() {
        let fg = finguard(Arc::new(ManualClock::new(Utc::now())));
        assert!(fg.startup_report().keys.is_empty());

        let stats = fg.key_stats().unwrap();
        assert_eq!(stats.total_versions, 1);
        assert_eq!(stats.pending_jobs, 1);
    }

    #[test]
    fn test_storage_round_trip() {
        let fg = finguard(Arc::new(ManualClock::new(Utc::now())));
        let encrypted = fg.encrypt_record(&record()).unwrap();

        assert!(EncryptedField::from_value(&encrypted["ahv"]).is_some());
        assert_eq!(encrypted["canton"], "VD");
        assert_eq!(fg.decrypt_record(&encrypted).unwrap(), record());
    }

    #[test]
    fn test_rotation_scenario() {
        let fg = finguard(Arc::new(ManualClock::new(Utc::now())));
        let before = fg.encrypt_record(&record()).unwrap();

        let result = fg.rotate("default").unwrap();
        assert_eq!((result.from, result.to), (1, 2));

        let after = fg.encrypt_record(&record()).unwrap();
        let field = EncryptedField::from_value(&after["ahv"]).unwrap();
        assert_eq!(field.key_version, 2);

        assert_eq!(fg.decrypt_record(&before).unwrap(), record());
        assert_eq!(fg.decrypt_record(&after).unwrap(), record());
    }

    #[test]
    fn test_redaction_round_trip() {
        let fg = finguard(Arc::new(ManualClock::new(Utc::now())));
        let text = "Contact me at jean@example.ch or +41 21 123 45 67";

        let out = fg.redact_text(text, "advice", "u1").unwrap();
        assert!(fg.validate_no_residual_sensitive_data(&out.redacted).clean);
        assert_eq!(fg.restore(&out.redacted, out.session_id).unwrap(), text);

        let redacted = fg.redact_record(&record(), "advice", "u1").unwrap();
        assert_eq!(redacted.session_id, out.session_id);
        assert!(redacted.redacted["first_name"]
            .as_str()
            .unwrap()
            .starts_with("[NAME_"));
    }

    #[test]
    fn test_evict_expired() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let fg = finguard(clock.clone());
        fg.redact_text("mail jean@example.ch", "advice", "u1").unwrap();

        clock.advance(Duration::hours(25));
        let (sessions, _) = fg.evict_expired();
        assert_eq!(sessions, 1);
    }

    #[test]
    fn test_persistent_restart() {
        let temp_dir = TempDir::new().unwrap();
        let paths = FinguardPaths::with_base_dir(temp_dir.path().to_path_buf());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let encrypted = {
            let fg = Finguard::builder(schema())
                .settings(settings())
                .secrets(secrets())
                .paths(paths.clone())
                .clock(clock.clone())
                .build()
                .unwrap();
            fg.encrypt_record(&record()).unwrap()
        };

        let fg = Finguard::builder(schema())
            .settings(settings())
            .secrets(secrets())
            .paths(paths.clone())
            .clock(clock)
            .build()
            .unwrap();
        assert_eq!(fg.startup_report().keys.len(), 1);
        assert_eq!(fg.decrypt_record(&encrypted).unwrap(), record());
        assert!(paths.audit_log().exists());
    }

    #[test]
    fn test_restart_after_revoked_default_key() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let build = || {
            Finguard::builder(schema())
                .settings(settings())
                .secrets(secrets())
                .provider(Arc::clone(&provider))
                .clock(clock.clone())
                .build()
        };

        let fg = build().unwrap();
        fg.lifecycle().revoke("default", 1, "integrity").unwrap();
        drop(fg);

        let fg = build().unwrap();
        assert_eq!(fg.startup_report().without_active, vec!["default".to_string()]);

        let encrypted = fg.encrypt_record(&record()).unwrap();
        let field = EncryptedField::from_value(&encrypted["ahv"]).unwrap();
        assert_eq!(field.key_version, 2);
        assert_eq!(fg.decrypt_record(&encrypted).unwrap(), record());
    }

    #[test]
    fn test_manual_rotation_policy_survives_restart() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut manual = settings();
        manual.rotation.auto_rotate = false;
        let build = || {
            Finguard::builder(schema())
                .settings(manual.clone())
                .secrets(secrets())
                .provider(Arc::clone(&provider))
                .clock(clock.clone())
                .build()
                .unwrap()
        };

        build();
        clock.advance(Duration::days(91));

        let fg = build();
        assert_eq!(fg.startup_report().due().len(), 1);
        assert_eq!(fg.key_stats().unwrap().pending_jobs, 0);
        assert!(fg.run_due_rotations().is_empty());
    }
}
