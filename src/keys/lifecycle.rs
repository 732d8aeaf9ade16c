//! Key lifecycle orchestration
//!
//! Bootstraps key ids, audits key health at startup, rotates (manually or
//! from the scheduler), retires deprecated versions once their backup
//! expires, revokes on integrity failure and recovers from backups.
//!
//! Every operation on a key id holds that key id's lock, so one key id is
//! never rotated twice at once while different key ids proceed in parallel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditLogger, SecurityEvent};
use crate::clock::Clock;
use crate::crypto::{decrypt_with_key, encrypt};
use crate::error::{FinguardError, FinguardResult};

use super::backup::KeyBackupVault;
use super::material::{KeyMaterial, KeyMetadata, KeyStatus};
use super::rotation::{RotationResult, RotationWorkflow};
use super::scheduler::{
    spawn_ticker, RotationSchedule, RotationScheduler, ScheduledRotation, TickerHandle,
    DEFAULT_ROTATION_INTERVAL_DAYS,
};
use super::store::KeyMaterialStore;

/// Value round-tripped by the integrity self-test
pub const INTEGRITY_CANARY: &str = "finguard-integrity-canary";

/// Rotation policy applied to every key id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Days between rotations
    pub interval_days: i64,
    /// Queue rotations automatically when a version comes due
    pub auto_rotate: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval_days: DEFAULT_ROTATION_INTERVAL_DAYS,
            auto_rotate: true,
        }
    }
}

impl RotationPolicy {
    pub fn interval(&self) -> Duration {
        Duration::days(self.interval_days)
    }
}

/// Health of the current version of one key id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHealth {
    pub key_id: String,
    pub version: u32,
    /// Status after the audit
    pub status: KeyStatus,
    pub age_days: i64,
    pub due: bool,
    pub integrity_ok: bool,
}

/// Outcome of a startup audit
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub keys: Vec<KeyHealth>,
    /// Key ids with no active or rotating version
    pub without_active: Vec<String>,
}

impl AuditReport {
    pub fn due(&self) -> Vec<&KeyHealth> {
        self.keys.iter().filter(|k| k.due && k.integrity_ok).collect()
    }

    pub fn revoked(&self) -> Vec<&KeyHealth> {
        self.keys.iter().filter(|k| !k.integrity_ok).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.keys.iter().all(|k| k.integrity_ok) && self.without_active.is_empty()
    }
}

/// Result of a scheduled rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated { from: u32, to: u32 },
    /// The key had already moved past the expected version
    Stale { expected: u32, current: u32 },
}

/// Read-only operational statistics
#[derive(Debug, Clone, Default)]
pub struct KeyStats {
    pub by_status: BTreeMap<KeyStatus, usize>,
    pub total_versions: usize,
    /// Soonest first
    pub upcoming_rotations: Vec<RotationSchedule>,
    pub backups: usize,
    pub pending_jobs: usize,
}

impl KeyStats {
    pub fn count(&self, status: KeyStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Drives the lifecycle of every key id
pub struct KeyLifecycleManager {
    store: Arc<KeyMaterialStore>,
    backups: Arc<KeyBackupVault>,
    scheduler: RotationScheduler,
    log: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLifecycleManager {
    pub fn new(
        store: Arc<KeyMaterialStore>,
        backups: Arc<KeyBackupVault>,
        log: Arc<AuditLogger>,
        policy: RotationPolicy,
    ) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            backups,
            scheduler: RotationScheduler::new(),
            log,
            clock,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<KeyMaterialStore> {
        &self.store
    }

    pub fn backups(&self) -> &Arc<KeyBackupVault> {
        &self.backups
    }

    pub fn scheduler(&self) -> &RotationScheduler {
        &self.scheduler
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    fn key_lock(&self, key_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key_id.to_string()).or_default())
    }

    fn record(&self, entry: AuditEntry) {
        self.log.record(entry.at(self.clock.now()));
    }

    fn key_ids(&self) -> FinguardResult<BTreeSet<String>> {
        Ok(self
            .store
            .provider()
            .list_keys()?
            .into_iter()
            .map(|meta| meta.key_id)
            .collect())
    }

    fn metadata(&self, key_id: &str, version: u32) -> FinguardResult<Option<KeyMetadata>> {
        Ok(self
            .store
            .versions(key_id)?
            .into_iter()
            .find(|meta| meta.version == version))
    }

    fn schedule_next(&self, key_id: &str, version: u32, at: DateTime<Utc>) {
        self.scheduler.schedule(RotationSchedule {
            key_id: key_id.to_string(),
            current_version: version,
            next_rotation_at: at,
            interval_days: self.policy.interval_days,
            auto_rotate: self.policy.auto_rotate,
        });
    }

    /// Generate, activate and persist a version in one step
    fn issue_version(
        &self,
        key_id: &str,
        version: u32,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> FinguardResult<KeyMaterial> {
        let material = self.store.provider().generate_key(
            key_id,
            version,
            purpose,
            now,
            Some(now + self.policy.interval()),
        )?;
        let mut metadata = material.metadata().clone();
        metadata.transition(KeyStatus::Active, now)?;
        let material = material.with_metadata(metadata);

        self.store.provider().store_key(&material)?;
        self.store.invalidate_key(key_id);
        self.store.set_active(key_id, version);
        Ok(material)
    }

    /// Make sure `key_id` has a version usable for encryption
    ///
    /// Creates version 1 for an unknown key id. A key id whose versions are
    /// all revoked or deprecated gets a fresh version after the latest one.
    pub fn ensure_key(&self, key_id: &str, purpose: &str) -> FinguardResult<Arc<KeyMaterial>> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let versions = self.store.versions(key_id)?;
        let latest = versions.iter().max_by_key(|meta| meta.version);
        let issue = match latest {
            None => Some((1, format!("purpose {}", purpose))),
            Some(latest) if !versions.iter().any(|meta| meta.status.can_encrypt()) => Some((
                latest.version + 1,
                format!("purpose {}, replaces {}", purpose, latest.label()),
            )),
            Some(_) => None,
        };

        if let Some((version, detail)) = issue {
            let now = self.clock.now();
            self.issue_version(key_id, version, purpose, now)?;
            self.record(
                AuditEntry::info(SecurityEvent::KeyCreated)
                    .with_key(key_id, version)
                    .with_detail(detail),
            );
            self.schedule_next(key_id, version, now + self.policy.interval());
        }

        self.store.active_material(key_id)
    }

    /// Startup audit of every known key id
    ///
    /// Due versions are marked `rotating`. With `auto_rotate` they are also
    /// queued for immediate rotation; otherwise rotation is left to `rotate`.
    /// A version failing the self-test is revoked and raises a critical
    /// alert. Provider errors abort the audit rather than revoke.
    pub fn audit(&self) -> FinguardResult<AuditReport> {
        let mut report = AuditReport::default();

        for key_id in self.key_ids()? {
            let lock = self.key_lock(&key_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let now = self.clock.now();

            self.store.invalidate_key(&key_id);
            let current = self
                .store
                .versions(&key_id)?
                .into_iter()
                .filter(|meta| meta.status.can_encrypt())
                .max_by_key(|meta| meta.version);

            let metadata = match current {
                Some(metadata) => metadata,
                None => {
                    report.without_active.push(key_id);
                    continue;
                }
            };

            let due_at = metadata
                .expires_at
                .unwrap_or(metadata.created_at + self.policy.interval());
            let mut health = KeyHealth {
                key_id: key_id.clone(),
                version: metadata.version,
                status: metadata.status,
                age_days: (now - metadata.created_at).num_days(),
                due: now >= due_at,
                integrity_ok: true,
            };

            if let Some(reason) = self.self_test(&metadata)? {
                health.integrity_ok = false;
                self.record(
                    AuditEntry::critical(SecurityEvent::IntegrityCheckFailed)
                        .with_key(key_id.as_str(), metadata.version)
                        .with_detail(reason.as_str()),
                );
                self.revoke_locked(&key_id, metadata.version, &reason)?;
                health.status = KeyStatus::Revoked;
            } else if health.due {
                if metadata.status == KeyStatus::Active {
                    let mut rotating = metadata.clone();
                    rotating.transition(KeyStatus::Rotating, now)?;
                    self.store.provider().update_metadata(&rotating)?;
                    self.store.invalidate(&key_id, metadata.version);
                    health.status = KeyStatus::Rotating;
                }
                self.record(
                    AuditEntry::warning(SecurityEvent::KeyDue)
                        .with_key(key_id.as_str(), metadata.version)
                        .with_detail(format!("due since {}", due_at.format("%Y-%m-%d"))),
                );
                // Queues an immediate job only under auto-rotate
                self.schedule_next(&key_id, metadata.version, now);
            } else {
                self.schedule_next(&key_id, metadata.version, due_at);
            }

            report.keys.push(health);
        }

        Ok(report)
    }

    /// `Ok(Some(reason))` on an integrity failure
    fn self_test(&self, metadata: &KeyMetadata) -> FinguardResult<Option<String>> {
        let material = self
            .store
            .provider()
            .load_key(&metadata.key_id, metadata.version)?;

        if let Some(expected) = &metadata.fingerprint {
            if material.key().fingerprint() != *expected {
                return Ok(Some("key fingerprint mismatch".to_string()));
            }
        }

        let field = match encrypt(INTEGRITY_CANARY, &material) {
            Ok(field) => field,
            Err(e) => return Ok(Some(format!("canary encryption failed: {}", e))),
        };
        match decrypt_with_key(&field, &material) {
            Ok(plaintext) if plaintext == INTEGRITY_CANARY => Ok(None),
            Ok(_) => Ok(Some("canary mismatch".to_string())),
            Err(e) => Ok(Some(format!("canary decryption failed: {}", e))),
        }
    }

    /// Rotate `key_id` now
    pub fn rotate(&self, key_id: &str) -> FinguardResult<RotationResult> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.rotate_locked(key_id)
    }

    /// Rotate only if `key_id` is still at `expected_version`
    pub fn rotate_if_current(
        &self,
        key_id: &str,
        expected_version: u32,
    ) -> FinguardResult<RotationOutcome> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.store.invalidate_key(key_id);
        let current = self.store.active_material(key_id)?.version();
        if current != expected_version {
            self.record(
                AuditEntry::info(SecurityEvent::RotationSkipped)
                    .with_key(key_id, current)
                    .with_detail(format!("scheduled for v{}", expected_version)),
            );
            return Ok(RotationOutcome::Stale {
                expected: expected_version,
                current,
            });
        }

        let result = self.rotate_locked(key_id)?;
        Ok(RotationOutcome::Rotated {
            from: result.from,
            to: result.to,
        })
    }

    fn rotate_locked(&self, key_id: &str) -> FinguardResult<RotationResult> {
        let now = self.clock.now();
        let versions = self.store.versions(key_id)?;
        let latest = match versions.iter().max_by_key(|meta| meta.version) {
            Some(latest) => latest.clone(),
            None => return Err(FinguardError::UnknownKey(key_id.to_string())),
        };

        let result = if versions.iter().any(|meta| meta.status.can_encrypt()) {
            RotationWorkflow::prepare(&self.store, &self.backups, key_id, now)
                .and_then(|workflow| workflow.run(self.policy.interval()))
        } else {
            // Nothing live to back up (all revoked or deprecated): issue fresh
            self.issue_version(key_id, latest.version + 1, &latest.purpose, now)
                .map(|material| RotationResult {
                    key_id: key_id.to_string(),
                    from: latest.version,
                    to: material.version(),
                    next_rotation_at: now + self.policy.interval(),
                })
                .map_err(|e| FinguardError::rotation_failed(key_id, e.to_string()))
        };

        match result {
            Ok(result) => {
                self.record(
                    AuditEntry::info(SecurityEvent::KeyRotated)
                        .with_key(key_id, result.to)
                        .with_detail(format!("v{} -> v{}", result.from, result.to)),
                );
                self.schedule_next(key_id, result.to, result.next_rotation_at);
                Ok(result)
            }
            Err(e) => {
                self.record(
                    AuditEntry::critical(SecurityEvent::RotationFailed)
                        .with_key_id(key_id)
                        .with_detail(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Execute every due scheduled rotation
    ///
    /// Jobs that fail with a retryable error are queued again.
    pub fn run_due(&self) -> Vec<(ScheduledRotation, FinguardResult<RotationOutcome>)> {
        let now = self.clock.now();
        self.scheduler
            .due(now)
            .into_iter()
            .map(|job| {
                let outcome = self.rotate_if_current(&job.key_id, job.expected_version);
                if let Err(e) = &outcome {
                    if e.is_retryable() {
                        self.scheduler
                            .schedule_now(&job.key_id, job.expected_version, now);
                    }
                }
                (job, outcome)
            })
            .collect()
    }

    /// Destroy deprecated versions whose backup has expired
    ///
    /// Ciphertext under a destroyed version is permanently unrecoverable.
    pub fn retire_expired(&self) -> FinguardResult<Vec<(String, u32)>> {
        let now = self.clock.now();
        let mut retired = Vec::new();

        for backup in self.backups.expired(now) {
            let lock = self.key_lock(&backup.key_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            let status = self
                .metadata(&backup.key_id, backup.version)?
                .map(|meta| meta.status);
            match status {
                Some(KeyStatus::Deprecated) => {}
                Some(KeyStatus::Destroyed) | None => {
                    self.backups.remove(&backup.key_id, backup.version)?;
                    continue;
                }
                Some(_) => continue,
            }

            self.store
                .provider()
                .destroy_key(&backup.key_id, backup.version)?;
            self.store.invalidate(&backup.key_id, backup.version);
            self.backups.remove(&backup.key_id, backup.version)?;

            self.record(
                AuditEntry::warning(SecurityEvent::KeyDestroyed)
                    .with_key(backup.key_id.as_str(), backup.version)
                    .with_detail(format!(
                        "backup expired {}",
                        backup.expires_at.format("%Y-%m-%d")
                    )),
            );
            retired.push((backup.key_id, backup.version));
        }

        Ok(retired)
    }

    /// Revoke a version; a revoked active version leaves the key id without
    /// an active version until the next rotation
    pub fn revoke(&self, key_id: &str, version: u32, reason: &str) -> FinguardResult<()> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.revoke_locked(key_id, version, reason)
    }

    fn revoke_locked(&self, key_id: &str, version: u32, reason: &str) -> FinguardResult<()> {
        let mut metadata = self
            .metadata(key_id, version)?
            .ok_or_else(|| FinguardError::unknown_version(key_id, version))?;
        let was_live = metadata.status.can_encrypt();

        metadata.transition(KeyStatus::Revoked, self.clock.now())?;
        metadata.revocation_reason = Some(reason.to_string());
        self.store.provider().update_metadata(&metadata)?;
        self.store.invalidate_key(key_id);

        if was_live {
            self.scheduler.unschedule(key_id);
        }

        self.record(
            AuditEntry::critical(SecurityEvent::KeyRevoked)
                .with_key(key_id, version)
                .with_detail(reason),
        );
        Ok(())
    }

    /// Restore a lost version from its backup as `deprecated`
    ///
    /// Providers that only persist metadata keep the recovered bytes for
    /// the life of the process.
    pub fn recover_from_backup(&self, key_id: &str, version: u32) -> FinguardResult<Arc<KeyMaterial>> {
        let lock = self.key_lock(key_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let key = self.backups.restore(key_id, version)?;

        let mut metadata = match self.metadata(key_id, version)? {
            Some(existing) if existing.status.can_encrypt() => {
                return Err(FinguardError::InvalidInput(format!(
                    "{} is {} and does not need recovery",
                    existing.label(),
                    existing.status
                )))
            }
            Some(existing) => existing,
            None => KeyMetadata::new(key_id, version, "recovered", now, None),
        };

        if let Some(expected) = &metadata.fingerprint {
            if *expected != key.fingerprint() {
                return Err(FinguardError::Authentication(format!(
                    "Recovered key for {} does not match its fingerprint",
                    metadata.label()
                )));
            }
        }

        metadata.fingerprint = Some(key.fingerprint());
        metadata.status = KeyStatus::Deprecated;
        metadata.status_changed_at = Some(now);
        metadata.revocation_reason = None;

        self.store
            .provider()
            .store_key(&KeyMaterial::new(metadata, key))?;
        self.store.invalidate(key_id, version);

        self.record(AuditEntry::warning(SecurityEvent::KeyRecovered).with_key(key_id, version));
        self.store.get_material(key_id, version)
    }

    /// Counts by status, upcoming rotations and backup totals
    pub fn stats(&self) -> FinguardResult<KeyStats> {
        let keys = self.store.provider().list_keys()?;
        let mut by_status = BTreeMap::new();
        for meta in &keys {
            *by_status.entry(meta.status).or_insert(0) += 1;
        }

        Ok(KeyStats {
            by_status,
            total_versions: keys.len(),
            upcoming_rotations: self.scheduler.upcoming(),
            backups: self.backups.count(),
            pending_jobs: self.scheduler.pending_jobs(),
        })
    }

    /// Run [`run_due`](Self::run_due) every `period` on a background thread
    ///
    /// The thread holds only a weak reference and exits once the manager
    /// is dropped or the handle is stopped.
    pub fn spawn_ticker(self: &Arc<Self>, period: std::time::Duration) -> FinguardResult<TickerHandle> {
        let manager = Arc::downgrade(self);
        spawn_ticker(period, move || {
            if let Some(manager) = manager.upgrade() {
                manager.run_due();
            }
        })
    }
}

#[cfg(test)]
pub(crate) fn test_manager(log: Arc<AuditLogger>) -> KeyLifecycleManager {
    let clock = Arc::new(crate::clock::ManualClock::new(Utc::now()));
    let store = Arc::new(KeyMaterialStore::new(
        Arc::new(super::provider::test_provider()),
        clock,
        Duration::seconds(300),
    ));
    KeyLifecycleManager::new(
        store,
        Arc::new(super::backup::test_vault()),
        log,
        RotationPolicy::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Severity;
    use crate::clock::ManualClock;
    use crate::crypto::{decrypt, key_derivation::test_params, SecureString};
    use crate::keys::backup::{test_vault, DEFAULT_RETENTION_DAYS};
    use crate::keys::provider::{test_provider, KeyProvider, LocalKeyProvider};
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<KeyLifecycleManager>,
        clock: Arc<ManualClock>,
        log: Arc<AuditLogger>,
    }

    fn fixture_with(provider: Arc<dyn KeyProvider>) -> Fixture {
        fixture_with_policy(provider, RotationPolicy::default())
    }

    fn fixture_with_policy(provider: Arc<dyn KeyProvider>, policy: RotationPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(KeyMaterialStore::new(
            provider,
            clock.clone(),
            Duration::seconds(300),
        ));
        let log = Arc::new(AuditLogger::in_memory());
        let manager = Arc::new(KeyLifecycleManager::new(
            store,
            Arc::new(test_vault()),
            log.clone(),
            policy,
        ));
        Fixture { manager, clock, log }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(test_provider()))
    }

    fn resolver(f: &Fixture) -> &KeyMaterialStore {
        f.manager.store()
    }

    fn events(log: &AuditLogger) -> Vec<SecurityEvent> {
        log.read_all().unwrap().into_iter().map(|e| e.event).collect()
    }

    #[test]
    fn test_ensure_key_bootstraps_once() {
        let f = fixture();
        let first = f.manager.ensure_key("default", "records").unwrap();
        let again = f.manager.ensure_key("default", "records").unwrap();

        assert_eq!(first.version(), 1);
        assert_eq!(again.version(), 1);
        assert_eq!(first.status(), KeyStatus::Active);
        assert_eq!(f.manager.stats().unwrap().total_versions, 1);
        assert!(f.manager.scheduler().schedule_for("default").is_some());
        assert_eq!(events(&f.log), vec![SecurityEvent::KeyCreated]);
    }

    #[test]
    fn test_rotation_keeps_old_data_readable() {
        let f = fixture();
        let v1 = f.manager.ensure_key("default", "records").unwrap();
        let legacy = encrypt("756.1234.5678.90", &v1).unwrap();

        let result = f.manager.rotate("default").unwrap();
        assert_eq!((result.from, result.to), (1, 2));

        let store = f.manager.store();
        let active = store.active_material("default").unwrap();
        assert_eq!(active.version(), 2);
        assert_eq!(encrypt("new", &active).unwrap().key_version, 2);
        assert_eq!(decrypt(&legacy, &**store).unwrap(), "756.1234.5678.90");

        let schedule = f.manager.scheduler().schedule_for("default").unwrap();
        assert_eq!(schedule.current_version, 2);
    }

    #[test]
    fn test_audit_marks_due_key_and_run_due_rotates() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.clock.advance(Duration::days(91));

        let report = f.manager.audit().unwrap();
        assert_eq!(report.due().len(), 1);
        assert_eq!(report.keys[0].status, KeyStatus::Rotating);
        assert!(report.is_healthy());

        // Still encrypts while rotating
        assert_eq!(
            f.manager.store().active_material("default").unwrap().status(),
            KeyStatus::Rotating
        );

        let ran = f.manager.run_due();
        assert_eq!(ran.len(), 1);
        assert_eq!(
            *ran[0].1.as_ref().unwrap(),
            RotationOutcome::Rotated { from: 1, to: 2 }
        );
        assert_eq!(f.manager.stats().unwrap().count(KeyStatus::Deprecated), 1);
    }

    #[test]
    fn test_stale_scheduled_rotation_is_noop() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.clock.advance(Duration::days(91));
        f.manager.audit().unwrap();

        // Manual rotation wins the race
        f.manager.rotate("default").unwrap();
        f.manager.scheduler().schedule_now("default", 1, f.clock.now());

        let ran = f.manager.run_due();
        assert_eq!(
            *ran[0].1.as_ref().unwrap(),
            RotationOutcome::Stale {
                expected: 1,
                current: 2
            }
        );
        assert_eq!(f.manager.store().active_material("default").unwrap().version(), 2);
        assert!(events(&f.log).contains(&SecurityEvent::RotationSkipped));
    }

    #[test]
    fn test_audit_revokes_key_failing_self_test() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys.json");
        let provider = |secret: &str| -> Arc<dyn KeyProvider> {
            Arc::new(
                LocalKeyProvider::with_file(
                    SecureString::new(secret),
                    SecureString::new("test-salt-0001"),
                    test_params(),
                    path.clone(),
                )
                .unwrap(),
            )
        };

        let original = fixture_with(provider("test-master-secret-0123456789"));
        original.manager.ensure_key("default", "records").unwrap();

        // Same metadata, wrong master secret: every key re-derives differently
        let tampered = fixture_with(provider("some-other-master-secret-42"));
        let report = tampered.manager.audit().unwrap();

        assert_eq!(report.revoked().len(), 1);
        assert!(!report.is_healthy());
        assert!(tampered.manager.store().active_material("default").is_err());

        let alerts = tampered.log.alerts().unwrap();
        assert!(alerts
            .iter()
            .any(|e| e.event == SecurityEvent::IntegrityCheckFailed));
        assert!(alerts.iter().all(|e| e.severity == Severity::Critical));
    }

    #[test]
    fn test_ensure_key_reissues_after_revocation() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.revoke("default", 1, "integrity").unwrap();
        assert!(f.manager.store().active_material("default").is_err());

        let fresh = f.manager.ensure_key("default", "records").unwrap();
        assert_eq!(fresh.version(), 2);
        assert_eq!(fresh.status(), KeyStatus::Active);
        assert_eq!(encrypt("756.1234.5678.90", &fresh).unwrap().key_version, 2);
        assert_eq!(f.manager.stats().unwrap().count(KeyStatus::Revoked), 1);
        assert_eq!(
            events(&f.log),
            vec![
                SecurityEvent::KeyCreated,
                SecurityEvent::KeyRevoked,
                SecurityEvent::KeyCreated
            ]
        );

        // Already live: no further version
        assert_eq!(f.manager.ensure_key("default", "records").unwrap().version(), 2);
    }

    #[test]
    fn test_audit_without_auto_rotate_leaves_rotation_manual() {
        let policy = RotationPolicy {
            auto_rotate: false,
            ..RotationPolicy::default()
        };
        let f = fixture_with_policy(Arc::new(test_provider()), policy);
        f.manager.ensure_key("default", "records").unwrap();
        f.clock.advance(Duration::days(91));

        let report = f.manager.audit().unwrap();
        assert_eq!(report.due().len(), 1);
        assert_eq!(report.keys[0].status, KeyStatus::Rotating);
        assert!(events(&f.log).contains(&SecurityEvent::KeyDue));

        assert_eq!(f.manager.scheduler().pending_jobs(), 0);
        assert!(f.manager.run_due().is_empty());
        assert_eq!(f.manager.store().active_material("default").unwrap().version(), 1);

        let result = f.manager.rotate("default").unwrap();
        assert_eq!((result.from, result.to), (1, 2));
    }

    #[test]
    fn test_healthy_audit_schedules_next_rotation() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.scheduler().unschedule("default");

        let report = f.manager.audit().unwrap();
        assert!(report.is_healthy());
        assert!(report.due().is_empty());

        let schedule = f.manager.scheduler().schedule_for("default").unwrap();
        assert_eq!(schedule.next_rotation_at, f.clock.now() + Duration::days(90));
    }

    #[test]
    fn test_retire_expired_destroys_deprecated_version() {
        let f = fixture();
        let v1 = f.manager.ensure_key("default", "records").unwrap();
        let legacy = encrypt("CH93 0076 2011 6238 5295 7", &v1).unwrap();
        f.manager.rotate("default").unwrap();

        assert!(f.manager.retire_expired().unwrap().is_empty());

        f.clock.advance(Duration::days(DEFAULT_RETENTION_DAYS + 1));
        let retired = f.manager.retire_expired().unwrap();
        assert_eq!(retired, vec![("default".to_string(), 1)]);

        let err = decrypt(&legacy, resolver(&f)).unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(f.manager.stats().unwrap().backups, 0);
        assert_eq!(f.manager.stats().unwrap().count(KeyStatus::Destroyed), 1);
    }

    #[test]
    fn test_revoke_active_then_rotate_rekeys() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.revoke("default", 1, "suspected leak").unwrap();

        assert!(matches!(
            f.manager.store().active_material("default"),
            Err(FinguardError::UnknownKey(_))
        ));
        assert!(f.manager.scheduler().schedule_for("default").is_none());

        let result = f.manager.rotate("default").unwrap();
        assert_eq!(result.to, 2);
        assert_eq!(f.manager.store().active_material("default").unwrap().version(), 2);
        assert_eq!(f.log.alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_recover_lost_version_from_backup() {
        let f = fixture();
        let v1 = f.manager.ensure_key("default", "records").unwrap();
        let legacy = encrypt("jean@example.ch", &v1).unwrap();
        f.manager.rotate("default").unwrap();

        // Provider loses v1
        f.manager.store().provider().destroy_key("default", 1).unwrap();
        f.manager.store().invalidate("default", 1);
        assert!(decrypt(&legacy, resolver(&f)).is_err());

        let recovered = f.manager.recover_from_backup("default", 1).unwrap();
        assert_eq!(recovered.status(), KeyStatus::Deprecated);
        assert_eq!(
            decrypt(&legacy, resolver(&f)).unwrap(),
            "jean@example.ch"
        );
    }

    #[test]
    fn test_recover_refuses_live_version() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.rotate("default").unwrap();
        f.manager.rotate("default").unwrap();

        // v2 was backed up when v3 took over; v3 is live and has no backup
        assert!(f.manager.recover_from_backup("default", 3).is_err());
        assert!(f.manager.recover_from_backup("default", 2).is_ok());
    }

    #[test]
    fn test_concurrent_rotations_serialize_per_key() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.ensure_key("documents", "records").unwrap();

        let handles: Vec<_> = ["default", "default", "documents", "documents"]
            .into_iter()
            .map(|key_id| {
                let manager = Arc::clone(&f.manager);
                thread::spawn(move || manager.rotate(key_id).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for key_id in ["default", "documents"] {
            let versions = f.manager.store().versions(key_id).unwrap();
            assert_eq!(versions.len(), 3);
            let active: Vec<_> = versions
                .iter()
                .filter(|m| m.status == KeyStatus::Active)
                .collect();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].version, 3);
        }
    }

    #[test]
    fn test_stats() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.ensure_key("documents", "records").unwrap();
        f.manager.rotate("default").unwrap();

        let stats = f.manager.stats().unwrap();
        assert_eq!(stats.total_versions, 3);
        assert_eq!(stats.count(KeyStatus::Active), 2);
        assert_eq!(stats.count(KeyStatus::Deprecated), 1);
        assert_eq!(stats.backups, 1);
        assert_eq!(stats.upcoming_rotations.len(), 2);
        assert!(stats.upcoming_rotations[0].next_rotation_at <= stats.upcoming_rotations[1].next_rotation_at);
    }

    #[test]
    fn test_ticker_runs_due_rotations() {
        let f = fixture();
        f.manager.ensure_key("default", "records").unwrap();
        f.manager.scheduler().schedule_now("default", 1, f.clock.now());

        let mut handle = f
            .manager
            .spawn_ticker(std::time::Duration::from_millis(5))
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while f.manager.store().versions("default").unwrap().len() < 2
            && std::time::Instant::now() < deadline
        {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        handle.stop();

        assert_eq!(f.manager.store().versions("default").unwrap().len(), 2);
    }
}
