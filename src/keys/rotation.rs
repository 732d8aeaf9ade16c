//! Key rotation as an explicit state machine
//!
//! ```text
//! Prepared → NewKeyStored → OutgoingBackedUp → Committed
//!     └───────────┴──────────────┴──→ RolledBack
//! ```
//!
//! The active pointer only flips in [`RotationWorkflow::commit`], after the
//! outgoing version is backed up. [`RotationWorkflow::rollback`] undoes
//! whatever steps completed and can be called repeatedly; a step whose undo
//! fails stays marked so the next call retries it.

use chrono::{DateTime, Duration, Utc};

use crate::error::{FinguardError, FinguardResult};

use super::backup::KeyBackupVault;
use super::material::{KeyMaterial, KeyMetadata, KeyStatus};
use super::store::KeyMaterialStore;

/// Where a rotation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Outgoing version resolved, nothing written yet
    Prepared,
    /// Incoming version persisted as pending
    NewKeyStored,
    /// Outgoing version backed up
    OutgoingBackedUp,
    /// Outgoing deprecated, incoming active
    Committed,
    /// Every completed step undone
    RolledBack,
}

/// Result of a committed rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    pub key_id: String,
    pub from: u32,
    pub to: u32,
    /// When the new version is due for rotation
    pub next_rotation_at: DateTime<Utc>,
}

/// One rotation of one key id
pub struct RotationWorkflow<'a> {
    store: &'a KeyMaterialStore,
    backups: &'a KeyBackupVault,
    key_id: String,
    now: DateTime<Utc>,
    outgoing: KeyMaterial,
    incoming: Option<KeyMaterial>,
    phase: RotationPhase,
    new_stored: bool,
    backup_taken: bool,
    outgoing_demoted: bool,
}

impl<'a> RotationWorkflow<'a> {
    /// Resolve the current version of `key_id` from the provider
    pub fn prepare(
        store: &'a KeyMaterialStore,
        backups: &'a KeyBackupVault,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> FinguardResult<Self> {
        // Read through to the provider, not a possibly stale cache
        store.invalidate_key(key_id);
        let outgoing = store.active_material(key_id)?;

        Ok(Self {
            store,
            backups,
            key_id: key_id.to_string(),
            now,
            outgoing: (*outgoing).clone(),
            incoming: None,
            phase: RotationPhase::Prepared,
            new_stored: false,
            backup_taken: false,
            outgoing_demoted: false,
        })
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    /// Version being rotated out
    pub fn outgoing_version(&self) -> u32 {
        self.outgoing.version()
    }

    /// Version being rotated in, once generated
    pub fn incoming_version(&self) -> Option<u32> {
        self.incoming.as_ref().map(|m| m.version())
    }

    fn expect_phase(&self, expected: RotationPhase) -> FinguardResult<()> {
        if self.phase != expected {
            return Err(FinguardError::rotation_failed(
                self.key_id.clone(),
                format!("expected phase {:?}, found {:?}", expected, self.phase),
            ));
        }
        Ok(())
    }

    /// Step 1: generate the next version and persist it as pending
    pub fn store_new_key(&mut self, interval: Duration) -> FinguardResult<()> {
        self.expect_phase(RotationPhase::Prepared)?;

        let next_version = self
            .store
            .versions(&self.key_id)?
            .iter()
            .map(|meta| meta.version)
            .max()
            .unwrap_or(0)
            + 1;

        let material = self.store.provider().generate_key(
            &self.key_id,
            next_version,
            &self.outgoing.metadata().purpose,
            self.now,
            Some(self.now + interval),
        )?;

        // Marked before the call: a timed-out store may still land
        self.new_stored = true;
        self.incoming = Some(material.clone());
        self.store.provider().store_key(&material)?;

        self.phase = RotationPhase::NewKeyStored;
        Ok(())
    }

    /// Step 2: back up the outgoing version under the backup key
    pub fn backup_outgoing(&mut self) -> FinguardResult<()> {
        self.expect_phase(RotationPhase::NewKeyStored)?;

        self.backups.backup(&self.outgoing, self.now)?;
        self.backup_taken = true;

        self.phase = RotationPhase::OutgoingBackedUp;
        Ok(())
    }

    /// Step 3: deprecate the outgoing version and activate the incoming one
    pub fn commit(&mut self) -> FinguardResult<RotationResult> {
        self.expect_phase(RotationPhase::OutgoingBackedUp)?;

        let mut incoming = match &self.incoming {
            Some(material) => material.metadata().clone(),
            None => {
                return Err(FinguardError::rotation_failed(
                    self.key_id.clone(),
                    "no incoming version",
                ))
            }
        };

        let mut outgoing = self.outgoing.metadata().clone();
        outgoing.transition(KeyStatus::Deprecated, self.now)?;
        self.store.provider().update_metadata(&outgoing)?;
        self.outgoing_demoted = true;

        incoming.transition(KeyStatus::Active, self.now)?;
        self.store.provider().update_metadata(&incoming)?;

        self.store.invalidate(&self.key_id, outgoing.version);
        self.store.invalidate(&self.key_id, incoming.version);
        self.store.set_active(&self.key_id, incoming.version);

        self.phase = RotationPhase::Committed;
        Ok(RotationResult {
            key_id: self.key_id.clone(),
            from: outgoing.version,
            to: incoming.version,
            next_rotation_at: incoming.expires_at.unwrap_or(self.now),
        })
    }

    /// Undo every completed step; safe to call more than once
    ///
    /// Leaves the outgoing version `active`. Fails on a committed rotation.
    pub fn rollback(&mut self) -> FinguardResult<()> {
        match self.phase {
            RotationPhase::Committed => {
                return Err(FinguardError::rotation_failed(
                    self.key_id.clone(),
                    "cannot roll back a committed rotation",
                ))
            }
            RotationPhase::RolledBack
                if !(self.new_stored || self.backup_taken || self.outgoing_demoted) =>
            {
                return Ok(())
            }
            _ => {}
        }

        let mut first_error = None;

        if self.new_stored {
            if let Some(version) = self.incoming_version() {
                match self.store.provider().destroy_key(&self.key_id, version) {
                    Ok(()) | Err(FinguardError::UnknownKeyVersion { .. }) => {
                        self.store.invalidate(&self.key_id, version);
                        self.new_stored = false;
                    }
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            } else {
                self.new_stored = false;
            }
        }

        if self.backup_taken {
            match self.backups.remove(&self.key_id, self.outgoing.version()) {
                Ok(_) => self.backup_taken = false,
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        // Also covers an outgoing version the audit had marked rotating
        let restored = self.restored_outgoing();
        if self.outgoing_demoted || self.outgoing.status() != KeyStatus::Active {
            match self.store.provider().update_metadata(&restored) {
                Ok(()) => self.outgoing_demoted = false,
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        self.store.invalidate_key(&self.key_id);
        self.phase = RotationPhase::RolledBack;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn restored_outgoing(&self) -> KeyMetadata {
        let mut metadata = self.outgoing.metadata().clone();
        if metadata.status != KeyStatus::Active {
            metadata.status = KeyStatus::Active;
            metadata.status_changed_at = Some(self.now);
        }
        metadata
    }

    /// Run every step, rolling back on the first failure
    pub fn run(mut self, interval: Duration) -> FinguardResult<RotationResult> {
        let outcome = self
            .store_new_key(interval)
            .and_then(|_| self.backup_outgoing())
            .and_then(|_| self.commit());

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                let reason = match self.rollback() {
                    Ok(()) => e.to_string(),
                    Err(rollback_err) => format!("{}; rollback incomplete: {}", e, rollback_err),
                };
                Err(FinguardError::rotation_failed(self.key_id.clone(), reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::{decrypt, encrypt};
    use crate::keys::backup::test_vault;
    use crate::keys::provider::{test_provider, KeyProvider, LocalKeyProvider};
    use crate::keys::KeyResolver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Provider that refuses to activate versions above 1 while armed
    struct FailingPromotion {
        inner: LocalKeyProvider,
        armed: AtomicBool,
    }

    impl KeyProvider for FailingPromotion {
        fn load_key(&self, key_id: &str, version: u32) -> FinguardResult<KeyMaterial> {
            self.inner.load_key(key_id, version)
        }
        fn store_key(&self, material: &KeyMaterial) -> FinguardResult<()> {
            self.inner.store_key(material)
        }
        fn update_metadata(&self, metadata: &KeyMetadata) -> FinguardResult<()> {
            if self.armed.load(Ordering::SeqCst)
                && metadata.version > 1
                && metadata.status == KeyStatus::Active
            {
                return Err(FinguardError::KeyStoreUnavailable("injected".into()));
            }
            self.inner.update_metadata(metadata)
        }
        fn list_keys(&self) -> FinguardResult<Vec<KeyMetadata>> {
            self.inner.list_keys()
        }
        fn destroy_key(&self, key_id: &str, version: u32) -> FinguardResult<()> {
            self.inner.destroy_key(key_id, version)
        }
        fn generate_key(
            &self,
            key_id: &str,
            version: u32,
            purpose: &str,
            created_at: DateTime<Utc>,
            expires_at: Option<DateTime<Utc>>,
        ) -> FinguardResult<KeyMaterial> {
            self.inner
                .generate_key(key_id, version, purpose, created_at, expires_at)
        }
    }

    fn bootstrap(provider: &dyn KeyProvider) {
        let material = provider
            .generate_key("default", 1, "records", Utc::now(), None)
            .unwrap();
        let mut meta = material.metadata().clone();
        meta.transition(KeyStatus::Active, Utc::now()).unwrap();
        provider.store_key(&material.with_metadata(meta)).unwrap();
    }

    fn store_with(provider: Arc<dyn KeyProvider>) -> KeyMaterialStore {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        KeyMaterialStore::new(provider, clock, Duration::seconds(300))
    }

    #[test]
    fn test_rotation_commits() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        bootstrap(provider.as_ref());
        let store = store_with(provider);
        let backups = test_vault();

        let legacy = encrypt("CH93 0076 2011 6238 5295 7", &store.active_material("default").unwrap()).unwrap();

        let workflow = RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        let result = workflow.run(Duration::days(90)).unwrap();
        assert_eq!((result.from, result.to), (1, 2));

        let active = store.active_material("default").unwrap();
        assert_eq!(active.version(), 2);
        assert_eq!(store.resolve("default", 1).unwrap().status(), KeyStatus::Deprecated);
        assert_eq!(backups.count(), 1);

        assert_eq!(decrypt(&legacy, &store).unwrap(), "CH93 0076 2011 6238 5295 7");
        assert_eq!(encrypt("x", &active).unwrap().key_version, 2);
    }

    #[test]
    fn test_failed_promotion_rolls_back() {
        let failing = Arc::new(FailingPromotion {
            inner: test_provider(),
            armed: AtomicBool::new(true),
        });
        bootstrap(failing.as_ref());
        let store = store_with(failing.clone());
        let backups = test_vault();

        let workflow = RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        let err = workflow.run(Duration::days(90)).unwrap_err();
        assert!(matches!(err, FinguardError::RotationFailed { .. }));

        // v1 active again, v2 destroyed, backup purged
        assert_eq!(store.active_material("default").unwrap().version(), 1);
        assert!(store.get_material("default", 2).unwrap_err().is_permanent());
        assert_eq!(backups.count(), 0);

        // A later rotation succeeds with the next free version
        failing.armed.store(false, Ordering::SeqCst);
        let workflow = RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        assert_eq!(workflow.run(Duration::days(90)).unwrap().to, 3);
    }

    #[test]
    fn test_failed_backup_rolls_back() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        let backups = crate::keys::backup::KeyBackupVault::with_file(
            &crate::crypto::SecureString::new("test-backup-secret-0123456789"),
            &crate::crypto::SecureString::new("test-salt-0001"),
            &crate::crypto::key_derivation::test_params(),
            30,
            blocker.join("backups.json"),
        )
        .unwrap();

        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        bootstrap(provider.as_ref());
        let store = store_with(provider);

        let workflow = RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        assert!(workflow.run(Duration::days(90)).is_err());
        assert_eq!(store.active_material("default").unwrap().version(), 1);
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        bootstrap(provider.as_ref());
        let store = store_with(provider);
        let backups = test_vault();

        let mut workflow =
            RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        workflow.store_new_key(Duration::days(90)).unwrap();
        workflow.backup_outgoing().unwrap();
        assert_eq!(workflow.phase(), RotationPhase::OutgoingBackedUp);

        workflow.rollback().unwrap();
        workflow.rollback().unwrap();
        assert_eq!(workflow.phase(), RotationPhase::RolledBack);
        assert_eq!(store.active_material("default").unwrap().version(), 1);
        assert_eq!(backups.count(), 0);
    }

    #[test]
    fn test_steps_out_of_order_are_rejected() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        bootstrap(provider.as_ref());
        let store = store_with(provider);
        let backups = test_vault();

        let mut workflow =
            RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        assert!(workflow.backup_outgoing().is_err());
        assert!(workflow.commit().is_err());
    }

    #[test]
    fn test_committed_rotation_cannot_roll_back() {
        let provider: Arc<dyn KeyProvider> = Arc::new(test_provider());
        bootstrap(provider.as_ref());
        let store = store_with(provider);
        let backups = test_vault();

        let mut workflow =
            RotationWorkflow::prepare(&store, &backups, "default", Utc::now()).unwrap();
        workflow.store_new_key(Duration::days(90)).unwrap();
        workflow.backup_outgoing().unwrap();
        workflow.commit().unwrap();
        assert!(workflow.rollback().is_err());
    }
}
