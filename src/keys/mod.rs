//! Versioned key management
//!
//! - `material`: key metadata, lifecycle states, and the `KeyResolver` seam
//! - `provider`: pluggable key-material backing store
//! - `store`: TTL-cached resolution of `(key id, version)`
//! - `backup`: encrypted backups of outgoing versions
//! - `rotation`: the rotation state machine
//! - `scheduler`: rotation schedules and deferred jobs
//! - `lifecycle`: audit, rotation, retirement, revocation and recovery

pub mod backup;
pub mod lifecycle;
pub mod material;
pub mod provider;
pub mod rotation;
pub mod scheduler;
pub mod store;

pub use backup::{KeyBackup, KeyBackupVault, DEFAULT_RETENTION_DAYS};
pub use lifecycle::{
    AuditReport, KeyHealth, KeyLifecycleManager, KeyStats, RotationOutcome, RotationPolicy,
    INTEGRITY_CANARY,
};
pub use material::{KeyMaterial, KeyMetadata, KeyResolver, KeyStatus, AES_256_GCM};
pub use provider::{KeyProvider, LocalKeyProvider, TimeoutProvider};
pub use rotation::{RotationPhase, RotationResult, RotationWorkflow};
pub use scheduler::{
    spawn_ticker, RotationSchedule, RotationScheduler, ScheduledRotation, TickerHandle,
    DEFAULT_ROTATION_INTERVAL_DAYS,
};
pub use store::KeyMaterialStore;
