//! finguard - confidential-data redaction and encryption for personal-finance records
//!
//! This library protects the personal and financial data of a Swiss
//! personal-finance product on two paths:
//!
//! - content sent to an external reasoning service is redacted into typed,
//!   session-scoped placeholders and restored in the response
//! - records written to storage have their sensitive fields encrypted with
//!   versioned, rotated keys
//!
//! # Architecture
//!
//! - `crypto`: AES-256-GCM field encryption and Argon2id key derivation
//! - `keys`: key material store, providers, backups, rotation and lifecycle
//! - `mapper`: schema-driven field encryption of JSON records
//! - `redaction`: detection patterns, sessions, the redaction engine
//! - `schema`: declarative field sensitivity rules
//! - `audit`: append-only security event log
//! - `config`: paths, settings and environment secrets
//! - `storage`: atomic JSON persistence
//! - `vault`: the [`Finguard`] facade wiring everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use finguard::{FieldRule, FieldSchema, Finguard};
//! use finguard::schema::Category;
//!
//! let schema = FieldSchema::new()
//!     .with_rule(FieldRule::new("ahv")?.encrypted().anonymized(Category::Identifier));
//! let fg = Finguard::from_env(schema)?;
//!
//! let stored = fg.encrypt_record(&record)?;
//! let outgoing = fg.redact_text("Contact me at jean@example.ch", "advice", "user-1")?;
//! let answer = fg.restore(&response, outgoing.session_id)?;
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod mapper;
pub mod redaction;
pub mod schema;
pub mod storage;
pub mod vault;

pub use error::{FinguardError, FinguardResult};
pub use mapper::RecordEncryptionMapper;
pub use redaction::{RedactionEngine, SessionId};
pub use schema::{FieldRule, FieldSchema};
pub use vault::{Finguard, FinguardBuilder};
