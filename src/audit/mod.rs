//! Security audit log for finguard
//!
//! Records key lifecycle events, integrity failures, skipped record fields
//! and redaction session boundaries in an append-only log. Critical entries
//! are the operator alert channel.
//!
//! # Architecture
//!
//! - `AuditEntry`: one event with timestamp, kind, severity and optional key
//!   and session references. Never carries plaintext or key bytes.
//! - `AuditLogger`: writes entries as line-delimited JSON (JSONL), or keeps
//!   them in memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use finguard::audit::{AuditEntry, AuditLogger, SecurityEvent};
//!
//! let logger = AuditLogger::new(audit_log_path);
//! logger.record(
//!     AuditEntry::critical(SecurityEvent::IntegrityCheckFailed)
//!         .with_key("default", 3)
//!         .with_detail("canary round trip failed"),
//! );
//! ```

mod entry;
mod logger;

pub use entry::{AuditEntry, SecurityEvent, Severity};
pub use logger::AuditLogger;
