//! Audit entry data structures
//!
//! Defines security event kinds, severities and the entry format itself.
//! Entries carry key references and session ids, never raw values or key
//! bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Security-relevant events that are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A first key version was bootstrapped
    KeyCreated,
    /// A key version passed its rotation date
    KeyDue,
    /// A rotation committed
    KeyRotated,
    /// A rotation failed and was rolled back
    RotationFailed,
    /// A scheduled rotation found the key already rotated
    RotationSkipped,
    /// A key version was revoked
    KeyRevoked,
    /// A key version was destroyed
    KeyDestroyed,
    /// A key version was restored from its backup
    KeyRecovered,
    /// The canary self-test failed
    IntegrityCheckFailed,
    /// A marked record field did not hold an encrypted field
    NonConformingField,
    /// A redaction session was opened
    SessionCreated,
    /// A redaction session was closed or expired
    SessionEnded,
}

impl std::fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SecurityEvent::KeyCreated => "KEY_CREATED",
            SecurityEvent::KeyDue => "KEY_DUE",
            SecurityEvent::KeyRotated => "KEY_ROTATED",
            SecurityEvent::RotationFailed => "ROTATION_FAILED",
            SecurityEvent::RotationSkipped => "ROTATION_SKIPPED",
            SecurityEvent::KeyRevoked => "KEY_REVOKED",
            SecurityEvent::KeyDestroyed => "KEY_DESTROYED",
            SecurityEvent::KeyRecovered => "KEY_RECOVERED",
            SecurityEvent::IntegrityCheckFailed => "INTEGRITY_CHECK_FAILED",
            SecurityEvent::NonConformingField => "NON_CONFORMING_FIELD",
            SecurityEvent::SessionCreated => "SESSION_CREATED",
            SecurityEvent::SessionEnded => "SESSION_ENDED",
        };
        write!(f, "{}", label)
    }
}

/// How urgently an entry needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    /// Operator alert
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Critical => write!(f, "CRIT"),
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event occurred (UTC)
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub event: SecurityEvent,

    pub severity: Severity,

    /// Key id involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// Key version involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,

    /// Redaction session involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Free-form detail; must not contain sensitive values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    /// Create an entry stamped with the current time
    pub fn new(event: SecurityEvent, severity: Severity) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            severity,
            key_id: None,
            key_version: None,
            session_id: None,
            detail: None,
        }
    }

    pub fn info(event: SecurityEvent) -> Self {
        Self::new(event, Severity::Info)
    }

    pub fn warning(event: SecurityEvent) -> Self {
        Self::new(event, Severity::Warning)
    }

    pub fn critical(event: SecurityEvent) -> Self {
        Self::new(event, Severity::Critical)
    }

    /// Attach a key reference
    pub fn with_key(mut self, key_id: impl Into<String>, version: u32) -> Self {
        self.key_id = Some(key_id.into());
        self.key_version = Some(version);
        self
    }

    /// Attach a key id without a version
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Override the timestamp (entries produced under a virtual clock)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Format the entry for human-readable output
    pub fn format_human_readable(&self) -> String {
        let mut output = format!(
            "[{}] {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.severity,
            self.event
        );

        match (&self.key_id, self.key_version) {
            (Some(key_id), Some(version)) => output.push_str(&format!(" {} v{}", key_id, version)),
            (Some(key_id), None) => output.push_str(&format!(" {}", key_id)),
            _ => {}
        }

        if let Some(session) = &self.session_id {
            output.push_str(&format!(" session={}", session));
        }

        if let Some(detail) = &self.detail {
            output.push_str(&format!("\n  {}", detail));
        }

        output
    }
}
