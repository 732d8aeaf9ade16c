//! Reversible redaction for content leaving the process
//!
//! - `patterns`: ordered free-text detection table
//! - `token`: keyed placeholder hashes
//! - `session`: per (user, purpose) reversible mappings
//! - `engine`: record/text redaction, restoration and residual validation
//! - `context`: fixed-shape summaries of redacted records

pub mod context;
pub mod engine;
pub mod patterns;
pub mod session;
pub mod token;

pub use context::{ContextShape, ContextSummary};
pub use engine::{
    validate_no_residual_sensitive_data, Redacted, RedactionEngine, ResidualFinding,
    ResidualReport, RiskLevel,
};
pub use patterns::{Detection, PatternKind};
pub use session::{
    AnonymizationSession, SessionConfig, SessionId, SessionRegistry,
    DEFAULT_CONTEXT_WINDOW_MINUTES, DEFAULT_IDLE_EXPIRY_HOURS,
};
pub use token::DEFAULT_TOKEN_HEX_LEN;
