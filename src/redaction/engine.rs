//! Redaction engine
//!
//! Replaces sensitive values with session placeholders before content goes
//! to the external reasoning service, and puts them back into its response.
//!
//! Records are walked depth-first. A node matched by an anonymization rule
//! has every scalar beneath it replaced by a placeholder of the rule's
//! category. Unmarked strings can additionally be run through the free-text
//! detector.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FinguardResult;
use crate::schema::{format_path, Category, FieldSchema, PathStep};

use super::context::{ContextShape, ContextSummary};
use super::patterns::{self, PatternKind};
use super::session::{AnonymizationSession, SessionId, SessionRegistry};

/// Redacted content plus the session that can restore it
#[derive(Debug, Clone, PartialEq)]
pub struct Redacted<T> {
    pub redacted: T,
    pub session_id: SessionId,
    /// Number of values replaced by placeholders
    pub replacements: usize,
}

/// Leakage risk of a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_findings(count: usize) -> Self {
        match count {
            0 => RiskLevel::Low,
            1..=2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

/// A sensitive-looking value that was not redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualFinding {
    pub kind: PatternKind,
    pub category: Category,
    /// Byte offsets into the validated text
    pub start: usize,
    pub end: usize,
    /// Masked excerpt, never the full value
    pub preview: String,
}

/// Result of a residual leakage check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualReport {
    pub clean: bool,
    pub risk: RiskLevel,
    pub findings: Vec<ResidualFinding>,
}

/// Keep the first two and last two characters, mask the rest
fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

/// Check text for sensitive patterns outside placeholders
///
/// Independent of any session; used as a final gate before content leaves
/// the redaction boundary.
pub fn validate_no_residual_sensitive_data(text: &str) -> ResidualReport {
    let findings: Vec<ResidualFinding> = patterns::detect(text)
        .into_iter()
        .map(|d| ResidualFinding {
            kind: d.kind,
            category: d.category(),
            start: d.start,
            end: d.end,
            preview: mask(d.as_str(text)),
        })
        .collect();

    ResidualReport {
        clean: findings.is_empty(),
        risk: RiskLevel::from_findings(findings.len()),
        findings,
    }
}

/// Detects, replaces and restores sensitive values
pub struct RedactionEngine {
    schema: FieldSchema,
    sessions: Arc<SessionRegistry>,
    scan_free_text: bool,
}

impl RedactionEngine {
    pub fn new(schema: FieldSchema, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            schema,
            sessions,
            scan_free_text: true,
        }
    }

    /// Whether unmarked string fields also go through the text detector
    pub fn with_free_text_scan(mut self, enabled: bool) -> Self {
        self.scan_free_text = enabled;
        self
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Redact a structured record for (user, purpose)
    pub fn redact_record(
        &self,
        record: &Value,
        purpose: &str,
        user_id: &str,
    ) -> FinguardResult<Redacted<Value>> {
        self.sessions.with_current(user_id, purpose, |session| {
            let mut output = record.clone();
            let mut trail = Vec::new();
            let replacements = self.walk(&mut output, &mut trail, session)?;
            Ok(Redacted {
                redacted: output,
                session_id: session.id(),
                replacements,
            })
        })
    }

    /// Redact a free-text message for (user, purpose)
    pub fn redact_text(
        &self,
        text: &str,
        purpose: &str,
        user_id: &str,
    ) -> FinguardResult<Redacted<String>> {
        self.sessions.with_current(user_id, purpose, |session| {
            let (redacted, replacements) = redact_free_text(text, session)?;
            Ok(Redacted {
                redacted,
                session_id: session.id(),
                replacements,
            })
        })
    }

    /// Put original values back into a response
    ///
    /// A missing or expired session is an error, never the unrestored text.
    pub fn restore(&self, text: &str, session_id: SessionId) -> FinguardResult<String> {
        self.sessions
            .with_session(session_id, |session| session.restore_text(text))
    }

    /// Restore every string inside a structured response
    ///
    /// A field holding exactly the placeholder of a number or boolean gets
    /// the original JSON value back, not its text.
    pub fn restore_record(&self, value: &Value, session_id: SessionId) -> FinguardResult<Value> {
        self.sessions.with_session(session_id, |session| {
            let mut output = value.clone();
            restore_value(&mut output, session);
            output
        })
    }

    pub fn validate_no_residual_sensitive_data(&self, text: &str) -> ResidualReport {
        validate_no_residual_sensitive_data(text)
    }

    /// Destroy a session and wipe its mapping
    pub fn end_session(&self, session_id: SessionId) -> bool {
        self.sessions.end(session_id)
    }

    pub fn evict_expired(&self) -> usize {
        self.sessions.evict_expired()
    }

    /// Non-identifying summary of an already redacted record
    pub fn minimize_context(&self, redacted: &Value, shape: &ContextShape) -> ContextSummary {
        shape.summarize(redacted)
    }

    fn walk(
        &self,
        value: &mut Value,
        trail: &mut Vec<PathStep>,
        session: &mut AnonymizationSession,
    ) -> FinguardResult<usize> {
        if !trail.is_empty() {
            if let Some(rule) = self.schema.anonymization_rule(trail) {
                let count = replace_scalars(value, rule.category, session)?;
                if count > 0 {
                    session.record_path(format_path(trail));
                }
                return Ok(count);
            }
        }

        match value {
            Value::Object(map) => {
                let mut count = 0;
                for (key, child) in map.iter_mut() {
                    trail.push(PathStep::Key(key.clone()));
                    let result = self.walk(child, trail, session);
                    trail.pop();
                    count += result?;
                }
                Ok(count)
            }
            Value::Array(items) => {
                let mut count = 0;
                for (i, child) in items.iter_mut().enumerate() {
                    trail.push(PathStep::Index(i));
                    let result = self.walk(child, trail, session);
                    trail.pop();
                    count += result?;
                }
                Ok(count)
            }
            Value::String(text) if self.scan_free_text => {
                let (redacted, count) = redact_free_text(text, session)?;
                if count > 0 {
                    *text = redacted;
                }
                Ok(count)
            }
            _ => Ok(0),
        }
    }
}

/// Replace every scalar under `value` with a placeholder
fn replace_scalars(
    value: &mut Value,
    category: Category,
    session: &mut AnonymizationSession,
) -> FinguardResult<usize> {
    let typed = matches!(value, Value::Number(_) | Value::Bool(_));
    let original = match value {
        Value::Object(map) => {
            let mut count = 0;
            for child in map.values_mut() {
                count += replace_scalars(child, category, session)?;
            }
            return Ok(count);
        }
        Value::Array(items) => {
            let mut count = 0;
            for child in items.iter_mut() {
                count += replace_scalars(child, category, session)?;
            }
            return Ok(count);
        }
        Value::Null => return Ok(0),
        Value::String(s) if patterns::is_placeholder(s) => return Ok(0),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    };

    if original.is_empty() {
        return Ok(0);
    }
    let placeholder = session.tokenize(category, &original)?;
    if typed {
        session.mark_typed(&placeholder);
    }
    *value = Value::String(placeholder);
    Ok(1)
}

fn redact_free_text(
    text: &str,
    session: &mut AnonymizationSession,
) -> FinguardResult<(String, usize)> {
    let mut failure = None;
    let (redacted, count) = patterns::replace_detections(text, |detection, original| {
        match session.tokenize(detection.category(), original) {
            Ok(token) => token,
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
                original.to_string()
            }
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok((redacted, count)),
    }
}

fn restore_value(value: &mut Value, session: &AnonymizationSession) {
    if let Some(original) = value.as_str().and_then(|text| session.typed_original(text)) {
        *value = original;
        return;
    }

    match value {
        Value::String(text) => {
            let restored = session.restore_text(text);
            *text = restored;
        }
        Value::Array(items) => items.iter_mut().for_each(|v| restore_value(v, session)),
        Value::Object(map) => map.values_mut().for_each(|v| restore_value(v, session)),
        _ => {}
    }
}
