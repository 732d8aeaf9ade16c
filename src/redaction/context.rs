//! Context minimizer
//!
//! Builds the small fixed-shape summary handed to the reasoning service
//! next to the redacted content: a jurisdiction code, boolean flags and
//! counts. It reads only the anonymized record, so no original value and
//! no session internals can reach it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{FieldPath, PathStep};

use super::patterns;

/// Where the summary fields live in a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub counts: Vec<String>,
}

/// Non-identifying summary of a redacted record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub jurisdiction: Option<String>,
    pub flags: BTreeMap<String, bool>,
    pub counts: BTreeMap<String, usize>,
    /// Placeholders present in the record
    pub redacted_fields: usize,
}

impl ContextShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jurisdiction(mut self, path: impl Into<String>) -> Self {
        self.jurisdiction = Some(path.into());
        self
    }

    pub fn with_flag(mut self, path: impl Into<String>) -> Self {
        self.flags.push(path.into());
        self
    }

    pub fn with_count(mut self, path: impl Into<String>) -> Self {
        self.counts.push(path.into());
        self
    }

    /// Summarize an anonymized record
    ///
    /// Paths that don't parse or don't resolve are left out. Placeholder
    /// values never become a jurisdiction.
    pub fn summarize(&self, redacted: &Value) -> ContextSummary {
        let jurisdiction = self
            .jurisdiction
            .as_deref()
            .and_then(|path| resolve(redacted, path).into_iter().next())
            .and_then(Value::as_str)
            .filter(|code| !code.is_empty() && patterns::placeholder_spans(code).is_empty())
            .map(str::to_string);

        let mut flags = BTreeMap::new();
        for path in &self.flags {
            let values: Vec<bool> = resolve(redacted, path)
                .into_iter()
                .filter_map(Value::as_bool)
                .collect();
            if !values.is_empty() {
                flags.insert(path.clone(), values.into_iter().any(|b| b));
            }
        }

        let mut counts = BTreeMap::new();
        for path in &self.counts {
            let found = resolve(redacted, path);
            if found.is_empty() {
                continue;
            }
            let total: usize = found
                .into_iter()
                .map(|value| match value {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::Null => 0,
                    _ => 1,
                })
                .sum();
            counts.insert(path.clone(), total);
        }

        ContextSummary {
            jurisdiction,
            flags,
            counts,
            redacted_fields: count_placeholders(redacted),
        }
    }
}

fn resolve<'v>(record: &'v Value, raw: &str) -> Vec<&'v Value> {
    let Ok(path) = FieldPath::parse(raw) else {
        return Vec::new();
    };
    let matches = path.collect_matches(record);
    matches
        .iter()
        .filter_map(|steps| lookup(record, steps))
        .collect()
}

fn lookup<'v>(record: &'v Value, steps: &[PathStep]) -> Option<&'v Value> {
    steps.iter().try_fold(record, |node, step| match step {
        PathStep::Key(key) => node.get(key.as_str()),
        PathStep::Index(i) => node.get(*i),
    })
}

fn count_placeholders(value: &Value) -> usize {
    match value {
        Value::String(s) => patterns::placeholder_spans(s).len(),
        Value::Array(items) => items.iter().map(count_placeholders).sum(),
        Value::Object(map) => map.values().map(count_placeholders).sum(),
        _ => 0,
    }
}
