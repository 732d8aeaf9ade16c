//! Declarative field schema
//!
//! A schema is a table of `(path pattern, flags)` rules. Both the record
//! encryption mapper and the redaction engine walk records generically and
//! consult the schema; no field names are hardcoded in traversal.
//!
//! Path syntax: dot-separated keys, `*` for any key, `[]` for every array
//! element and `[n]` for one element, e.g. `accounts[].iban`,
//! `household.*.ahv`, `documents[0].owner`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FinguardError, FinguardResult};

/// Kind of sensitive value, selecting the placeholder label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Name,
    Address,
    /// Financial amount
    Amount,
    /// AHV number, IBAN, account or policy numbers
    Identifier,
    Date,
    /// Email address or phone number
    Contact,
    Generic,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Name,
        Category::Address,
        Category::Amount,
        Category::Identifier,
        Category::Date,
        Category::Contact,
        Category::Generic,
    ];

    /// Label embedded in placeholder tokens
    pub fn label(self) -> &'static str {
        match self {
            Category::Name => "NAME",
            Category::Address => "ADDRESS",
            Category::Amount => "AMOUNT",
            Category::Identifier => "ID",
            Category::Date => "DATE",
            Category::Contact => "CONTACT",
            Category::Generic => "REDACTED",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Generic
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One segment of a path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    /// `*`
    AnyKey,
    /// `[]`
    AnyIndex,
    /// `[n]`
    Index(usize),
}

/// One step of a concrete location inside a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

/// Render a concrete location as `a.b[0].c`
pub fn format_path(steps: &[PathStep]) -> String {
    let mut out = String::new();
    for step in steps {
        match step {
            PathStep::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathStep::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}

/// A parsed path pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> FinguardResult<Self> {
        let invalid = |reason: &str| {
            FinguardError::InvalidInput(format!("Invalid field path '{}': {}", raw, reason))
        };

        if raw.trim().is_empty() {
            return Err(invalid("empty"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (name, mut brackets) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            match name {
                "" if brackets.is_empty() => return Err(invalid("empty segment")),
                "" => {}
                "*" => segments.push(Segment::AnyKey),
                key if key.contains(|c: char| c == '*' || c == ']') => return Err(invalid("bad key")),
                key => segments.push(Segment::Key(key.to_string())),
            }

            while !brackets.is_empty() {
                let close = brackets
                    .find(']')
                    .ok_or_else(|| invalid("unclosed bracket"))?;
                let inner = &brackets[1..close];
                if inner.is_empty() {
                    segments.push(Segment::AnyIndex);
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| invalid("bad array index"))?;
                    segments.push(Segment::Index(index));
                }
                brackets = &brackets[close + 1..];
                if !brackets.is_empty() && !brackets.starts_with('[') {
                    return Err(invalid("text after bracket"));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the pattern matches exactly this location
    pub fn matches(&self, steps: &[PathStep]) -> bool {
        self.segments.len() == steps.len()
            && self
                .segments
                .iter()
                .zip(steps)
                .all(|(segment, step)| match (segment, step) {
                    (Segment::Key(expected), PathStep::Key(key)) => expected == key,
                    (Segment::AnyKey, PathStep::Key(_)) => true,
                    (Segment::AnyIndex, PathStep::Index(_)) => true,
                    (Segment::Index(expected), PathStep::Index(i)) => expected == i,
                    _ => false,
                })
    }

    /// Call `f` for every present value the pattern selects
    ///
    /// Only the branches the pattern names are visited.
    pub fn for_each_match_mut<F>(&self, value: &mut Value, mut f: F)
    where
        F: FnMut(&[PathStep], &mut Value),
    {
        let mut trail = Vec::new();
        visit_mut(value, &self.segments, &mut trail, &mut f);
    }

    /// Locations of every present value the pattern selects
    pub fn collect_matches(&self, value: &Value) -> Vec<Vec<PathStep>> {
        let mut found = Vec::new();
        let mut trail = Vec::new();
        visit(value, &self.segments, &mut trail, &mut found);
        found
    }
}

fn visit_mut(
    value: &mut Value,
    segments: &[Segment],
    trail: &mut Vec<PathStep>,
    f: &mut dyn FnMut(&[PathStep], &mut Value),
) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => {
            f(trail, value);
            return;
        }
    };

    match (segment, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(child) = map.get_mut(key) {
                trail.push(PathStep::Key(key.clone()));
                visit_mut(child, rest, trail, f);
                trail.pop();
            }
        }
        (Segment::AnyKey, Value::Object(map)) => {
            for (key, child) in map.iter_mut() {
                trail.push(PathStep::Key(key.clone()));
                visit_mut(child, rest, trail, f);
                trail.pop();
            }
        }
        (Segment::AnyIndex, Value::Array(items)) => {
            for (i, child) in items.iter_mut().enumerate() {
                trail.push(PathStep::Index(i));
                visit_mut(child, rest, trail, f);
                trail.pop();
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(child) = items.get_mut(*i) {
                trail.push(PathStep::Index(*i));
                visit_mut(child, rest, trail, f);
                trail.pop();
            }
        }
        _ => {}
    }
}

fn visit(
    value: &Value,
    segments: &[Segment],
    trail: &mut Vec<PathStep>,
    found: &mut Vec<Vec<PathStep>>,
) {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => {
            found.push(trail.clone());
            return;
        }
    };

    match (segment, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(child) = map.get(key) {
                trail.push(PathStep::Key(key.clone()));
                visit(child, rest, trail, found);
                trail.pop();
            }
        }
        (Segment::AnyKey, Value::Object(map)) => {
            for (key, child) in map {
                trail.push(PathStep::Key(key.clone()));
                visit(child, rest, trail, found);
                trail.pop();
            }
        }
        (Segment::AnyIndex, Value::Array(items)) => {
            for (i, child) in items.iter().enumerate() {
                trail.push(PathStep::Index(i));
                visit(child, rest, trail, found);
                trail.pop();
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(child) = items.get(*i) {
                trail.push(PathStep::Index(*i));
                visit(child, rest, trail, found);
                trail.pop();
            }
        }
        _ => {}
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FinguardError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Sensitivity flags for one path pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub path: FieldPath,
    #[serde(default)]
    pub sensitive: bool,
    /// Replace with placeholders before external calls
    #[serde(default)]
    pub anonymizable: bool,
    /// Encrypt at rest
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub category: Category,
    /// Key id for encryption; the mapper's default key id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl FieldRule {
    /// A rule with no flags set
    pub fn new(path: &str) -> FinguardResult<Self> {
        Ok(Self {
            path: FieldPath::parse(path)?,
            sensitive: false,
            anonymizable: false,
            encrypted: false,
            category: Category::Generic,
            key_id: None,
        })
    }

    /// Mark as sensitive and encrypted at rest
    pub fn encrypted(mut self) -> Self {
        self.sensitive = true;
        self.encrypted = true;
        self
    }

    /// Mark as sensitive and replaced by `category` placeholders
    pub fn anonymized(mut self, category: Category) -> Self {
        self.sensitive = true;
        self.anonymizable = true;
        self.category = category;
        self
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.sensitive && self.encrypted
    }

    pub fn is_anonymized(&self) -> bool {
        self.sensitive && self.anonymizable
    }
}

/// The rule table for one record type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a schema from its JSON form
    pub fn from_json(json: &str) -> FinguardResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FinguardError::InvalidInput(format!("Invalid field schema: {}", e)))
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn encrypted_rules(&self) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter().filter(|r| r.is_encrypted())
    }

    pub fn anonymized_rules(&self) -> impl Iterator<Item = &FieldRule> {
        self.rules.iter().filter(|r| r.is_anonymized())
    }

    /// First anonymization rule matching this location
    pub fn anonymization_rule(&self, steps: &[PathStep]) -> Option<&FieldRule> {
        self.anonymized_rules().find(|r| r.path.matches(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> PathStep {
        PathStep::Key(k.to_string())
    }

    #[test]
    fn test_parse_segments() {
        let path = FieldPath::parse("accounts[].iban").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("accounts".into()),
                Segment::AnyIndex,
                Segment::Key("iban".into())
            ]
        );

        let path = FieldPath::parse("household.*.ahv").unwrap();
        assert_eq!(path.segments()[1], Segment::AnyKey);

        let path = FieldPath::parse("matrix[][2]").unwrap();
        assert_eq!(path.segments()[1..], [Segment::AnyIndex, Segment::Index(2)]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "a..b", "a[", "a[x]", "a[]b", "a]"] {
            assert!(FieldPath::parse(bad).is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn test_matches() {
        let path = FieldPath::parse("accounts[].iban").unwrap();
        assert!(path.matches(&[key("accounts"), PathStep::Index(3), key("iban")]));
        assert!(!path.matches(&[key("accounts"), key("iban")]));
        assert!(!path.matches(&[key("accounts"), PathStep::Index(0)]));

        let any = FieldPath::parse("*.ahv").unwrap();
        assert!(any.matches(&[key("spouse"), key("ahv")]));
    }

    #[test]
    fn test_collect_matches_skips_missing() {
        let record = json!({
            "accounts": [
                {"iban": "CH93 0076 2011 6238 5295 7"},
                {"bank": "UBS"},
                {"iban": null}
            ]
        });
        let path = FieldPath::parse("accounts[].iban").unwrap();
        let found = path.collect_matches(&record);
        assert_eq!(found.len(), 2);
        assert_eq!(format_path(&found[0]), "accounts[0].iban");
        assert_eq!(format_path(&found[1]), "accounts[2].iban");
    }

    #[test]
    fn test_for_each_match_mut() {
        let mut record = json!({"household": {"a": {"ahv": 1}, "b": {"ahv": 2}, "c": {}}});
        let path = FieldPath::parse("household.*.ahv").unwrap();
        path.for_each_match_mut(&mut record, |_, value| *value = json!("x"));
        assert_eq!(record["household"]["a"]["ahv"], "x");
        assert_eq!(record["household"]["b"]["ahv"], "x");
        assert!(record["household"]["c"].get("ahv").is_none());
    }

    #[test]
    fn test_schema_from_json() {
        let schema = FieldSchema::from_json(
            r#"{"rules": [
                {"path": "ahv", "sensitive": true, "encrypted": true, "anonymizable": true, "category": "identifier"},
                {"path": "accounts[].iban", "sensitive": true, "encrypted": true, "key_id": "banking"},
                {"path": "first_name", "sensitive": true, "anonymizable": true, "category": "name"},
                {"path": "canton"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(schema.encrypted_rules().count(), 2);
        assert_eq!(schema.anonymized_rules().count(), 2);
        assert_eq!(schema.rules[1].key_id.as_deref(), Some("banking"));
        assert_eq!(schema.rules[3].category, Category::Generic);

        let rule = schema.anonymization_rule(&[key("first_name")]).unwrap();
        assert_eq!(rule.category, Category::Name);
    }

    #[test]
    fn test_schema_rejects_bad_path() {
        assert!(FieldSchema::from_json(r#"{"rules": [{"path": "a[x]"}]}"#).is_err());
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(Category::Identifier.label(), "ID");
        assert_eq!(Category::Generic.label(), "REDACTED");
        assert_eq!(Category::from_label("CONTACT"), Some(Category::Contact));
        assert_eq!(Category::from_label("EMAIL"), None);
    }
}
