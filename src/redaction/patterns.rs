//! Ordered detection table for free text
//!
//! Detection is regex-based and best-effort: a miss is not an error, it is
//! what the residual validation pass exists to catch. Earlier entries win
//! when matches overlap, and text already inside a placeholder is never
//! matched again.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::Category;

/// What a detection pattern recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Swiss social security number (AHV/AVS)
    Ahv,
    Iban,
    Email,
    Phone,
    Amount,
    Date,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::Ahv => "AHV",
            PatternKind::Iban => "IBAN",
            PatternKind::Email => "EMAIL",
            PatternKind::Phone => "PHONE",
            PatternKind::Amount => "AMOUNT",
            PatternKind::Date => "DATE",
        }
    }

    /// Placeholder category used when this kind is redacted
    pub fn category(self) -> Category {
        match self {
            PatternKind::Ahv | PatternKind::Iban => Category::Identifier,
            PatternKind::Email | PatternKind::Phone => Category::Contact,
            PatternKind::Amount => Category::Amount,
            PatternKind::Date => Category::Date,
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Swiss number form: 1'250.50, 120.-, 15250
const NUMBER: &str = r"\d+(?:['’]\d{3})*(?:[.,]\d{1,2}|\.-)?";

lazy_static! {
    static ref AHV_REGEX: Regex =
        Regex::new(r"\b756[.\s]?\d{4}[.\s]?\d{4}[.\s]?\d{2}\b").expect("valid AHV pattern");
    static ref IBAN_REGEX: Regex =
        Regex::new(r"\b[A-Z]{2}\d{2}(?:\s?[A-Z0-9]{4}){3,7}(?:\s?[A-Z0-9]{1,4})?\b")
            .expect("valid IBAN pattern");
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b").expect("valid email pattern");
    static ref PHONE_REGEX: Regex =
        Regex::new(r"(?:\+41|\b0041|\b0)\s?(?:\(0\)\s?)?\d{2}\s?\d{3}\s?\d{2}\s?\d{2}\b")
            .expect("valid phone pattern");
    static ref AMOUNT_REGEX: Regex = Regex::new(&format!(
        r"(?:(?:\b(?:CHF|EUR|USD)|\bFr\.|€|\$)\s?{n})|(?:\b{n}\s?(?:(?:CHF|EUR|USD)\b|Fr\.|€))",
        n = NUMBER
    ))
    .expect("valid amount pattern");
    static ref DATE_REGEX: Regex =
        Regex::new(r"\b(?:0?[1-9]|[12]\d|3[01])\.(?:0?[1-9]|1[0-2])\.(?:19|20)\d{2}\b")
            .expect("valid date pattern");

    /// Placeholder issued by a redaction session: `[CATEGORY_hash]`
    pub(crate) static ref PLACEHOLDER_REGEX: Regex =
        Regex::new(r"\[(?:NAME|ADDRESS|AMOUNT|ID|DATE|CONTACT|REDACTED)_[0-9a-f]{8,64}\]")
            .expect("valid placeholder pattern");

    static ref TABLE: Vec<(PatternKind, &'static Regex)> = vec![
        (PatternKind::Ahv, &*AHV_REGEX),
        (PatternKind::Iban, &*IBAN_REGEX),
        (PatternKind::Email, &*EMAIL_REGEX),
        (PatternKind::Phone, &*PHONE_REGEX),
        (PatternKind::Amount, &*AMOUNT_REGEX),
        (PatternKind::Date, &*DATE_REGEX),
    ];
}

/// One match of the detection table, as byte offsets into the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub kind: PatternKind,
    pub start: usize,
    pub end: usize,
}

impl Detection {
    pub fn category(&self) -> Category {
        self.kind.category()
    }

    pub fn as_str<'t>(&self, text: &'t str) -> &'t str {
        &text[self.start..self.end]
    }
}

/// Byte spans of every placeholder in `text`
pub fn placeholder_spans(text: &str) -> Vec<(usize, usize)> {
    PLACEHOLDER_REGEX
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect()
}

/// Whether `text` is exactly one placeholder
pub fn is_placeholder(text: &str) -> bool {
    PLACEHOLDER_REGEX
        .find(text)
        .map_or(false, |m| m.start() == 0 && m.end() == text.len())
}

fn overlaps_any(start: usize, end: usize, spans: &[(usize, usize)]) -> bool {
    spans.iter().any(|(s, e)| start < *e && end > *s)
}

/// Run the table over `text`, returning non-overlapping detections in text order
pub fn detect(text: &str) -> Vec<Detection> {
    let mut taken = placeholder_spans(text);
    let mut found = Vec::new();

    for (kind, regex) in TABLE.iter() {
        for m in regex.find_iter(text) {
            if m.start() >= m.end() || overlaps_any(m.start(), m.end(), &taken) {
                continue;
            }
            taken.push((m.start(), m.end()));
            found.push(Detection {
                kind: *kind,
                start: m.start(),
                end: m.end(),
            });
        }
    }

    found.sort_by_key(|d| d.start);
    found
}

/// Replace every detection in `text` with whatever `replace` returns for it
pub fn replace_detections<F>(text: &str, mut replace: F) -> (String, usize)
where
    F: FnMut(&Detection, &str) -> String,
{
    let detections = detect(text);
    if detections.is_empty() {
        return (text.to_string(), 0);
    }

    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    for detection in &detections {
        output.push_str(&text[cursor..detection.start]);
        output.push_str(&replace(detection, detection.as_str(text)));
        cursor = detection.end;
    }
    output.push_str(&text[cursor..]);

    (output, detections.len())
}
