//! Lexical contradiction extraction.
//!
//! A best-effort signal generator, not a parser. False positives are expected
//! and absorbed downstream by aggregation and scoring; duplicates across
//! patterns are emitted as-is.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::constants::CONTEXT_RADIUS;
use crate::tension::valid_pair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternId {
    Versus,
    Or,
    Between,
    But,
}

impl PatternId {
    /// Application order.
    pub const ALL: [PatternId; 4] = [Self::Versus, Self::Or, Self::Between, Self::But];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Versus => "versus",
            Self::Or => "or",
            Self::Between => "between",
            Self::But => "but",
        }
    }

    fn regex(&self) -> &'static Regex {
        match self {
            Self::Versus => &VERSUS,
            Self::Or => &OR,
            Self::Between => &BETWEEN,
            Self::But => &BUT,
        }
    }
}

static VERSUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\w+)\s+vs\.?\s+(\w+)").unwrap());
static OR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(\w+)\s+or\s+(\w+)").unwrap());
static BETWEEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbetween\s+(\w+)\s+and\s+(\w+)").unwrap());
static BUT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(\w+)\s+but\s+(\w+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub pole_a: String,
    pub pole_b: String,
    pub context: String,
    pub pattern: PatternId,
}

/// Scan `text` with every pattern in order and emit each surviving match.
/// Poles are lowercased; pairs with a short or repeated pole are dropped.
pub fn extract_pairs(text: &str) -> Vec<CandidatePair> {
    let mut out = Vec::new();
    for pattern in PatternId::ALL {
        for caps in pattern.regex().captures_iter(text) {
            let (Some(whole), Some(a), Some(b)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            let pole_a = a.as_str().to_lowercase();
            let pole_b = b.as_str().to_lowercase();
            if !valid_pair(&pole_a, &pole_b) {
                continue;
            }
            out.push(CandidatePair {
                pole_a,
                pole_b,
                context: context_window(text, whole.start(), whole.end(), CONTEXT_RADIUS),
                pattern,
            });
        }
    }
    out
}

/// Up to `radius` characters either side of `[start, end)`, trimmed.
/// Counts chars, not bytes, so multibyte text never splits.
fn context_window(text: &str, start: usize, end: usize, radius: usize) -> String {
    let from = if radius == 0 {
        start
    } else {
        text[..start]
            .char_indices()
            .rev()
            .nth(radius - 1)
            .map(|(i, _)| i)
            .unwrap_or(0)
    };
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());
    text[from..to].trim().to_string()
}

/// Mask lexicon: label, keywords. Order is tag order.
pub const MASKS: &[(&str, &[&str])] = &[
    (
        "control",
        &["power", "empire", "command", "duty", "rule", "govern", "order", "discipline"],
    ),
    (
        "knowledge",
        &["wisdom", "truth", "philosophy", "reason", "logos", "nature", "universe"],
    ),
    ("utility", &["useful", "practical", "function", "work", "action", "deed"]),
    (
        "authenticity",
        &["true", "genuine", "self", "character", "virtue", "soul"],
    ),
    ("desire", &["want", "pleasure", "pain", "passion", "emotion", "impulse"]),
];

/// Masks whose keywords occur in `text` (case-insensitive substring), each once.
pub fn tag_masks(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    MASKS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(mask, _)| mask.to_string())
        .collect()
}
