//! Tension records: a pair of opposing concepts plus how that opposition resolved.
//!
//! Defaulting happens once here, at construction. Every other module reads
//! typed fields and never guesses.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PHASE_WEIGHT, DEFAULT_SCAR, MIN_POLE_LEN, PAIR_SEPARATOR};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollapseDirection {
    TowardA,
    TowardB,
    Balanced,
    #[default]
    Unknown,
}

impl CollapseDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TowardA => "toward_a",
            Self::TowardB => "toward_b",
            Self::Balanced => "balanced",
            Self::Unknown => "unknown",
        }
    }

    /// Unrecognized values become `Unknown`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "toward_a" | "a" => Self::TowardA,
            "toward_b" | "b" => Self::TowardB,
            "balanced" => Self::Balanced,
            _ => Self::Unknown,
        }
    }

    /// The same direction seen from the other end of the pair.
    pub fn flipped(self) -> Self {
        match self {
            Self::TowardA => Self::TowardB,
            Self::TowardB => Self::TowardA,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifePhase {
    Early,
    Mid,
    Late,
    #[default]
    Unknown,
}

impl LifePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Early => "early",
            Self::Mid => "mid",
            Self::Late => "late",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "early" => Self::Early,
            "mid" | "middle" => Self::Mid,
            "late" => Self::Late,
            _ => Self::Unknown,
        }
    }
}

/// Trim and lowercase a pole label. Pair identity is always computed on this form.
pub fn normalize_pole(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Both labels at least three characters after normalization, and not equal ignoring case.
pub fn valid_pair(pole_a: &str, pole_b: &str) -> bool {
    let a = normalize_pole(pole_a);
    let b = normalize_pole(pole_b);
    a.chars().count() >= MIN_POLE_LEN && b.chars().count() >= MIN_POLE_LEN && a != b
}

/// Unordered identity of a pole pair: normalized labels, lexicographically sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub low: String,
    pub high: String,
}

impl PairKey {
    pub fn new(pole_a: &str, pole_b: &str) -> Self {
        let a = normalize_pole(pole_a);
        let b = normalize_pole(pole_b);
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// True when `pole_a` sorts after `pole_b`, i.e. the tension's own
    /// "toward_a" points at the key's `high` side.
    pub fn is_flipped(pole_a: &str, pole_b: &str) -> bool {
        normalize_pole(pole_a) > normalize_pole(pole_b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tension {
    pub id: String,
    pub pole_a: String,
    pub pole_b: String,
    #[serde(default)]
    pub context_snippet: String,
    #[serde(default)]
    pub source_label: String,
    #[serde(default)]
    pub collapse_direction: CollapseDirection,
    #[serde(default = "default_scar")]
    pub scar_valence: f64,
    #[serde(default)]
    pub refusal: bool,
    #[serde(default)]
    pub refusal_count: u32,
    #[serde(default)]
    pub life_phase: LifePhase,
    #[serde(default = "default_phase_weight")]
    pub life_phase_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_inner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_outer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_scar() -> f64 {
    DEFAULT_SCAR
}

fn default_phase_weight() -> f64 {
    DEFAULT_PHASE_WEIGHT
}

impl Tension {
    /// A tension with the heuristic-extraction defaults. Returns `None` for
    /// pairs that violate the pole invariants.
    pub fn new(id: impl Into<String>, pole_a: &str, pole_b: &str) -> Option<Self> {
        if !valid_pair(pole_a, pole_b) {
            return None;
        }
        Some(Self {
            id: id.into(),
            pole_a: pole_a.trim().to_string(),
            pole_b: pole_b.trim().to_string(),
            context_snippet: String::new(),
            source_label: String::new(),
            collapse_direction: CollapseDirection::Unknown,
            scar_valence: DEFAULT_SCAR,
            refusal: false,
            refusal_count: 0,
            life_phase: LifePhase::Unknown,
            life_phase_weight: DEFAULT_PHASE_WEIGHT,
            mask_inner: None,
            mask_outer: None,
            summary: None,
            embedding: None,
        })
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_snippet = context.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_label = source.into();
        self
    }

    pub fn with_scar(mut self, scar: f64) -> Self {
        self.scar_valence = clamp_unit(scar);
        self
    }

    pub fn with_phase(mut self, phase: LifePhase, weight: f64) -> Self {
        self.life_phase = phase;
        self.life_phase_weight = clamp_unit(weight);
        self
    }

    pub fn with_direction(mut self, direction: CollapseDirection) -> Self {
        self.collapse_direction = direction;
        self
    }

    pub fn with_refusal(mut self, refusal: bool, count: u32) -> Self {
        self.refusal = refusal;
        self.refusal_count = count;
        self
    }

    pub fn with_masks(mut self, inner: Option<String>, outer: Option<String>) -> Self {
        self.mask_inner = inner;
        self.mask_outer = outer;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Re-apply the range invariants after deserializing from an untrusted source.
    pub fn normalized(mut self) -> Self {
        self.scar_valence = clamp_unit(self.scar_valence);
        self.life_phase_weight = clamp_unit(self.life_phase_weight);
        self
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.pole_a, &self.pole_b)
    }

    /// Passage text used to embed this pair.
    pub fn pair_text(&self) -> String {
        pair_text(&self.pole_a, &self.pole_b)
    }

    /// Copy without the vector, for responses where it is only noise.
    pub fn without_embedding(&self) -> Self {
        Self {
            embedding: None,
            ..self.clone()
        }
    }
}

pub fn pair_text(pole_a: &str, pole_b: &str) -> String {
    format!("{pole_a} {PAIR_SEPARATOR} {pole_b}")
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pair_rejects_short_and_equal() {
        assert!(valid_pair("duty", "desire"));
        assert!(!valid_pair("ok", "desire"));
        assert!(!valid_pair("Duty", "duty"));
        assert!(!valid_pair("  duty ", "DUTY"));
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(PairKey::new("Duty", "desire"), PairKey::new("desire", "duty"));
        assert!(PairKey::is_flipped("duty", "desire"));
        assert!(!PairKey::is_flipped("desire", "duty"));
    }

    #[test]
    fn test_construction_clamps_once() {
        let t = Tension::new("t1", "duty", "desire")
            .unwrap()
            .with_scar(1.7)
            .with_phase(LifePhase::Late, -0.2);
        assert_eq!(t.scar_valence, 1.0);
        assert_eq!(t.life_phase_weight, 0.0);
    }

    #[test]
    fn test_defaults() {
        let t = Tension::new("t1", "duty", "desire").unwrap();
        assert_eq!(t.scar_valence, 0.5);
        assert_eq!(t.life_phase_weight, 0.5);
        assert_eq!(t.collapse_direction, CollapseDirection::Unknown);
        assert_eq!(t.life_phase, LifePhase::Unknown);
        assert!(!t.refusal);
        assert_eq!(t.refusal_count, 0);
    }

    #[test]
    fn test_lossy_parsing() {
        assert_eq!(CollapseDirection::from_str_lossy("Balanced"), CollapseDirection::Balanced);
        assert_eq!(CollapseDirection::from_str_lossy("sideways"), CollapseDirection::Unknown);
        assert_eq!(LifePhase::from_str_lossy("middle"), LifePhase::Mid);
        assert_eq!(LifePhase::from_str_lossy(""), LifePhase::Unknown);
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let t: Tension =
            serde_json::from_str(r#"{"id":"x","pole_a":"duty","pole_b":"desire"}"#).unwrap();
        assert_eq!(t.scar_valence, 0.5);
        assert_eq!(t.collapse_direction, CollapseDirection::Unknown);
        assert!(t.embedding.is_none());
    }

    #[test]
    fn test_pair_text() {
        assert_eq!(pair_text("duty", "desire"), "duty [VS] desire");
    }
}
