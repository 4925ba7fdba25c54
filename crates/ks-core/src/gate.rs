//! Refusal gate.
//!
//! Two policies exist and exactly one evaluates a given pack:
//!
//! - [`GatePolicy::Rules`]: ordered rules, first match wins: empty context,
//!   repeated refusals, extreme intensity.
//! - [`GatePolicy::Strictness`]: empty context, then a continuous refusal
//!   score over the highest-scar refusal tensions compared to a strictness bar.
//!
//! Both are pure: they read the pack and nothing else.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_EXTREME_SCAR, DEFAULT_REFUSAL_COUNT_THRESHOLD, DEFAULT_STRICTNESS, LATE_PHASE_BOOST,
    POLE_OVERLAP_BOOST, STRICTNESS_TOP_N,
};
use crate::error::{CoreError, CoreResult};
use crate::pack::ContextPack;
use crate::tension::{LifePhase, Tension};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    InsufficientContext,
    PriorScars,
    ExtremeCost,
    StrictnessExceeded,
}

impl RefusalReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientContext => "insufficient_context",
            Self::PriorScars => "prior_scars",
            Self::ExtremeCost => "extreme_cost",
            Self::StrictnessExceeded => "strictness_exceeded",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::InsufficientContext => {
                "Insufficient context to respond with integrity. No relevant memories found."
            }
            Self::PriorScars => {
                "This path has been refused multiple times. Prior scars warn against it."
            }
            Self::ExtremeCost => {
                "This tension carries extreme remembered cost. Cannot proceed safely."
            }
            Self::StrictnessExceeded => {
                "This ground is marked by refusal. The remembered cost outweighs an answer."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refusal {
    pub reason: RefusalReason,
    pub code: &'static str,
    pub message: &'static str,
    /// Refusal score, strictness policy only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Refusal {
    fn new(reason: RefusalReason, score: Option<f64>) -> Self {
        Self {
            reason,
            code: reason.code(),
            message: reason.message(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Continue,
    Refuse(Refusal),
}

impl GateDecision {
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refuse(_))
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Self::Refuse(r) => Some(r),
            Self::Continue => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Rules,
    Strictness,
}

/// `[gate]` settings. `policy` unset means: rules for template-only
/// deployments, strictness when a generator is configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub policy: Option<PolicyKind>,
    pub refusal_count_threshold: u32,
    pub extreme_scar_threshold: f64,
    pub strictness: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            policy: None,
            refusal_count_threshold: DEFAULT_REFUSAL_COUNT_THRESHOLD,
            extreme_scar_threshold: DEFAULT_EXTREME_SCAR,
            strictness: DEFAULT_STRICTNESS,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.extreme_scar_threshold) {
            return Err(CoreError::config(format!(
                "extreme_scar_threshold must be within [0, 1], got {}",
                self.extreme_scar_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.strictness) {
            return Err(CoreError::config(format!(
                "strictness must be within [0, 1], got {}",
                self.strictness
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, has_generator: bool) -> PolicyKind {
        self.policy.unwrap_or(if has_generator {
            PolicyKind::Strictness
        } else {
            PolicyKind::Rules
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleGate {
    pub refusal_count_threshold: u32,
    pub extreme_scar_threshold: f64,
}

impl Default for RuleGate {
    fn default() -> Self {
        Self {
            refusal_count_threshold: DEFAULT_REFUSAL_COUNT_THRESHOLD,
            extreme_scar_threshold: DEFAULT_EXTREME_SCAR,
        }
    }
}

impl RuleGate {
    pub fn evaluate(&self, pack: &ContextPack) -> GateDecision {
        if pack.is_empty() {
            return GateDecision::Refuse(Refusal::new(RefusalReason::InsufficientContext, None));
        }
        let repeated = pack
            .tensions
            .iter()
            .any(|s| s.tension.refusal && s.tension.refusal_count > self.refusal_count_threshold);
        if repeated {
            return GateDecision::Refuse(Refusal::new(RefusalReason::PriorScars, None));
        }
        if let Some(max) = pack.max_scar()
            && max > self.extreme_scar_threshold
        {
            return GateDecision::Refuse(Refusal::new(RefusalReason::ExtremeCost, None));
        }
        GateDecision::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrictnessGate {
    pub strictness: f64,
}

impl Default for StrictnessGate {
    fn default() -> Self {
        Self {
            strictness: DEFAULT_STRICTNESS,
        }
    }
}

impl StrictnessGate {
    /// Mean boosted scar over the top refusal tensions, clamped to [0,1].
    pub fn refusal_score(&self, pack: &ContextPack) -> f64 {
        let query = pack.query.to_lowercase();
        let mut refusals: Vec<&Tension> = pack
            .tensions
            .iter()
            .map(|s| &s.tension)
            .filter(|t| t.refusal)
            .collect();
        if refusals.is_empty() {
            return 0.0;
        }
        refusals.sort_by(|a, b| b.scar_valence.total_cmp(&a.scar_valence));
        refusals.truncate(STRICTNESS_TOP_N);

        let total: f64 = refusals
            .iter()
            .map(|t| {
                let hits = [&t.pole_a, &t.pole_b]
                    .iter()
                    .filter(|p| {
                        let p = p.trim().to_lowercase();
                        !p.is_empty() && query.contains(&p)
                    })
                    .count();
                let overlap = 1.0 + POLE_OVERLAP_BOOST * hits as f64;
                let phase = if t.life_phase == LifePhase::Late {
                    1.0 + LATE_PHASE_BOOST * t.life_phase_weight
                } else {
                    1.0
                };
                t.scar_valence * overlap * phase
            })
            .sum();
        (total / refusals.len() as f64).clamp(0.0, 1.0)
    }

    pub fn evaluate(&self, pack: &ContextPack) -> GateDecision {
        if pack.is_empty() {
            return GateDecision::Refuse(Refusal::new(RefusalReason::InsufficientContext, None));
        }
        let score = self.refusal_score(pack);
        if score >= self.strictness {
            GateDecision::Refuse(Refusal::new(RefusalReason::StrictnessExceeded, Some(score)))
        } else {
            GateDecision::Continue
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatePolicy {
    Rules(RuleGate),
    Strictness(StrictnessGate),
}

impl GatePolicy {
    pub fn from_config(config: &GateConfig, has_generator: bool) -> CoreResult<Self> {
        config.validate()?;
        Ok(match config.resolve(has_generator) {
            PolicyKind::Rules => Self::Rules(RuleGate {
                refusal_count_threshold: config.refusal_count_threshold,
                extreme_scar_threshold: config.extreme_scar_threshold,
            }),
            PolicyKind::Strictness => Self::Strictness(StrictnessGate {
                strictness: config.strictness,
            }),
        })
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Rules(_) => PolicyKind::Rules,
            Self::Strictness(_) => PolicyKind::Strictness,
        }
    }

    pub fn evaluate(&self, pack: &ContextPack) -> GateDecision {
        match self {
            Self::Rules(g) => g.evaluate(pack),
            Self::Strictness(g) => g.evaluate(pack),
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::Rules(RuleGate::default())
    }
}
