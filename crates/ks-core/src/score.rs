//! Hybrid relevance scoring.
//!
//! ```text
//! score = w_pair      * similarity
//!       + w_scarPhase * scar_valence * life_phase_weight
//!       + w_refusal   * (1.2 if refusal else 1.0)
//!       + w_bias      * (1.1 if balanced else 1.0)
//!      [+ w_mask      if a query mask matches the tension's masks]
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collab::TensionHit;
use crate::constants::{BALANCED_BOOST, REFUSAL_BOOST, WEIGHT_EPSILON};
use crate::error::{CoreError, CoreResult};
use crate::tension::{CollapseDirection, Tension};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub pair: f64,
    pub scar_phase: f64,
    pub refusal: f64,
    pub bias: f64,
    /// Only contributes when the query names masks.
    pub mask: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            pair: 0.32,
            scar_phase: 0.14,
            refusal: 0.10,
            bias: 0.10,
            mask: 0.06,
        }
    }
}

impl WeightConfig {
    /// Each weight in [0,1], total at most 1. Never clamps.
    pub fn validate(&self) -> CoreResult<()> {
        let named = [
            ("pair", self.pair),
            ("scar_phase", self.scar_phase),
            ("refusal", self.refusal),
            ("bias", self.bias),
            ("mask", self.mask),
        ];
        for (name, w) in named {
            if !(0.0..=1.0).contains(&w) {
                return Err(CoreError::config(format!(
                    "weight '{name}' must be within [0, 1], got {w}"
                )));
            }
        }
        let total: f64 = named.iter().map(|(_, w)| w).sum();
        if total > 1.0 + WEIGHT_EPSILON {
            return Err(CoreError::config(format!(
                "weights must sum to at most 1, got {total:.4}"
            )));
        }
        Ok(())
    }
}

/// Distance of a search hit, or `MissingEmbedding` when the hit has no
/// usable vector.
pub(crate) fn hit_distance(id: &str, has_vector: bool, distance: Option<f64>) -> CoreResult<f64> {
    match distance {
        Some(d) if has_vector && d.is_finite() => Ok(d),
        _ => Err(CoreError::MissingEmbedding { id: id.to_string() }),
    }
}

/// `1 / (1 + distance)`: identical vectors give 1.
pub fn vector_similarity(distance: f64) -> f64 {
    1.0 / (1.0 + distance.max(0.0))
}

pub fn score(tension: &Tension, similarity: f64, weights: &WeightConfig) -> f64 {
    let refusal = if tension.refusal { REFUSAL_BOOST } else { 1.0 };
    let bias = if tension.collapse_direction == CollapseDirection::Balanced {
        BALANCED_BOOST
    } else {
        1.0
    };
    weights.pair * similarity
        + weights.scar_phase * tension.scar_valence * tension.life_phase_weight
        + weights.refusal * refusal
        + weights.bias * bias
}

fn mask_matches(tension: &Tension, masks: &[String]) -> bool {
    [&tension.mask_inner, &tension.mask_outer]
        .into_iter()
        .flatten()
        .any(|m| masks.iter().any(|q| q.eq_ignore_ascii_case(m.trim())))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTension {
    pub tension: Tension,
    pub score: f64,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub scored: Vec<ScoredTension>,
    /// Candidates dropped for lack of an embedding.
    pub excluded: usize,
}

#[derive(Debug, Clone)]
pub struct HybridScorer {
    weights: WeightConfig,
    masks: Vec<String>,
}

impl HybridScorer {
    pub fn new(weights: WeightConfig) -> CoreResult<Self> {
        weights.validate()?;
        Ok(Self {
            weights,
            masks: Vec::new(),
        })
    }

    pub fn with_masks(mut self, masks: &[String]) -> Self {
        self.masks = masks
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        self
    }

    pub fn weights(&self) -> &WeightConfig {
        &self.weights
    }

    pub fn score(&self, tension: &Tension, similarity: f64) -> f64 {
        let base = score(tension, similarity, &self.weights);
        if !self.masks.is_empty() && mask_matches(tension, &self.masks) {
            base + self.weights.mask
        } else {
            base
        }
    }

    /// Score and sort descending. Stable: equal scores keep retrieval order.
    /// A candidate without an embedding is excluded, not scored as dissimilar.
    pub fn rank(&self, hits: Vec<TensionHit>) -> Ranking {
        let mut ranking = Ranking::default();
        for hit in hits {
            let has_vector = hit.tension.embedding.is_some();
            let distance = match hit_distance(&hit.tension.id, has_vector, hit.distance) {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "excluding tension");
                    ranking.excluded += 1;
                    continue;
                }
            };
            let similarity = vector_similarity(distance);
            let score = self.score(&hit.tension, similarity);
            ranking.scored.push(ScoredTension {
                tension: hit.tension,
                score,
                similarity,
            });
        }
        ranking.scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tension(id: &str) -> Tension {
        Tension::new(id, "duty", "desire")
            .unwrap()
            .with_embedding(vec![1.0, 0.0])
    }

    fn hit(t: Tension, distance: f64) -> TensionHit {
        TensionHit {
            tension: t,
            distance: Some(distance),
        }
    }

    #[test]
    fn test_default_weights_valid() {
        assert!(WeightConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let over = WeightConfig {
            pair: 0.9,
            ..WeightConfig::default()
        };
        assert!(matches!(over.validate(), Err(CoreError::Config(_))));
        let negative = WeightConfig {
            bias: -0.1,
            ..WeightConfig::default()
        };
        assert!(HybridScorer::new(negative).is_err());
    }

    #[test]
    fn test_similarity() {
        assert_relative_eq!(vector_similarity(0.0), 1.0);
        assert_relative_eq!(vector_similarity(1.0), 0.5);
    }

    #[test]
    fn test_formula() {
        let t = tension("t").with_scar(0.8).with_refusal(true, 0);
        let w = WeightConfig::default();
        let expected = 0.32 * 0.5 + 0.14 * 0.8 * 0.5 + 0.10 * 1.2 + 0.10;
        assert_relative_eq!(score(&t, 0.5, &w), expected, epsilon = 1e-12);

        let balanced = tension("b").with_direction(CollapseDirection::Balanced);
        let expected = 0.32 + 0.14 * 0.25 + 0.10 + 0.10 * 1.1;
        assert_relative_eq!(score(&balanced, 1.0, &w), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_higher_similarity_ranks_first() {
        let scorer = HybridScorer::new(WeightConfig::default()).unwrap();
        // similarity 0.1 and 0.9 expressed as distances
        let low = hit(tension("low"), 1.0 / 0.1 - 1.0);
        let high = hit(tension("high"), 1.0 / 0.9 - 1.0);
        let ranking = scorer.rank(vec![low, high]);
        assert_eq!(ranking.scored[0].tension.id, "high");
        assert!(ranking.scored[0].score > ranking.scored[1].score);
    }

    #[test]
    fn test_ties_keep_retrieval_order() {
        let scorer = HybridScorer::new(WeightConfig::default()).unwrap();
        let ranking = scorer.rank(vec![
            hit(tension("first"), 0.3),
            hit(tension("second"), 0.3),
            hit(tension("third"), 0.3),
        ]);
        let ids: Vec<_> = ranking.scored.iter().map(|s| s.tension.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_missing_embedding_excluded_not_zeroed() {
        let scorer = HybridScorer::new(WeightConfig::default()).unwrap();
        let bare = Tension::new("bare", "law", "mercy").unwrap();
        let ranking = scorer.rank(vec![
            hit(bare, 0.0),
            TensionHit {
                tension: tension("nodist"),
                distance: None,
            },
            hit(tension("ok"), 0.5),
        ]);
        assert_eq!(ranking.excluded, 2);
        assert_eq!(ranking.scored.len(), 1);
        assert_eq!(ranking.scored[0].tension.id, "ok");
    }

    #[test]
    fn test_mask_term_only_with_query_masks() {
        let t = tension("m").with_masks(Some("Control".into()), None);
        let plain = HybridScorer::new(WeightConfig::default()).unwrap();
        let masked = plain.clone().with_masks(&["control".to_string()]);
        assert_relative_eq!(masked.score(&t, 0.5) - plain.score(&t, 0.5), 0.06, epsilon = 1e-12);
        let other = plain.clone().with_masks(&["desire".to_string()]);
        assert_relative_eq!(other.score(&t, 0.5), plain.score(&t, 0.5));
    }
}
