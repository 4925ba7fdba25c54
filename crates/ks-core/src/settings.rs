use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::gate::GateConfig;
use crate::poles::{PoleDef, PoleLexicon};
use crate::retrieve::RetrievalConfig;
use crate::score::WeightConfig;
use crate::segment::{SegmentConfig, Segmenter};

/// Engine settings. Every field has a default, so an empty document is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub segment: SegmentConfig,
    pub weights: WeightConfig,
    pub gate: GateConfig,
    pub retrieval: RetrievalConfig,
    /// Replaces the built-in pole lexicon when non-empty.
    pub poles: Vec<PoleDef>,
}

impl Settings {
    /// Reject invalid values. Nothing is clamped.
    pub fn validate(&self) -> CoreResult<()> {
        Segmenter::from_config(&self.segment)?;
        self.weights.validate()?;
        self.gate.validate()?;
        self.retrieval.validate()?;
        Ok(())
    }

    pub fn lexicon(&self) -> PoleLexicon {
        if self.poles.is_empty() {
            PoleLexicon::default()
        } else {
            PoleLexicon::new(self.poles.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_defaults_validate() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.segment.window, 1200);
        assert_eq!(s.segment.overlap, 150);
        assert_eq!(s.retrieval.top_k, 10);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"weights":{"pair":0.5},"gate":{"policy":"strictness"}}"#).unwrap();
        assert_eq!(s.weights.pair, 0.5);
        assert_eq!(s.weights.scar_phase, 0.14);
        assert_eq!(s.gate.strictness, 0.8);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut s = Settings::default();
        s.segment.overlap = 1200;
        assert!(matches!(s.validate(), Err(CoreError::Config(_))));

        let mut s = Settings::default();
        s.retrieval.top_k = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.gate.extreme_scar_threshold = 2.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_custom_poles_replace_builtin() {
        let s = Settings {
            poles: vec![PoleDef::new("sea", &["ocean"])],
            ..Settings::default()
        };
        assert_eq!(s.lexicon().detect("justice by the ocean"), vec!["sea"]);
    }
}
