use serde::{Deserialize, Serialize};

/// One concept label and the keywords that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoleDef {
    pub label: String,
    pub keywords: Vec<String>,
}

impl PoleDef {
    pub fn new(label: &str, keywords: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

const BUILTIN: &[(&str, &[&str])] = &[
    ("justice", &["justice", "fairness", "law", "punishment", "retribution"]),
    ("mercy", &["mercy", "forgive", "compassion", "pardon", "clemency"]),
    ("duty", &["duty", "obligation", "responsib", "service", "honor"]),
    ("desire", &["desire", "want", "pleasure", "passion", "longing"]),
    ("reason", &["reason", "logic", "rational", "wisdom", "thought"]),
    ("emotion", &["emotion", "feeling", "anger", "grief", "fear"]),
    ("freedom", &["freedom", "liberty", "free", "choice", "independen"]),
    ("control", &["control", "power", "command", "order", "discipline"]),
    ("public", &["public", "state", "empire", "society", "citizen"]),
    ("private", &["private", "family", "home", "personal", "solitude"]),
    ("death", &["death", "dying", "mortal", "grave", "loss"]),
];

/// Coarse keyword-to-label lookup used to seed the pair-similarity query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoleLexicon {
    poles: Vec<PoleDef>,
}

impl PoleLexicon {
    pub fn new(poles: Vec<PoleDef>) -> Self {
        let poles = poles
            .into_iter()
            .map(|p| PoleDef {
                label: p.label.trim().to_string(),
                keywords: p.keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            })
            .collect();
        Self { poles }
    }

    pub fn poles(&self) -> &[PoleDef] {
        &self.poles
    }

    /// Labels whose keywords occur in the lowercased query, in definition order, each once.
    pub fn detect(&self, query: &str) -> Vec<String> {
        let lower = query.to_lowercase();
        let mut out: Vec<String> = Vec::new();
        for pole in &self.poles {
            if out.contains(&pole.label) {
                continue;
            }
            if pole.keywords.iter().any(|k| !k.is_empty() && lower.contains(k.as_str())) {
                out.push(pole.label.clone());
            }
        }
        out
    }
}

impl Default for PoleLexicon {
    fn default() -> Self {
        Self {
            poles: BUILTIN.iter().map(|(l, k)| PoleDef::new(l, k)).collect(),
        }
    }
}

/// Detect poles with the built-in lexicon.
pub fn detect_poles(query: &str) -> Vec<String> {
    PoleLexicon::default().detect(query)
}
