use serde::Serialize;

use crate::chunk::Chunk;
use crate::score::ScoredTension;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f64,
}

/// Everything retrieved for one query. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextPack {
    pub query: String,
    pub poles: Vec<String>,
    pub tensions: Vec<ScoredTension>,
    pub chunks: Vec<ScoredChunk>,
    /// Candidates skipped because they had no embedding.
    pub excluded: usize,
}

const MEMORY_PREVIEW_CHARS: usize = 200;

impl ContextPack {
    pub fn new(query: impl Into<String>, poles: Vec<String>) -> Self {
        Self {
            query: query.into(),
            poles,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tensions.is_empty() && self.chunks.is_empty()
    }

    pub fn max_scar(&self) -> Option<f64> {
        self.tensions
            .iter()
            .map(|s| s.tension.scar_valence)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Markdown digest handed to the composer.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.tensions.is_empty() {
            parts.push("## Key Tensions & Contradictions:\n".to_string());
            for (i, s) in self.tensions.iter().enumerate() {
                let t = &s.tension;
                parts.push(format!(
                    "{}. **{} ↔ {}** (collapse: {}, scar: {:.2})",
                    i + 1,
                    t.pole_a,
                    t.pole_b,
                    t.collapse_direction.as_str(),
                    t.scar_valence
                ));
                if let Some(summary) = t.summary.as_deref().filter(|s| !s.is_empty()) {
                    parts.push(format!("   → {summary}"));
                }
                if let (Some(inner), Some(outer)) = (&t.mask_inner, &t.mask_outer) {
                    parts.push(format!("   Masks: {inner} (inner) ↔ {outer} (outer)"));
                }
                parts.push(String::new());
            }
        }

        if !self.chunks.is_empty() {
            parts.push("\n## Relevant Memories:\n".to_string());
            for (i, s) in self.chunks.iter().enumerate() {
                let preview: String = s.chunk.text.chars().take(MEMORY_PREVIEW_CHARS).collect();
                let source = if s.chunk.source_label.is_empty() {
                    "unknown"
                } else {
                    s.chunk.source_label.as_str()
                };
                parts.push(format!("{}. {preview}... (from {source})", i + 1));
                parts.push(String::new());
            }
        }

        parts.join("\n")
    }
}
