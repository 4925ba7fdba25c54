use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::collab::{EmbedRole, Embedder, KnowledgeBase, TensionHit};
use crate::constants::DEFAULT_TOP_K;
use crate::error::{CoreError, CoreResult};
use crate::pack::{ContextPack, ScoredChunk};
use crate::poles::PoleLexicon;
use crate::score::{HybridScorer, hit_distance, vector_similarity};
use crate::tension::pair_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.top_k == 0 {
            return Err(CoreError::config("retrieval top_k must be at least 1"));
        }
        Ok(())
    }
}

/// Query-time assembly of a [`ContextPack`]. Read-only: never writes to the
/// knowledge base, so abandoning a query leaves nothing half-done.
pub struct Retriever<'a> {
    embedder: &'a dyn Embedder,
    kb: &'a dyn KnowledgeBase,
    lexicon: &'a PoleLexicon,
    scorer: HybridScorer,
    top_k: usize,
}

impl<'a> Retriever<'a> {
    pub fn new(
        embedder: &'a dyn Embedder,
        kb: &'a dyn KnowledgeBase,
        lexicon: &'a PoleLexicon,
        scorer: HybridScorer,
        config: RetrievalConfig,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            kb,
            lexicon,
            scorer,
            top_k: config.top_k,
        })
    }

    pub fn retrieve(&self, persona: &str, query: &str, masks: &[String]) -> CoreResult<ContextPack> {
        let poles = self.lexicon.detect(query);
        let query_vec = self.embedder.embed(query, EmbedRole::Query)?;

        let mut hits = self
            .kb
            .search_tensions(persona, &query_vec, self.top_k * 2)?;
        if let [first, second, ..] = poles.as_slice() {
            let pair_vec = self
                .embedder
                .embed(&pair_text(first, second), EmbedRole::Query)?;
            let pair_hits = self
                .kb
                .search_tensions(persona, &pair_vec, self.top_k * 2)?;
            hits = merge_hits(hits, pair_hits);
        }

        let scorer = self.scorer.clone().with_masks(masks);
        let mut ranking = scorer.rank(hits);
        ranking.scored.truncate(self.top_k);

        let mut excluded = ranking.excluded;
        let keep_chunks = (self.top_k / 2).max(1);
        let chunks: Vec<ScoredChunk> = self
            .kb
            .search_chunks(persona, &query_vec, self.top_k)?
            .into_iter()
            .filter_map(|hit| {
                let has_vector = hit.chunk.embedding.is_some();
                match hit_distance(&hit.chunk.id, has_vector, hit.distance) {
                    Ok(d) => Some(ScoredChunk {
                        chunk: hit.chunk,
                        similarity: vector_similarity(d),
                    }),
                    Err(e) => {
                        debug!(error = %e, "excluding chunk");
                        excluded += 1;
                        None
                    }
                }
            })
            .take(keep_chunks)
            .collect();

        debug!(
            persona,
            poles = poles.len(),
            tensions = ranking.scored.len(),
            chunks = chunks.len(),
            excluded,
            "retrieved context"
        );

        Ok(ContextPack {
            query: query.to_string(),
            poles,
            tensions: ranking.scored,
            chunks,
            excluded,
        })
    }
}

/// Union by id. First-seen order wins; a repeated id keeps the smaller distance.
fn merge_hits(primary: Vec<TensionHit>, secondary: Vec<TensionHit>) -> Vec<TensionHit> {
    let mut out: Vec<TensionHit> = Vec::with_capacity(primary.len() + secondary.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for hit in primary.into_iter().chain(secondary) {
        match seen.get(&hit.tension.id) {
            Some(&i) => {
                if let (Some(new), Some(old)) = (hit.distance, out[i].distance)
                    && new < old
                {
                    out[i].distance = Some(new);
                }
            }
            None => {
                seen.insert(hit.tension.id.clone(), out.len());
                out.push(hit);
            }
        }
    }
    out
}
