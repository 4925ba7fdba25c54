//! Ingest preparation and the query path, wired from the pure pieces.

use serde::Serialize;
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::collab::{EmbedRole, Embedder, Generator};
use crate::compose::{Answer, ComposeMethod, ComposeTrace, compose_answer, refusal_text};
use crate::error::CoreResult;
use crate::extract::{extract_pairs, tag_masks};
use crate::gate::{GateDecision, GatePolicy, Refusal};
use crate::kernel::KernelProfile;
use crate::pack::ContextPack;
use crate::retrieve::Retriever;
use crate::segment::{Segmenter, clean_text};
use crate::tension::Tension;

/// One document, cleaned, segmented, tagged, extracted and embedded.
/// Nothing is persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    pub source: String,
    pub chunks: Vec<Chunk>,
    pub tensions: Vec<Tension>,
}

pub fn prepare_document(
    source: &str,
    raw_text: &str,
    segmenter: &Segmenter,
    embedder: &dyn Embedder,
) -> CoreResult<PreparedDocument> {
    let text = clean_text(raw_text);

    let windows = segmenter.segment(&text);
    let window_refs: Vec<&str> = windows.iter().map(String::as_str).collect();
    let chunk_vecs = if window_refs.is_empty() {
        Vec::new()
    } else {
        embedder.embed_batch(&window_refs, EmbedRole::Passage)?
    };
    let chunks: Vec<Chunk> = windows
        .iter()
        .zip(chunk_vecs)
        .map(|(w, v)| {
            Chunk::new(new_id(), w.clone(), source)
                .with_tags(tag_masks(w))
                .with_embedding(v)
        })
        .collect();

    let candidates = extract_pairs(&text);
    let pair_texts: Vec<String> = candidates
        .iter()
        .map(|c| crate::tension::pair_text(&c.pole_a, &c.pole_b))
        .collect();
    let pair_refs: Vec<&str> = pair_texts.iter().map(String::as_str).collect();
    let pair_vecs = if pair_refs.is_empty() {
        Vec::new()
    } else {
        embedder.embed_batch(&pair_refs, EmbedRole::Passage)?
    };
    let tensions: Vec<Tension> = candidates
        .into_iter()
        .zip(pair_vecs)
        .filter_map(|(c, v)| {
            Tension::new(new_id(), &c.pole_a, &c.pole_b).map(|t| {
                t.with_context(c.context)
                    .with_source(source)
                    .with_embedding(v)
            })
        })
        .collect();

    Ok(PreparedDocument {
        source: source.to_string(),
        chunks,
        tensions,
    })
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub refused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Refusal>,
    pub trace: ComposeTrace,
    #[serde(skip)]
    pub pack: ContextPack,
}

impl QueryOutcome {
    /// Ids of retrieved tensions flagged as refusals; these accumulate
    /// refusal history when the query is refused.
    pub fn refusal_tension_ids(&self) -> Vec<String> {
        self.pack
            .tensions
            .iter()
            .filter(|s| s.tension.refusal)
            .map(|s| s.tension.id.clone())
            .collect()
    }
}

/// Retrieve, gate, compose. Refusals are successful outcomes.
pub fn respond(
    retriever: &Retriever<'_>,
    gate: &GatePolicy,
    profile: &KernelProfile,
    query: &str,
    masks: &[String],
    generator: Option<&dyn Generator>,
) -> CoreResult<QueryOutcome> {
    let pack = retriever.retrieve(&profile.id, query, masks)?;
    match gate.evaluate(&pack) {
        GateDecision::Refuse(refusal) => Ok(QueryOutcome {
            answer: refusal_text(&refusal),
            refused: true,
            trace: ComposeTrace {
                method: ComposeMethod::Template,
                generator: None,
                poles: pack.poles.clone(),
                tensions_used: pack.tensions.len(),
                chunks_used: pack.chunks.len(),
                fallback_reason: None,
            },
            refusal: Some(refusal),
            pack,
        }),
        GateDecision::Continue => {
            let Answer { text, trace } = compose_answer(profile, &pack, generator)?;
            Ok(QueryOutcome {
                answer: text,
                refused: false,
                refusal: None,
                trace,
                pack,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HashingEmbedder, MemoryKnowledgeBase};
    use crate::gate::{RefusalReason, RuleGate};
    use crate::poles::PoleLexicon;
    use crate::retrieve::RetrievalConfig;
    use crate::score::{HybridScorer, WeightConfig};

    #[test]
    fn test_prepare_document() {
        let e = HashingEmbedder::new(32).unwrap();
        let seg = Segmenter::new(5, 1).unwrap();
        let doc = prepare_document(
            "letters.txt",
            "1  The conflict between duty and desire consumed him. Power or wisdom?",
            &seg,
            &e,
        )
        .unwrap();
        assert_eq!(doc.chunks.len(), 3);
        assert!(doc.chunks.iter().all(|c| c.embedding.is_some() && c.source_label == "letters.txt"));
        assert!(doc.chunks[0].tags.contains(&"control".to_string()));
        let pairs: Vec<_> = doc.tensions.iter().map(|t| (t.pole_a.as_str(), t.pole_b.as_str())).collect();
        assert!(pairs.contains(&("duty", "desire")));
        assert!(pairs.contains(&("power", "wisdom")));
        assert!(doc.tensions.iter().all(|t| t.scar_valence == 0.5 && t.embedding.is_some()));
    }

    #[test]
    fn test_prepare_empty_document() {
        let e = HashingEmbedder::new(32).unwrap();
        let doc = prepare_document("x", "   ", &Segmenter::default(), &e).unwrap();
        assert!(doc.chunks.is_empty());
        assert!(doc.tensions.is_empty());
    }

    #[test]
    fn test_respond_refuses_on_empty_corpus() {
        let e = HashingEmbedder::default();
        let kb = MemoryKnowledgeBase::new();
        let lex = PoleLexicon::default();
        let scorer = HybridScorer::new(WeightConfig::default()).unwrap();
        let r = Retriever::new(&e, &kb, &lex, scorer, RetrievalConfig::default()).unwrap();
        let gate = GatePolicy::Rules(RuleGate::default());
        let out = respond(&r, &gate, &KernelProfile::new("k", "M"), "duty?", &[], None).unwrap();
        assert!(out.refused);
        assert_eq!(out.refusal.as_ref().map(|r| r.reason), Some(RefusalReason::InsufficientContext));
        assert!(out.answer.starts_with("Ω_clear: "));
    }
}
