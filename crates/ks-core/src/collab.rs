//! Collaborator seams. The core never constructs a network client; callers
//! inject embedders, generators and knowledge bases through these traits.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::chunk::Chunk;
use crate::constants::DEFAULT_DIMENSIONS;
use crate::error::{CoreError, CoreResult, Upstream};
use crate::index::{FlatIndex, VectorIndex};
use crate::tension::Tension;

/// Whether text is being embedded as a search query or as stored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Query,
    Passage,
}

/// Query/passage prefixes for models trained with them (E5 and friends).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Framing {
    pub use_prefixes: bool,
    pub query_prefix: String,
    pub passage_prefix: String,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            use_prefixes: false,
            query_prefix: "query: ".to_string(),
            passage_prefix: "passage: ".to_string(),
        }
    }
}

impl Framing {
    pub fn apply<'a>(&self, role: EmbedRole, text: &'a str) -> Cow<'a, str> {
        if !self.use_prefixes {
            return Cow::Borrowed(text);
        }
        let prefix = match role {
            EmbedRole::Query => &self.query_prefix,
            EmbedRole::Passage => &self.passage_prefix,
        };
        Cow::Owned(format!("{prefix}{text}"))
    }
}

/// Text to vector. Must be deterministic for identical input and model.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn embed_batch(&self, texts: &[&str], role: EmbedRole) -> CoreResult<Vec<Vec<f32>>>;

    fn embed(&self, text: &str, role: EmbedRole) -> CoreResult<Vec<f32>> {
        self.embed_batch(&[text], role)?
            .pop()
            .ok_or_else(|| CoreError::upstream(Upstream::Embedding, "no vector returned"))
    }
}

/// Optional generative backend for answer composition.
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, system_prompt: &str, user_prompt: &str) -> CoreResult<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensionHit {
    pub tension: Tension,
    /// `None` when the candidate has no vector to compare against.
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub chunk: Chunk,
    pub distance: Option<f64>,
}

/// Read side of a persona's knowledge base. Results come back in ascending
/// distance, ties by insertion order.
pub trait KnowledgeBase {
    fn search_tensions(&self, persona: &str, query: &[f32], limit: usize)
    -> CoreResult<Vec<TensionHit>>;

    fn search_chunks(&self, persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<ChunkHit>>;
}

/// Feature-hashed bag of words, L2-normalised. Works offline and is fully
/// deterministic; similarity tracks shared vocabulary.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> CoreResult<Self> {
        if dimensions == 0 {
            return Err(CoreError::config("embedding dimensions must be at least 1"));
        }
        Ok(Self { dimensions })
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let h = fnv1a(token.as_bytes());
            let slot = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str], _role: EmbedRole) -> CoreResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// In-process knowledge base over flat indexes. Single persona.
#[derive(Debug, Default, Clone)]
pub struct MemoryKnowledgeBase {
    tensions: Vec<Tension>,
    chunks: Vec<Chunk>,
}

impl MemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tension(&mut self, tension: Tension) {
        self.tensions.push(tension);
    }

    pub fn add_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub fn tensions(&self) -> &[Tension] {
        &self.tensions
    }
}

fn nearest<'a, T>(
    items: &'a [T],
    vector: impl Fn(&T) -> Option<&Vec<f32>>,
    query: &[f32],
    limit: usize,
) -> CoreResult<Vec<(&'a T, f64)>> {
    let mut index = FlatIndex::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(v) = vector(item) {
            index.insert(i.to_string(), v.clone())?;
        }
    }
    Ok(index
        .search(query, limit)?
        .into_iter()
        .filter_map(|n| n.id.parse::<usize>().ok().map(|i| (&items[i], n.distance)))
        .collect())
}

impl KnowledgeBase for MemoryKnowledgeBase {
    fn search_tensions(
        &self,
        _persona: &str,
        query: &[f32],
        limit: usize,
    ) -> CoreResult<Vec<TensionHit>> {
        Ok(nearest(&self.tensions, |t| t.embedding.as_ref(), query, limit)?
            .into_iter()
            .map(|(t, d)| TensionHit {
                tension: t.clone(),
                distance: Some(d),
            })
            .collect())
    }

    fn search_chunks(&self, _persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<ChunkHit>> {
        Ok(nearest(&self.chunks, |c| c.embedding.as_ref(), query, limit)?
            .into_iter()
            .map(|(c, d)| ChunkHit {
                chunk: c.clone(),
                distance: Some(d),
            })
            .collect())
    }
}
