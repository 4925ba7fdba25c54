//! Tension retrieval-and-refusal engine.
//!
//! Extracts opposing concept pairs ("tensions") from text, ranks them for a
//! query with a hybrid vector/signal score, folds them into a concept graph,
//! and decides whether the retrieved context permits an answer.
//!
//! Zero I/O. Embedding, search and generation arrive through the traits in
//! [`collab`]; persistence and transport live in other crates.

pub mod chunk;
pub mod collab;
pub mod compose;
pub mod constants;
pub mod error;
pub mod extract;
pub mod gate;
pub mod graph;
pub mod index;
pub mod kernel;
pub mod pack;
pub mod pipeline;
pub mod poles;
pub mod retrieve;
pub mod score;
pub mod segment;
pub mod settings;
pub mod tension;

pub use chunk::Chunk;
pub use collab::{
    ChunkHit, EmbedRole, Embedder, Framing, Generator, HashingEmbedder, KnowledgeBase,
    MemoryKnowledgeBase, TensionHit,
};
pub use compose::{Answer, ComposeMethod, ComposeTrace, compose_answer, compose_template};
pub use error::{CoreError, CoreResult, Upstream};
pub use extract::{CandidatePair, PatternId, extract_pairs, tag_masks};
pub use gate::{GateConfig, GateDecision, GatePolicy, PolicyKind, Refusal, RefusalReason};
pub use graph::{GraphEdge, GraphNode, TensionGraph, aggregate, direction_bias};
pub use index::{FlatIndex, Neighbor, VectorIndex, cosine_distance};
pub use kernel::KernelProfile;
pub use pack::{ContextPack, ScoredChunk};
pub use pipeline::{PreparedDocument, QueryOutcome, prepare_document, respond};
pub use poles::{PoleDef, PoleLexicon, detect_poles};
pub use retrieve::{RetrievalConfig, Retriever};
pub use score::{HybridScorer, ScoredTension, WeightConfig, score, vector_similarity};
pub use segment::{Segmenter, clean_text, segment};
pub use settings::Settings;
pub use tension::{CollapseDirection, LifePhase, PairKey, Tension};
