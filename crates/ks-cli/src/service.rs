//! Synchronous service layer shared by the CLI, the MCP server and the HTTP API.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ks_core::{
    Chunk, ChunkHit, CollapseDirection, CoreError, CoreResult, Embedder, GatePolicy, Generator, HybridScorer,
    KnowledgeBase, PoleLexicon, PolicyKind, PreparedDocument, QueryOutcome, Retriever, Segmenter,
    Settings, Tension, TensionGraph, TensionHit, aggregate, prepare_document, respond,
};
use ks_store::{KernelExport, KernelRecord, KernelStats, Store, StoreError, TensionSignal};

#[derive(Debug)]
pub enum ServiceError {
    NotFound(String),
    Invalid(String),
    Upstream(String),
    Internal(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Invalid(msg) => write!(f, "invalid request: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Config(msg) => Self::Invalid(msg),
            e if e.is_upstream() => Self::Upstream(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidData(msg) => Self::Invalid(msg),
            StoreError::Core(inner) => inner.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Strict parse of a user-supplied direction; typos are rejected rather
/// than read as `unknown`.
pub fn parse_direction(raw: &str) -> ServiceResult<CollapseDirection> {
    let direction = CollapseDirection::from_str_lossy(raw);
    if direction == CollapseDirection::Unknown && !raw.trim().eq_ignore_ascii_case("unknown") {
        return Err(ServiceError::Invalid(format!(
            "unknown collapse direction '{raw}' (expected toward_a, toward_b, balanced or unknown)"
        )));
    }
    Ok(direction)
}

/// One text document to ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Source label, usually the file name.
    pub name: String,
    pub text: String,
}

impl Document {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub name: String,
    pub chunks: usize,
    pub tensions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub kernel_id: String,
    pub documents: Vec<DocumentReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedDocument>,
    pub stats: KernelStats,
}

/// Locks the store per search so retrieval never holds it across an embed call.
struct SharedStore<'a>(&'a Mutex<Store>);

impl KnowledgeBase for SharedStore<'_> {
    fn search_tensions(&self, persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<TensionHit>> {
        Ok(lock(self.0).search_tensions(persona, query, limit)?)
    }

    fn search_chunks(&self, persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<ChunkHit>> {
        Ok(lock(self.0).search_chunks(persona, query, limit)?)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct KernelService {
    store: Mutex<Store>,
    embedder: Box<dyn Embedder>,
    generator: Option<Box<dyn Generator>>,
    settings: Settings,
    segmenter: Segmenter,
    lexicon: PoleLexicon,
    gate: GatePolicy,
    graph_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    workers: usize,
}

impl KernelService {
    pub fn new(
        store: Store,
        embedder: Box<dyn Embedder>,
        generator: Option<Box<dyn Generator>>,
        settings: Settings,
    ) -> ServiceResult<Self> {
        settings.validate()?;
        let segmenter = Segmenter::from_config(&settings.segment)?;
        let gate = GatePolicy::from_config(&settings.gate, generator.is_some())?;
        let workers = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        info!(policy = ?gate.kind(), workers, "kernel service ready");
        Ok(Self {
            store: Mutex::new(store),
            lexicon: settings.lexicon(),
            embedder,
            generator,
            settings,
            segmenter,
            gate,
            graph_locks: Mutex::new(HashMap::new()),
            workers,
        })
    }

    /// Cap the ingest pool. Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn policy(&self) -> PolicyKind {
        self.gate.kind()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        lock(&self.store)
    }

    fn graph_lock(&self, kernel_id: &str) -> Arc<Mutex<()>> {
        lock(&self.graph_locks)
            .entry(kernel_id.to_string())
            .or_default()
            .clone()
    }

    // --- Kernels ---

    pub fn create_kernel(&self, name: &str, bio: &str, era: &str) -> ServiceResult<KernelRecord> {
        let record = self.store().create_kernel(name, bio, era)?;
        info!(id = %record.profile.id, name = %record.profile.name, "created kernel");
        Ok(record)
    }

    pub fn list_kernels(&self) -> ServiceResult<Vec<KernelRecord>> {
        Ok(self.store().list_kernels()?)
    }

    pub fn get_kernel(&self, kernel_id: &str) -> ServiceResult<KernelRecord> {
        Ok(self.store().require_kernel(kernel_id)?)
    }

    pub fn delete_kernel(&self, kernel_id: &str) -> ServiceResult<()> {
        let guard = self.graph_lock(kernel_id);
        let _held = lock(&guard);
        if !self.store().delete_kernel(kernel_id)? {
            return Err(ServiceError::NotFound(format!("kernel '{kernel_id}'")));
        }
        lock(&self.graph_locks).remove(kernel_id);
        info!(id = kernel_id, "deleted kernel");
        Ok(())
    }

    // --- Ingest ---

    /// Prepare documents on a bounded pool, persist each as it completes,
    /// then rebuild the kernel's graph once. Documents that fail preparation
    /// are skipped; the call fails only when nothing could be stored.
    pub fn ingest(&self, kernel_id: &str, documents: &[Document]) -> ServiceResult<IngestReport> {
        self.store().require_kernel(kernel_id)?;
        if documents.is_empty() {
            return Err(ServiceError::Invalid("no documents to ingest".into()));
        }

        let workers = self.workers.min(documents.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, CoreResult<PreparedDocument>)>();
        let mut stored: Vec<(usize, DocumentReport)> = Vec::new();
        let mut skipped: Vec<SkippedDocument> = Vec::new();
        let mut first_error: Option<ServiceError> = None;

        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                s.spawn(move || {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(doc) = documents.get(i) else { break };
                        let prepared = prepare_document(
                            &doc.name,
                            &doc.text,
                            &self.segmenter,
                            self.embedder.as_ref(),
                        );
                        if tx.send((i, prepared)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (i, prepared) in rx {
                let name = documents[i].name.clone();
                let saved = prepared
                    .map_err(ServiceError::from)
                    .and_then(|doc| Ok(self.store().save_document(kernel_id, &doc)?));
                match saved {
                    Ok((chunks, tensions)) => {
                        debug!(kernel = kernel_id, doc = %name, chunks, tensions, "stored document");
                        stored.push((i, DocumentReport { name, chunks, tensions }));
                    }
                    Err(e) => {
                        warn!(kernel = kernel_id, doc = %name, "skipping document: {e}");
                        skipped.push(SkippedDocument {
                            name,
                            error: e.to_string(),
                        });
                        first_error.get_or_insert(e);
                    }
                }
            }
        });

        if stored.is_empty()
            && let Some(e) = first_error
        {
            return Err(e);
        }
        stored.sort_by_key(|(i, _)| *i);
        self.rebuild_graph(kernel_id)?;
        let stats = self.store().stats(kernel_id)?;
        info!(
            kernel = kernel_id,
            documents = stored.len(),
            skipped = skipped.len(),
            tensions = stats.tensions,
            "ingest complete"
        );
        Ok(IngestReport {
            kernel_id: kernel_id.to_string(),
            documents: stored.into_iter().map(|(_, r)| r).collect(),
            skipped,
            stats,
        })
    }

    /// Recompute the whole graph from stored tensions under the kernel's lock.
    pub fn rebuild_graph(&self, kernel_id: &str) -> ServiceResult<TensionGraph> {
        let guard = self.graph_lock(kernel_id);
        let _held = lock(&guard);
        let tensions = self.store().all_tensions(kernel_id)?;
        let graph = aggregate(&tensions);
        self.store().replace_graph(kernel_id, &graph)?;
        debug!(
            kernel = kernel_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "rebuilt graph"
        );
        Ok(graph)
    }

    // --- Query ---

    /// Retrieve, gate and compose. A refusal bumps the refusal history of
    /// every retrieved tension already flagged as a refusal.
    pub fn chat(&self, kernel_id: &str, message: &str, masks: &[String]) -> ServiceResult<QueryOutcome> {
        if message.trim().is_empty() {
            return Err(ServiceError::Invalid("message must not be empty".into()));
        }
        let record = self.store().require_kernel(kernel_id)?;
        let kb = SharedStore(&self.store);
        let scorer = HybridScorer::new(self.settings.weights)?;
        let retriever = Retriever::new(
            self.embedder.as_ref(),
            &kb,
            &self.lexicon,
            scorer,
            self.settings.retrieval,
        )?;
        let outcome = respond(
            &retriever,
            &self.gate,
            &record.profile,
            message,
            masks,
            self.generator.as_deref(),
        )?;

        if let Some(refusal) = &outcome.refusal {
            let ids = outcome.refusal_tension_ids();
            let recorded = if ids.is_empty() {
                0
            } else {
                self.store().record_refusals(kernel_id, &ids)?
            };
            info!(kernel = kernel_id, code = refusal.code, recorded, "query refused");
        }
        Ok(outcome)
    }

    // --- Reads ---

    pub fn tensions(&self, kernel_id: &str, limit: usize) -> ServiceResult<Vec<Tension>> {
        let store = self.store();
        store.require_kernel(kernel_id)?;
        Ok(store
            .get_tensions(kernel_id, limit)?
            .iter()
            .map(Tension::without_embedding)
            .collect())
    }

    pub fn chunks(&self, kernel_id: &str, limit: usize) -> ServiceResult<Vec<Chunk>> {
        let store = self.store();
        store.require_kernel(kernel_id)?;
        Ok(store
            .get_chunks(kernel_id, limit)?
            .iter()
            .map(Chunk::without_embedding)
            .collect())
    }

    /// The materialized graph, rebuilt first if tensions exist without one.
    pub fn graph(&self, kernel_id: &str) -> ServiceResult<TensionGraph> {
        let (graph, stats) = {
            let store = self.store();
            store.require_kernel(kernel_id)?;
            (store.get_graph(kernel_id)?, store.stats(kernel_id)?)
        };
        if graph.is_empty() && stats.tensions > 0 {
            return self.rebuild_graph(kernel_id);
        }
        Ok(graph)
    }

    pub fn stats(&self, kernel_id: &str) -> ServiceResult<KernelStats> {
        let store = self.store();
        store.require_kernel(kernel_id)?;
        Ok(store.stats(kernel_id)?)
    }

    /// Apply a signal update, then refresh the graph it feeds.
    pub fn mark_tension(
        &self,
        kernel_id: &str,
        tension_id: &str,
        signal: &TensionSignal,
    ) -> ServiceResult<Tension> {
        let updated = self
            .store()
            .update_tension_signal(kernel_id, tension_id, signal)?;
        self.rebuild_graph(kernel_id)?;
        info!(kernel = kernel_id, tension = tension_id, "marked tension");
        Ok(updated.without_embedding())
    }

    // --- Export / import ---

    pub fn export(&self, kernel_id: &str) -> ServiceResult<KernelExport> {
        Ok(self.store().export_kernel(kernel_id)?)
    }

    pub fn import(&self, export: KernelExport) -> ServiceResult<KernelRecord> {
        Ok(self.store().import_kernel(export)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_core::{EmbedRole, GateConfig, HashingEmbedder, Upstream};

    fn service_with(settings: Settings, generator: Option<Box<dyn Generator>>) -> KernelService {
        KernelService::new(
            Store::open_in_memory().unwrap(),
            Box::new(HashingEmbedder::new(128).unwrap()),
            generator,
            settings,
        )
        .unwrap()
    }

    fn service() -> KernelService {
        service_with(Settings::default(), None)
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn dimensions(&self) -> usize {
            8
        }

        fn embed_batch(&self, _texts: &[&str], _role: EmbedRole) -> CoreResult<Vec<Vec<f32>>> {
            Err(CoreError::upstream(Upstream::Embedding, "connection refused"))
        }
    }

    struct EchoGenerator;

    impl Generator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        fn generate(&self, _system: &str, user: &str) -> CoreResult<String> {
            Ok(format!("echo: {}", user.lines().next().unwrap_or_default()))
        }
    }

    const LETTER: &str = "The conflict between duty and desire consumed him. \
        He spoke of justice vs mercy at the forum.";

    #[test]
    fn test_create_and_list() {
        let svc = service();
        let k = svc.create_kernel("Marcus", "Emperor", "121-180").unwrap();
        let all = svc.list_kernels().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].profile.id, k.profile.id);
        assert!(matches!(svc.create_kernel("  ", "", ""), Err(ServiceError::Invalid(_))));
    }

    #[test]
    fn test_parse_direction() {
        assert_eq!(parse_direction("Toward_A").unwrap(), CollapseDirection::TowardA);
        assert_eq!(parse_direction("unknown").unwrap(), CollapseDirection::Unknown);
        assert!(matches!(parse_direction("sideways"), Err(ServiceError::Invalid(_))));
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let svc = service();
        assert!(matches!(svc.delete_kernel("nope"), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn test_ingest_builds_graph() {
        let svc = service().with_workers(2);
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        let report = svc
            .ingest(
                &id,
                &[
                    Document::new("letters.txt", LETTER),
                    Document::new("diary.txt", "Freedom or control, he asked."),
                ],
            )
            .unwrap();
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.documents[0].name, "letters.txt");
        assert_eq!(report.documents[0].tensions, 2);
        assert!(report.skipped.is_empty());
        assert_eq!(report.stats.tensions, 3);
        assert_eq!(report.stats.edges, 3);

        let graph = svc.graph(&id).unwrap();
        assert!(graph.edge("duty", "desire").is_some());
        assert_eq!(svc.get_kernel(&id).unwrap().status, ks_store::KernelStatus::Ready);
    }

    #[test]
    fn test_ingest_unknown_kernel() {
        let svc = service();
        let err = svc.ingest("missing", &[Document::new("a", LETTER)]).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn test_ingest_upstream_failure_surfaces() {
        let svc = KernelService::new(
            Store::open_in_memory().unwrap(),
            Box::new(FailingEmbedder),
            None,
            Settings::default(),
        )
        .unwrap();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        let err = svc.ingest(&id, &[Document::new("a", LETTER)]).unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert_eq!(svc.stats(&id).unwrap().tensions, 0);
    }

    #[test]
    fn test_chat_empty_kernel_refuses() {
        let svc = service();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        let out = svc.chat(&id, "What is duty?", &[]).unwrap();
        assert!(out.refused);
        assert_eq!(out.refusal.unwrap().code, "insufficient_context");
        assert!(out.answer.starts_with("Ω_clear: "));
    }

    #[test]
    fn test_chat_answers_with_template() {
        let svc = service();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        svc.ingest(&id, &[Document::new("letters.txt", LETTER)]).unwrap();
        let out = svc.chat(&id, "Should duty outweigh desire?", &[]).unwrap();
        assert!(!out.refused);
        assert!(out.answer.contains("letters.txt"));
        assert_eq!(svc.policy(), PolicyKind::Rules);
    }

    #[test]
    fn test_chat_with_generator_uses_it() {
        let svc = service_with(Settings::default(), Some(Box::new(EchoGenerator)));
        assert_eq!(svc.policy(), PolicyKind::Strictness);
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        svc.ingest(&id, &[Document::new("letters.txt", LETTER)]).unwrap();
        let out = svc.chat(&id, "Should duty outweigh desire?", &[]).unwrap();
        assert!(!out.refused);
        assert!(out.answer.starts_with("echo: "));
        assert_eq!(out.trace.generator.as_deref(), Some("echo"));
    }

    #[test]
    fn test_chat_rejects_blank_message() {
        let svc = service();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        assert!(matches!(svc.chat(&id, "   ", &[]), Err(ServiceError::Invalid(_))));
    }

    #[test]
    fn test_refusals_accumulate_until_rule_fires() {
        let settings = Settings {
            gate: GateConfig {
                refusal_count_threshold: 1,
                ..GateConfig::default()
            },
            ..Settings::default()
        };
        let svc = service_with(settings, None);
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        svc.ingest(&id, &[Document::new("letters.txt", "Between duty and desire.")])
            .unwrap();
        let tension = svc.tensions(&id, 1).unwrap().remove(0);
        svc.mark_tension(
            &id,
            &tension.id,
            &TensionSignal {
                refusal: Some(true),
                scar_valence: Some(0.99),
                ..TensionSignal::default()
            },
        )
        .unwrap();

        // the extreme-scar rule fires first and starts the refusal history
        let first = svc.chat(&id, "duty or desire?", &[]).unwrap();
        assert_eq!(first.refusal.unwrap().code, "extreme_cost");
        svc.chat(&id, "duty or desire?", &[]).unwrap();
        let stored = svc.tensions(&id, 1).unwrap().remove(0);
        assert_eq!(stored.refusal_count, 2);

        let third = svc.chat(&id, "duty or desire?", &[]).unwrap();
        assert_eq!(third.refusal.unwrap().code, "prior_scars");
    }

    #[test]
    fn test_mark_refreshes_graph() {
        let svc = service();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        svc.ingest(&id, &[Document::new("a.txt", "Between duty and desire.")])
            .unwrap();
        let t = svc.tensions(&id, 1).unwrap().remove(0);
        let marked = svc
            .mark_tension(
                &id,
                &t.id,
                &TensionSignal {
                    collapse_direction: Some(CollapseDirection::TowardA),
                    ..TensionSignal::default()
                },
            )
            .unwrap();
        assert!(marked.embedding.is_none());
        let edge = svc.graph(&id).unwrap().edges.remove(0);
        assert_ne!(edge.direction_bias, 0.0);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let svc = service();
        let id = svc.create_kernel("Marcus", "", "").unwrap().profile.id;
        svc.ingest(&id, &[Document::new("a.txt", LETTER)]).unwrap();
        let export = svc.export(&id).unwrap();

        let other = service();
        let record = other.import(export).unwrap();
        assert_eq!(record.profile.id, id);
        assert_eq!(other.graph(&id).unwrap(), svc.graph(&id).unwrap());
    }
}
