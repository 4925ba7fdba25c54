use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ks_core::{
    Chunk, ChunkHit, CollapseDirection, CoreResult, FlatIndex, GraphEdge, GraphNode,
    KernelProfile, KnowledgeBase, LifePhase, PreparedDocument, Tension, TensionGraph, TensionHit,
    VectorIndex,
};

use crate::error::{Result, StoreError};
use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Created, nothing ingested yet.
    Empty,
    /// At least one document ingested.
    Ready,
}

impl KernelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Ready => "ready",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            _ => Self::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRecord {
    #[serde(flatten)]
    pub profile: KernelProfile,
    pub status: KernelStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KernelStats {
    pub chunks: u64,
    pub tensions: u64,
    pub refusal_tensions: u64,
    pub edges: u64,
    pub nodes: u64,
}

/// Partial update of a tension's mutable signals. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensionSignal {
    #[serde(default)]
    pub scar_valence: Option<f64>,
    #[serde(default)]
    pub refusal: Option<bool>,
    #[serde(default)]
    pub collapse_direction: Option<CollapseDirection>,
}

const TENSION_COLUMNS: &str = "id, pole_a, pole_b, context_snippet, source_label, collapse_direction,
     scar_valence, refusal, refusal_count, life_phase, life_phase_weight, mask_inner, mask_outer,
     summary, embedding";

const CHUNK_COLUMNS: &str = "id, text, source_label, tags, life_phase, embedding";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Kernels ---

    pub fn create_kernel(&self, name: &str, bio: &str, era: &str) -> Result<KernelRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidData("kernel name must not be empty".into()));
        }
        let mut id = short_id();
        while self.kernel_exists(&id)? {
            id = short_id();
        }
        let profile = KernelProfile {
            id,
            name: name.to_string(),
            bio: bio.trim().to_string(),
            era: era.trim().to_string(),
        };
        self.insert_kernel(&profile, KernelStatus::Empty)?;
        self.require_kernel(&profile.id)
    }

    pub(crate) fn insert_kernel(&self, profile: &KernelProfile, status: KernelStatus) -> Result<()> {
        if self.kernel_exists(&profile.id)? {
            return Err(StoreError::InvalidData(format!(
                "kernel '{}' already exists",
                profile.id
            )));
        }
        self.conn.execute(
            "INSERT INTO kernels (id, name, bio, era, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![profile.id, profile.name, profile.bio, profile.era, status.as_str()],
        )?;
        Ok(())
    }

    pub fn kernel_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM kernels WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_kernel(&self, id: &str) -> Result<Option<KernelRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, bio, era, status, created_at FROM kernels WHERE id = ?1",
                [id],
                kernel_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn require_kernel(&self, id: &str) -> Result<KernelRecord> {
        self.get_kernel(id)?
            .ok_or_else(|| StoreError::NotFound(format!("kernel '{id}'")))
    }

    pub fn list_kernels(&self) -> Result<Vec<KernelRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, bio, era, status, created_at FROM kernels ORDER BY created_at, rowid",
        )?;
        let kernels = stmt
            .query_map([], kernel_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(kernels)
    }

    /// Delete a kernel with its chunks, tensions and graph. Returns false if it did not exist.
    pub fn delete_kernel(&self, id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        for table in ["graph_nodes", "graph_edges", "tensions", "chunks"] {
            tx.execute(&format!("DELETE FROM {table} WHERE kernel_id = ?1"), [id])?;
        }
        let removed = tx.execute("DELETE FROM kernels WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn set_kernel_status(&self, id: &str, status: KernelStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE kernels SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("kernel '{id}'")));
        }
        Ok(())
    }

    // --- Chunks & tensions ---

    fn next_seq(conn: &Connection, table: &str, kernel_id: &str) -> Result<i64> {
        let seq = conn.query_row(
            &format!("SELECT COALESCE(MAX(seq), -1) + 1 FROM {table} WHERE kernel_id = ?1"),
            [kernel_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    fn insert_chunks_on(conn: &Connection, kernel_id: &str, chunks: &[Chunk]) -> Result<usize> {
        let mut seq = Self::next_seq(conn, "chunks", kernel_id)?;
        let mut stmt = conn.prepare(
            "INSERT INTO chunks (id, kernel_id, seq, text, source_label, tags, life_phase, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                chunk.id,
                kernel_id,
                seq,
                chunk.text,
                chunk.source_label,
                serde_json::to_string(&chunk.tags)?,
                chunk.life_phase.map(|p| p.as_str()),
                chunk.embedding.as_deref().map(encode_vector),
            ])?;
            seq += 1;
        }
        Ok(chunks.len())
    }

    fn insert_tensions_on(conn: &Connection, kernel_id: &str, tensions: &[Tension]) -> Result<usize> {
        let mut seq = Self::next_seq(conn, "tensions", kernel_id)?;
        let mut stmt = conn.prepare(
            "INSERT INTO tensions (id, kernel_id, seq, pole_a, pole_b, context_snippet, source_label,
                collapse_direction, scar_valence, refusal, refusal_count, life_phase, life_phase_weight,
                mask_inner, mask_outer, summary, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )?;
        for t in tensions {
            stmt.execute(params![
                t.id,
                kernel_id,
                seq,
                t.pole_a,
                t.pole_b,
                t.context_snippet,
                t.source_label,
                t.collapse_direction.as_str(),
                t.scar_valence,
                t.refusal,
                t.refusal_count,
                t.life_phase.as_str(),
                t.life_phase_weight,
                t.mask_inner,
                t.mask_outer,
                t.summary,
                t.embedding.as_deref().map(encode_vector),
            ])?;
            seq += 1;
        }
        Ok(tensions.len())
    }

    pub fn save_chunks(&self, kernel_id: &str, chunks: &[Chunk]) -> Result<usize> {
        self.require_kernel(kernel_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let n = Self::insert_chunks_on(&tx, kernel_id, chunks)?;
        tx.commit()?;
        Ok(n)
    }

    pub fn save_tensions(&self, kernel_id: &str, tensions: &[Tension]) -> Result<usize> {
        self.require_kernel(kernel_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let n = Self::insert_tensions_on(&tx, kernel_id, tensions)?;
        tx.commit()?;
        Ok(n)
    }

    /// Persist one prepared document atomically and mark the kernel ready.
    pub fn save_document(&self, kernel_id: &str, doc: &PreparedDocument) -> Result<(usize, usize)> {
        self.require_kernel(kernel_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let chunks = Self::insert_chunks_on(&tx, kernel_id, &doc.chunks)?;
        let tensions = Self::insert_tensions_on(&tx, kernel_id, &doc.tensions)?;
        tx.execute(
            "UPDATE kernels SET status = ?2 WHERE id = ?1",
            params![kernel_id, KernelStatus::Ready.as_str()],
        )?;
        tx.commit()?;
        Ok((chunks, tensions))
    }

    pub fn get_chunks(&self, kernel_id: &str, limit: usize) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE kernel_id = ?1 ORDER BY seq LIMIT ?2"
        ))?;
        let chunks = stmt
            .query_map(params![kernel_id, sql_limit(limit)], chunk_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(chunks)
    }

    /// Highest scar first, then insertion order.
    pub fn get_tensions(&self, kernel_id: &str, limit: usize) -> Result<Vec<Tension>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TENSION_COLUMNS} FROM tensions WHERE kernel_id = ?1
             ORDER BY scar_valence DESC, seq LIMIT ?2"
        ))?;
        let tensions = stmt
            .query_map(params![kernel_id, sql_limit(limit)], tension_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(tensions)
    }

    /// Every tension of a kernel in insertion order, as one consistent read.
    pub fn all_tensions(&self, kernel_id: &str) -> Result<Vec<Tension>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TENSION_COLUMNS} FROM tensions WHERE kernel_id = ?1 ORDER BY seq"
        ))?;
        let tensions = stmt
            .query_map([kernel_id], tension_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(tensions)
    }

    pub fn get_tension(&self, kernel_id: &str, id: &str) -> Result<Option<Tension>> {
        let tension = self
            .conn
            .query_row(
                &format!("SELECT {TENSION_COLUMNS} FROM tensions WHERE kernel_id = ?1 AND id = ?2"),
                [kernel_id, id],
                tension_from_row,
            )
            .optional()?;
        Ok(tension)
    }

    /// Cosine search over stored tension vectors. Rows without a vector are never returned.
    pub fn search_tensions(&self, kernel_id: &str, query: &[f32], limit: usize) -> Result<Vec<TensionHit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TENSION_COLUMNS} FROM tensions
             WHERE kernel_id = ?1 AND embedding IS NOT NULL ORDER BY seq"
        ))?;
        let tensions: Vec<Tension> = stmt
            .query_map([kernel_id], tension_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        nearest(tensions, |t| t.embedding.as_ref(), query, limit).map(|hits| {
            hits.into_iter()
                .map(|(tension, d)| TensionHit {
                    tension,
                    distance: Some(d),
                })
                .collect()
        })
    }

    pub fn search_chunks(&self, kernel_id: &str, query: &[f32], limit: usize) -> Result<Vec<ChunkHit>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE kernel_id = ?1 AND embedding IS NOT NULL ORDER BY seq"
        ))?;
        let chunks: Vec<Chunk> = stmt
            .query_map([kernel_id], chunk_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        nearest(chunks, |c| c.embedding.as_ref(), query, limit).map(|hits| {
            hits.into_iter()
                .map(|(chunk, d)| ChunkHit {
                    chunk,
                    distance: Some(d),
                })
                .collect()
        })
    }

    pub fn update_tension_signal(
        &self,
        kernel_id: &str,
        id: &str,
        signal: &TensionSignal,
    ) -> Result<Tension> {
        if let Some(scar) = signal.scar_valence
            && !(0.0..=1.0).contains(&scar)
        {
            return Err(StoreError::InvalidData(format!(
                "scar_valence must be within [0, 1], got {scar}"
            )));
        }
        let tx = self.conn.unchecked_transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM tensions WHERE kernel_id = ?1 AND id = ?2",
                [kernel_id, id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("tension '{id}' in kernel '{kernel_id}'")));
        }
        if let Some(scar) = signal.scar_valence {
            tx.execute(
                "UPDATE tensions SET scar_valence = ?3 WHERE kernel_id = ?1 AND id = ?2",
                params![kernel_id, id, scar],
            )?;
        }
        if let Some(refusal) = signal.refusal {
            tx.execute(
                "UPDATE tensions SET refusal = ?3 WHERE kernel_id = ?1 AND id = ?2",
                params![kernel_id, id, refusal],
            )?;
        }
        if let Some(direction) = signal.collapse_direction {
            tx.execute(
                "UPDATE tensions SET collapse_direction = ?3 WHERE kernel_id = ?1 AND id = ?2",
                params![kernel_id, id, direction.as_str()],
            )?;
        }
        tx.commit()?;
        self.get_tension(kernel_id, id)?
            .ok_or_else(|| StoreError::NotFound(format!("tension '{id}'")))
    }

    /// Bump `refusal_count` on each listed tension that carries a refusal flag.
    pub fn record_refusals(&self, kernel_id: &str, ids: &[String]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE tensions SET refusal_count = refusal_count + 1
                 WHERE kernel_id = ?1 AND id = ?2 AND refusal = 1",
            )?;
            for id in ids {
                updated += stmt.execute([kernel_id, id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    // --- Graph ---

    /// Swap the materialized graph for a kernel in one transaction.
    pub fn replace_graph(&self, kernel_id: &str, graph: &TensionGraph) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM graph_edges WHERE kernel_id = ?1", [kernel_id])?;
        tx.execute("DELETE FROM graph_nodes WHERE kernel_id = ?1", [kernel_id])?;
        {
            let mut edge_stmt = tx.prepare(
                "INSERT INTO graph_edges (kernel_id, source, target, frequency, direction_bias,
                    scar_sum, refusal_present, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for e in &graph.edges {
                edge_stmt.execute(params![
                    kernel_id,
                    e.source,
                    e.target,
                    e.frequency,
                    e.direction_bias,
                    e.scar_sum,
                    e.refusal_present,
                    serde_json::to_string(e)?,
                ])?;
            }
            let mut node_stmt = tx.prepare(
                "INSERT INTO graph_nodes (kernel_id, id, label, frequency, scar, refusal, connections)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for n in &graph.nodes {
                node_stmt.execute(params![
                    kernel_id,
                    n.id,
                    n.label,
                    n.frequency,
                    n.scar,
                    n.refusal,
                    n.connections,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_graph(&self, kernel_id: &str) -> Result<TensionGraph> {
        let mut edge_stmt = self
            .conn
            .prepare("SELECT detail FROM graph_edges WHERE kernel_id = ?1 ORDER BY source, target")?;
        let details: Vec<String> = edge_stmt
            .query_map([kernel_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let edges = details
            .iter()
            .map(|d| serde_json::from_str::<GraphEdge>(d))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut node_stmt = self.conn.prepare(
            "SELECT id, label, frequency, scar, refusal, connections
             FROM graph_nodes WHERE kernel_id = ?1 ORDER BY id",
        )?;
        let nodes = node_stmt
            .query_map([kernel_id], |row| {
                Ok(GraphNode {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    frequency: row.get(2)?,
                    scar: row.get(3)?,
                    refusal: row.get(4)?,
                    connections: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        Ok(TensionGraph { nodes, edges })
    }

    // --- Stats ---

    pub fn stats(&self, kernel_id: &str) -> Result<KernelStats> {
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, [kernel_id], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };
        Ok(KernelStats {
            chunks: count("SELECT COUNT(*) FROM chunks WHERE kernel_id = ?1")?,
            tensions: count("SELECT COUNT(*) FROM tensions WHERE kernel_id = ?1")?,
            refusal_tensions: count(
                "SELECT COUNT(*) FROM tensions WHERE kernel_id = ?1 AND refusal = 1",
            )?,
            edges: count("SELECT COUNT(*) FROM graph_edges WHERE kernel_id = ?1")?,
            nodes: count("SELECT COUNT(*) FROM graph_nodes WHERE kernel_id = ?1")?,
        })
    }
}

impl KnowledgeBase for Store {
    fn search_tensions(&self, persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<TensionHit>> {
        Ok(Store::search_tensions(self, persona, query, limit)?)
    }

    fn search_chunks(&self, persona: &str, query: &[f32], limit: usize) -> CoreResult<Vec<ChunkHit>> {
        Ok(Store::search_chunks(self, persona, query, limit)?)
    }
}

fn nearest<T>(
    items: Vec<T>,
    vector: impl Fn(&T) -> Option<&Vec<f32>>,
    query: &[f32],
    limit: usize,
) -> Result<Vec<(T, f64)>> {
    let mut index = FlatIndex::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(v) = vector(item) {
            index.insert(i.to_string(), v.clone())?;
        }
    }
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let hits = index
        .search(query, limit)?
        .into_iter()
        .filter_map(|n| {
            let i = n.id.parse::<usize>().ok()?;
            slots.get_mut(i)?.take().map(|item| (item, n.distance))
        })
        .collect();
    Ok(hits)
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> std::result::Result<Vec<f32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!("embedding blob of {} bytes is not f32-aligned", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn vector_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = row.get(idx)?;
    blob.map(|b| decode_vector(&b))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, e.into()))
}

fn kernel_from_row(row: &Row<'_>) -> rusqlite::Result<KernelRecord> {
    Ok(KernelRecord {
        profile: KernelProfile {
            id: row.get(0)?,
            name: row.get(1)?,
            bio: row.get(2)?,
            era: row.get(3)?,
        },
        status: KernelStatus::from_str_lossy(&row.get::<_, String>(4)?),
        created_at: row.get(5)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let tags: String = row.get(3)?;
    let tags: Vec<String> = serde_json::from_str(&tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Chunk {
        id: row.get(0)?,
        text: row.get(1)?,
        source_label: row.get(2)?,
        tags,
        life_phase: row
            .get::<_, Option<String>>(4)?
            .map(|p| LifePhase::from_str_lossy(&p)),
        embedding: vector_column(row, 5)?,
    })
}

fn tension_from_row(row: &Row<'_>) -> rusqlite::Result<Tension> {
    Ok(Tension {
        id: row.get(0)?,
        pole_a: row.get(1)?,
        pole_b: row.get(2)?,
        context_snippet: row.get(3)?,
        source_label: row.get(4)?,
        collapse_direction: CollapseDirection::from_str_lossy(&row.get::<_, String>(5)?),
        scar_valence: row.get(6)?,
        refusal: row.get(7)?,
        refusal_count: row.get(8)?,
        life_phase: LifePhase::from_str_lossy(&row.get::<_, String>(9)?),
        life_phase_weight: row.get(10)?,
        mask_inner: row.get(11)?,
        mask_outer: row.get(12)?,
        summary: row.get(13)?,
        embedding: vector_column(row, 14)?,
    })
}
