//! Knowledge Index (§4.9).
//!
//! A hybrid retrieval surface over corpus text and evidence quotes: a
//! semantic backend (embedding + cosine similarity) and a text backend
//! (SQLite FTS5 keyword/phrase search) that also backs `validate_quote`'s
//! fuzzy drift classification.
//!
//! Grounded on the teacher's dropped `memory/store.rs`/`memory/schema.rs`
//! (`Arc<Mutex<Connection>>`, a `with_conn` helper, an FTS5 virtual table
//! kept in sync by triggers) — that shape is reused here directly rather
//! than reinvented, since it is exactly what a SQLite-backed text index
//! needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifact::{hash_bytes, AnalysisResult, ArtifactId, CorpusDocument};
use crate::error::{Error, Result};

/// What kind of content an indexed item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    CorpusPassage,
    EvidenceQuote,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::CorpusPassage => "corpus_passage",
            Self::EvidenceQuote => "evidence_quote",
        }
    }
}

/// One retrievable unit: a corpus sentence/passage or an evidence quote
/// attributed to a dimension, carrying the typed metadata §4.9 requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedItem {
    pub content: String,
    pub content_type: ContentType,
    pub source_artifact: ArtifactId,
    pub document_id: Option<String>,
    pub speaker: Option<String>,
    pub offset: Option<usize>,
}

/// A retrieval hit returned by [`KnowledgeIndex::query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub content: String,
    pub data_type: String,
    pub source_artifact: ArtifactId,
    pub relevance: f64,
    pub metadata: serde_json::Value,
}

/// Optional pre-filters applied before ranking (§4.9).
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub document_id: Option<String>,
    pub speaker: Option<String>,
}

/// Classification of how far a cited quote drifts from the nearest real
/// corpus text, coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftLevel {
    Exact,
    Minor,
    Significant,
    Major,
    Hallucination,
}

impl DriftLevel {
    fn from_score(score: f64) -> Self {
        if score >= 0.98 {
            Self::Exact
        } else if score >= 0.90 {
            Self::Minor
        } else if score >= 0.75 {
            Self::Significant
        } else if score >= 0.50 {
            Self::Major
        } else {
            Self::Hallucination
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteValidation {
    pub found: bool,
    pub drift_level: DriftLevel,
    pub score: f64,
    pub best_match: Option<String>,
    pub file_match: Option<String>,
}

/// Produces a fixed-dimension pseudo-embedding for a piece of text.
/// Implementations never fail: a query that can't be embedded degrades to
/// an all-zero vector, which simply never wins cosine ranking.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

const HASH_DIMS: usize = 256;

/// Deterministic bag-of-words hashing embedder. Every token is hashed into
/// one of `HASH_DIMS` buckets and the resulting vector is L2-normalized;
/// this gives a stable, dependency-free semantic proxy that clusters
/// documents sharing vocabulary without calling out to a model. Swap in an
/// `Embedder` backed by [`crate::llm::client::LLMClient::embed`] for a real
/// embedding model.
pub struct HashingEmbedder;

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; HASH_DIMS];
        for token in text.split_whitespace() {
            let normalized = token.to_lowercase();
            let hash = hash_bytes(normalized.as_bytes());
            let bucket = usize::from_str_radix(&hash[..8], 16).unwrap_or(0) % HASH_DIMS;
            vec[bucket] += 1.0;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot as f64
}

struct SemanticEntry {
    item: IndexedItem,
    embedding: Vec<f32>,
}

/// Hybrid semantic + text retrieval surface built once per experiment run
/// and cached by content hash.
pub struct KnowledgeIndex {
    id: ArtifactId,
    semantic: Vec<SemanticEntry>,
    conn: Arc<Mutex<Connection>>,
    embedder: Box<dyn Embedder>,
}

impl KnowledgeIndex {
    /// Compute `build()`'s cache key without constructing the index: the
    /// hash of `run_id ‖ artifact bytes ‖ types` (§4.9).
    pub fn content_hash(
        run_id: &str,
        documents: &[CorpusDocument],
        analyses: &[AnalysisResult],
    ) -> Result<ArtifactId> {
        let mut buf = Vec::new();
        buf.extend_from_slice(run_id.as_bytes());
        buf.push(b'|');
        for doc in documents {
            buf.extend_from_slice(serde_json::to_vec(doc)?.as_slice());
            buf.extend_from_slice(b"corpus_document");
        }
        for analysis in analyses {
            buf.extend_from_slice(serde_json::to_vec(analysis)?.as_slice());
            buf.extend_from_slice(b"analysis_result");
        }
        Ok(hash_bytes(&buf))
    }

    fn cache_dir(cas_root: &Path, id: &str) -> PathBuf {
        cas_root.join("knowledge_index").join(id)
    }

    /// Build (or reuse) the index for this experiment run. `run_id` scopes
    /// the cache key so two experiments over the same corpus don't collide.
    pub fn build(
        cas_root: &Path,
        run_id: &str,
        documents: &[CorpusDocument],
        analyses: &[AnalysisResult],
    ) -> Result<Self> {
        let id = Self::content_hash(run_id, documents, analyses)?;
        let dir = Self::cache_dir(cas_root, &id);
        let db_path = dir.join("text_index.sqlite");
        let already_built = db_path.exists();

        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::StorageUnavailable(format!("cannot create index dir: {}", e)))?;

        let conn = Connection::open(&db_path)
            .map_err(|e| Error::StorageUnavailable(format!("cannot open text index: {}", e)))?;

        if !already_built {
            init_schema(&conn)?;
        }

        let embedder: Box<dyn Embedder> = Box::new(HashingEmbedder);
        let mut semantic = Vec::new();

        if already_built {
            semantic = load_semantic_entries(&conn, embedder.as_ref())?;
        } else {
            let items = build_items(documents, analyses);
            for item in &items {
                insert_item(&conn, item)?;
                semantic.push(SemanticEntry {
                    embedding: embedder.embed(&item.content),
                    item: item.clone(),
                });
            }
        }

        Ok(Self {
            id,
            semantic,
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.semantic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semantic.is_empty()
    }

    /// Rank indexed items against `query` by cosine similarity over the
    /// hashing embedding, after applying pre-filters. Returns an empty
    /// result (never an error) on any internal failure, per §4.9:
    /// retrieval failures degrade gracefully rather than crashing the
    /// pipeline.
    pub fn query(
        &self,
        query: &str,
        content_types: Option<&[ContentType]>,
        filters: &QueryFilters,
        limit: usize,
    ) -> Vec<Hit> {
        if self.semantic.is_empty() {
            warn!("knowledge index query against empty index");
            return Vec::new();
        }

        let query_embedding = self.embedder.embed(query);
        let mut scored: Vec<(f64, &SemanticEntry)> = self
            .semantic
            .iter()
            .filter(|entry| {
                if let Some(types) = content_types {
                    if !types.contains(&entry.item.content_type) {
                        return false;
                    }
                }
                if let Some(doc_id) = &filters.document_id {
                    if entry.item.document_id.as_deref() != Some(doc_id.as_str()) {
                        return false;
                    }
                }
                if let Some(speaker) = &filters.speaker {
                    if entry.item.speaker.as_deref() != Some(speaker.as_str()) {
                        return false;
                    }
                }
                true
            })
            .map(|entry| (cosine_similarity(&query_embedding, &entry.embedding), entry))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(limit)
            .map(|(relevance, entry)| Hit {
                content: entry.item.content.clone(),
                data_type: entry.item.content_type.as_str().to_string(),
                source_artifact: entry.item.source_artifact.clone(),
                relevance,
                metadata: serde_json::json!({
                    "document_id": entry.item.document_id,
                    "speaker": entry.item.speaker,
                    "offset": entry.item.offset,
                }),
            })
            .collect()
    }

    /// Classify how closely `text` matches the nearest indexed corpus
    /// passage, for gating synthesized quotes against hallucination (§4.9,
    /// P7).
    pub fn validate_quote(&self, text: &str) -> QuoteValidation {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return QuoteValidation {
                found: false,
                drift_level: DriftLevel::Hallucination,
                score: 0.0,
                best_match: None,
                file_match: None,
            };
        }

        if let Ok(conn) = self.conn.lock() {
            if let Ok(mut stmt) = conn.prepare(
                "SELECT content, source_artifact FROM corpus_fts WHERE corpus_fts MATCH ?1 LIMIT 1",
            ) {
                let escaped = escape_fts_query(trimmed);
                if let Ok(mut rows) = stmt.query(rusqlite::params![escaped]) {
                    if let Ok(Some(row)) = rows.next() {
                        let content: String = row.get(0).unwrap_or_default();
                        let source: String = row.get(1).unwrap_or_default();
                        return QuoteValidation {
                            found: true,
                            drift_level: DriftLevel::Exact,
                            score: 1.0,
                            best_match: Some(content),
                            file_match: Some(source),
                        };
                    }
                }
            }
        }

        let mut best_score = 0.0f64;
        let mut best_item: Option<&IndexedItem> = None;
        for entry in &self.semantic {
            let score = strsim::jaro_winkler(trimmed, &entry.item.content);
            if score > best_score {
                best_score = score;
                best_item = Some(&entry.item);
            }
        }

        let drift_level = DriftLevel::from_score(best_score);
        QuoteValidation {
            found: drift_level != DriftLevel::Hallucination,
            drift_level,
            score: best_score,
            best_match: best_item.map(|i| i.content.clone()),
            file_match: best_item.map(|i| i.source_artifact.clone()),
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS corpus_fts USING fts5(
            content, content_type, source_artifact, document_id, speaker, offset
        );",
    )
    .map_err(|e| Error::StorageUnavailable(format!("failed to create fts5 table: {}", e)))
}

fn insert_item(conn: &Connection, item: &IndexedItem) -> Result<()> {
    conn.execute(
        "INSERT INTO corpus_fts (content, content_type, source_artifact, document_id, speaker, offset)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            item.content,
            item.content_type.as_str(),
            item.source_artifact,
            item.document_id,
            item.speaker,
            item.offset.map(|o| o as i64),
        ],
    )
    .map_err(|e| Error::StorageUnavailable(format!("failed to insert index item: {}", e)))?;
    Ok(())
}

fn load_semantic_entries(conn: &Connection, embedder: &dyn Embedder) -> Result<Vec<SemanticEntry>> {
    let mut stmt = conn
        .prepare("SELECT content, content_type, source_artifact, document_id, speaker, offset FROM corpus_fts")
        .map_err(|e| Error::StorageUnavailable(format!("failed to scan index: {}", e)))?;

    let rows = stmt
        .query_map([], |row| {
            let content_type: String = row.get(1)?;
            Ok(IndexedItem {
                content: row.get(0)?,
                content_type: if content_type == "evidence_quote" {
                    ContentType::EvidenceQuote
                } else {
                    ContentType::CorpusPassage
                },
                source_artifact: row.get(2)?,
                document_id: row.get(3)?,
                speaker: row.get(4)?,
                offset: row.get::<_, Option<i64>>(5)?.map(|o| o as usize),
            })
        })
        .map_err(|e| Error::StorageUnavailable(format!("failed to scan index: {}", e)))?;

    let mut entries = Vec::new();
    for row in rows {
        let item = row.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        entries.push(SemanticEntry {
            embedding: embedder.embed(&item.content),
            item,
        });
    }
    Ok(entries)
}

/// Escapes an FTS5 MATCH query so punctuation in a quoted passage doesn't
/// get parsed as query syntax: the whole phrase is wrapped in double quotes
/// with internal quotes doubled.
fn escape_fts_query(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Splits corpus documents into sentence-level passages (with character
/// offsets) and flattens each analysis's evidence quotes, producing the
/// full set of items the index is built from.
fn build_items(documents: &[CorpusDocument], analyses: &[AnalysisResult]) -> Vec<IndexedItem> {
    let mut items = Vec::new();

    for doc in documents {
        for (offset, sentence) in split_sentences(&doc.text) {
            if sentence.trim().is_empty() {
                continue;
            }
            items.push(IndexedItem {
                content: sentence.trim().to_string(),
                content_type: ContentType::CorpusPassage,
                source_artifact: doc.document_id.clone(),
                document_id: Some(doc.document_id.clone()),
                speaker: doc
                    .metadata
                    .get("speaker")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                offset: Some(offset),
            });
        }
    }

    for analysis in analyses {
        for quote in &analysis.evidence {
            items.push(IndexedItem {
                content: quote.quote.clone(),
                content_type: ContentType::EvidenceQuote,
                source_artifact: analysis.document_hash.clone(),
                document_id: Some(analysis.document_id.clone()),
                speaker: None,
                offset: quote.offset,
            });
        }
    }

    items
}

/// Splits on sentence-ending punctuation, yielding `(start_offset, text)`
/// pairs so retrieved passages can carry a character offset (§4.9's
/// "character-offset retrieval").
fn split_sentences(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut current = String::new();

    for (idx, ch) in text.char_indices() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            out.push((start, current.clone()));
            current.clear();
            start = idx + ch.len_utf8();
        }
    }
    if !current.trim().is_empty() {
        out.push((start, current));
    }
    out
}

/// Metadata summary (§4.9's "typed metadata" contract), used by callers
/// that just want counts rather than the full hit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub total_items: usize,
    pub by_content_type: HashMap<String, usize>,
}

impl KnowledgeIndex {
    pub fn summary(&self) -> IndexSummary {
        let mut by_content_type = HashMap::new();
        for entry in &self.semantic {
            *by_content_type
                .entry(entry.item.content_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        IndexSummary {
            total_items: self.semantic.len(),
            by_content_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{DimensionScore, EvidenceQuote};
    use std::collections::BTreeMap as Map;

    fn doc(id: &str, text: &str) -> CorpusDocument {
        CorpusDocument {
            document_id: id.to_string(),
            filename: format!("{}.txt", id),
            text: text.to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder;
        let a = embedder.embed("the people versus the elites");
        let b = embedder.embed("the people versus the elites");
        assert_eq!(a, b);
    }

    #[test]
    fn test_split_sentences_tracks_offsets() {
        let sentences = split_sentences("Hello world. This is a test!");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].0, 0);
        assert!(sentences[1].0 > 0);
    }

    #[test]
    fn test_build_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![doc("doc1", "The senate voted on the measure today. It passed narrowly.")];
        let analyses: Vec<AnalysisResult> = Vec::new();
        let index = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();
        assert!(!index.is_empty());

        let hits = index.query("senate vote", None, &QueryFilters::default(), 5);
        assert!(!hits.is_empty());
    }

    #[test]
    fn test_validate_quote_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![doc("doc1", "The senate voted on the measure today.")];
        let analyses: Vec<AnalysisResult> = Vec::new();
        let index = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();

        let result = index.validate_quote("The senate voted on the measure today.");
        assert!(result.found);
        assert_eq!(result.drift_level, DriftLevel::Exact);
    }

    #[test]
    fn test_validate_quote_hallucination() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![doc("doc1", "The senate voted on the measure today.")];
        let analyses: Vec<AnalysisResult> = Vec::new();
        let index = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();

        let result = index.validate_quote("Martians invaded the capitol building yesterday evening");
        assert_eq!(result.drift_level, DriftLevel::Hallucination);
    }

    #[test]
    fn test_build_includes_evidence_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![doc("doc1", "Some corpus text.")];
        let mut scores = Map::new();
        scores.insert(
            "populism".to_string(),
            DimensionScore {
                raw: 0.5,
                salience: 0.5,
                confidence: 0.5,
            },
        );
        let analyses = vec![AnalysisResult {
            document_id: "doc1".to_string(),
            document_hash: "dochash".to_string(),
            framework_hash: "fwhash".to_string(),
            model: "m".to_string(),
            scores,
            derived_metrics: Map::new(),
            evidence: vec![EvidenceQuote {
                dimension: "populism".to_string(),
                quote: "the people versus the elites".to_string(),
                source: "doc1".to_string(),
                offset: None,
            }],
            fallback_used: None,
        }];
        let index = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();
        assert_eq!(index.summary().by_content_type["evidence_quote"], 1);
    }

    #[test]
    fn test_build_is_cached_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![doc("doc1", "Some corpus text.")];
        let analyses: Vec<AnalysisResult> = Vec::new();
        let first = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();
        let second = KnowledgeIndex::build(dir.path(), "run1", &documents, &analyses).unwrap();
        assert_eq!(first.id(), second.id());
    }
}
