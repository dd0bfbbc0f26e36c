//! Hierarchical index: document → section → chunk → sentence
//!
//! All four levels live in flat arenas and refer to each other by integer
//! index; a `ChunkId → index` table resolves external ids. A built index
//! is immutable. Re-indexing builds a new one with the next version number,
//! which is published through [`IndexHandle`].
//!
//! Retrieval funnels from cheap and broad to fine: documents (top 50) →
//! sections of surviving documents (top 20) → chunks of surviving sections
//! (top_k) → sentences of surviving chunks (top_k × 3). A level can only
//! consider children of the previous level's survivors, and an empty level
//! ends the funnel with an empty result naming that level.

mod graph;
mod snapshot;

pub use graph::{Reached, ReferenceEdge, ReferenceGraph};
pub use snapshot::IndexHandle;

use lodestar_common::config::IndexConfig;
use lodestar_common::models::{Chunk, ChunkId, ContentType, Document, DocumentId};
use lodestar_common::text::{self, CrossReference, ReferenceKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Level of the hierarchical funnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLevel {
    Document,
    Section,
    Chunk,
    Sentence,
}

/// Query as seen by the index: key terms plus a dense embedding
///
/// Expansion terms widen recall but count half as much as the query's own
/// terms, so an expansion alone rarely clears a level threshold.
#[derive(Debug, Clone, Default)]
pub struct QueryProbe {
    pub terms: Vec<String>,
    pub expansion_terms: Vec<String>,
    /// Empty when the embedding provider was unavailable
    pub embedding: Vec<f32>,
}

impl QueryProbe {
    pub fn new(query: &str, expansions: &[String], embedding: Vec<f32>) -> Self {
        let terms = text::key_terms(query);
        let own: HashSet<&String> = terms.iter().collect();
        let mut expansion_terms = Vec::new();
        for expansion in expansions {
            for term in text::key_terms(expansion) {
                if !own.contains(&term) && !expansion_terms.contains(&term) {
                    expansion_terms.push(term);
                }
            }
        }
        Self {
            terms,
            expansion_terms,
            embedding,
        }
    }

    /// Weighted share of probe terms present in `terms`, in [0, 1]
    pub fn coverage(&self, terms: &HashSet<String>) -> f32 {
        let weight = self.terms.len() as f32 + 0.5 * self.expansion_terms.len() as f32;
        if weight == 0.0 {
            return 0.0;
        }
        let own = self.terms.iter().filter(|t| terms.contains(*t)).count() as f32;
        let expanded = self.expansion_terms.iter().filter(|t| terms.contains(*t)).count() as f32;
        (own + 0.5 * expanded) / weight
    }

    fn similarity(&self, embedding: &[f32]) -> f32 {
        if self.embedding.is_empty() {
            return 0.0;
        }
        text::cosine_similarity(&self.embedding, embedding).max(0.0)
    }

    /// All terms, query terms first
    pub fn all_terms(&self) -> impl Iterator<Item = &String> {
        self.terms.iter().chain(self.expansion_terms.iter())
    }
}

/// One document with its accepted chunks
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub document: Arc<Document>,
    pub chunks: Vec<Arc<Chunk>>,
}

#[derive(Debug, Clone)]
pub struct DocumentNode {
    pub id: DocumentId,
    pub path: String,
    pub content_type: ContentType,
    pub sections: Vec<usize>,
    pub embedding: Vec<f32>,
    terms: HashSet<String>,
    source: Arc<Document>,
}

#[derive(Debug, Clone)]
pub struct SectionNode {
    pub document: usize,
    /// Position of the section within its document
    pub section_index: usize,
    pub title: String,
    pub chunks: Vec<usize>,
    pub embedding: Vec<f32>,
    terms: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkNode {
    pub chunk: Arc<Chunk>,
    pub document: usize,
    pub section: usize,
    pub sentences: Range<usize>,
    pub term_freqs: HashMap<String, u32>,
    /// Token count after stop-word removal
    pub length: usize,
    pub references: Vec<CrossReference>,
    terms: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct SentenceNode {
    pub chunk: usize,
    /// Byte offsets within the chunk text
    pub start: usize,
    pub end: usize,
    pub text: String,
    terms: HashSet<String>,
}

/// Corpus statistics for BM25
#[derive(Debug, Clone, Default)]
pub struct TermStats {
    pub document_frequency: HashMap<String, usize>,
    pub chunk_count: usize,
    pub average_length: f32,
}

impl TermStats {
    /// BM25 inverse document frequency (never negative)
    pub fn idf(&self, term: &str) -> f32 {
        let n = self.chunk_count as f32;
        let df = self.document_frequency.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHit {
    pub chunk: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentenceHit {
    pub sentence: usize,
    pub chunk: usize,
    pub score: f32,
}

/// Output of the hierarchical funnel
#[derive(Debug, Clone, Default)]
pub struct HierarchicalHits {
    pub documents_matched: usize,
    pub sections_matched: usize,
    pub chunks: Vec<ChunkHit>,
    pub sentences: Vec<SentenceHit>,
    /// First level that came back empty ("no coverage")
    pub empty_level: Option<IndexLevel>,
}

impl HierarchicalHits {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn short_circuit(level: IndexLevel, documents: usize, sections: usize) -> Self {
        Self {
            documents_matched: documents,
            sections_matched: sections,
            empty_level: Some(level),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub version: u64,
    pub documents: usize,
    pub sections: usize,
    pub chunks: usize,
    pub sentences: usize,
    pub reference_edges: usize,
    pub vocabulary: usize,
}

/// Immutable, versioned index snapshot
#[derive(Debug, Clone)]
pub struct HierarchicalIndex {
    version: u64,
    config: IndexConfig,
    documents: Vec<DocumentNode>,
    sections: Vec<SectionNode>,
    chunks: Vec<ChunkNode>,
    sentences: Vec<SentenceNode>,
    chunk_lookup: HashMap<ChunkId, usize>,
    document_lookup: HashMap<DocumentId, usize>,
    term_stats: TermStats,
    graph: ReferenceGraph,
}

impl HierarchicalIndex {
    /// Version 0 index with no documents
    pub fn empty(config: IndexConfig) -> Self {
        Self::build(0, Vec::new(), config)
    }

    /// Build an index from documents and their accepted chunks
    pub fn build(version: u64, entries: Vec<IndexEntry>, config: IndexConfig) -> Self {
        let mut index = Self {
            version,
            config,
            documents: Vec::with_capacity(entries.len()),
            sections: Vec::new(),
            chunks: Vec::new(),
            sentences: Vec::new(),
            chunk_lookup: HashMap::new(),
            document_lookup: HashMap::new(),
            term_stats: TermStats::default(),
            graph: ReferenceGraph::default(),
        };

        for entry in entries {
            index.insert_entry(entry);
        }
        index.compute_term_stats();
        index.graph = index.resolve_references();

        debug!(
            version = index.version,
            documents = index.documents.len(),
            chunks = index.chunks.len(),
            edges = index.graph.edge_count(),
            "Hierarchical index built"
        );
        index
    }

    /// New index (next version) with `upserts` replacing documents of the
    /// same id and `removals` dropped
    pub fn rebuild(&self, upserts: Vec<IndexEntry>, removals: &HashSet<DocumentId>) -> Self {
        let mut replacements: HashMap<DocumentId, IndexEntry> = HashMap::new();
        let mut order: Vec<DocumentId> = Vec::new();
        for entry in upserts {
            let id = entry.document.id.clone();
            if replacements.insert(id.clone(), entry).is_none() {
                order.push(id);
            }
        }

        let mut entries = Vec::with_capacity(self.documents.len() + order.len());
        for existing in self.entries() {
            let id = &existing.document.id;
            if removals.contains(id) {
                continue;
            }
            match replacements.remove(id) {
                Some(replacement) => entries.push(replacement),
                None => entries.push(existing),
            }
        }
        for id in order {
            if let Some(entry) = replacements.remove(&id) {
                if !removals.contains(&id) {
                    entries.push(entry);
                }
            }
        }

        Self::build(self.version + 1, entries, self.config.clone())
    }

    fn insert_entry(&mut self, entry: IndexEntry) {
        let IndexEntry { document, chunks } = entry;
        if let Some(&existing) = self.document_lookup.get(&document.id) {
            debug!(document_id = %document.id, existing = existing, "Duplicate document id skipped");
            return;
        }

        let doc_idx = self.documents.len();
        let mut doc_terms: HashSet<String> = text::key_terms(&document.path).into_iter().collect();
        let mut section_ids: Vec<usize> = Vec::new();
        let mut section_by_position: HashMap<usize, usize> = HashMap::new();

        for chunk in chunks {
            if self.chunk_lookup.contains_key(&chunk.id) {
                continue;
            }

            let section_idx = *section_by_position.entry(chunk.section_index).or_insert_with(|| {
                let title = document
                    .sections
                    .get(chunk.section_index)
                    .map(|s| s.title.clone())
                    .unwrap_or_default();
                let terms = text::key_terms(&title).into_iter().collect();
                self.sections.push(SectionNode {
                    document: doc_idx,
                    section_index: chunk.section_index,
                    title,
                    chunks: Vec::new(),
                    embedding: Vec::new(),
                    terms,
                });
                section_ids.push(self.sections.len() - 1);
                self.sections.len() - 1
            });

            let chunk_idx = self.chunks.len();
            let tokens: Vec<String> = text::tokenize(&chunk.text)
                .into_iter()
                .filter(|t| !text::is_stop_word(t))
                .map(|t| text::stem(&t))
                .collect();
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            let terms: HashSet<String> = term_freqs.keys().cloned().collect();

            let sentence_start = self.sentences.len();
            for (start, end) in sentence_spans_for(&chunk) {
                let sentence_text = chunk.text[start..end].to_string();
                let sentence_terms = text::key_terms(&sentence_text).into_iter().collect();
                self.sentences.push(SentenceNode {
                    chunk: chunk_idx,
                    start,
                    end,
                    text: sentence_text,
                    terms: sentence_terms,
                });
            }

            let section = &mut self.sections[section_idx];
            section.chunks.push(chunk_idx);
            section.terms.extend(terms.iter().cloned());
            doc_terms.extend(terms.iter().cloned());

            self.chunk_lookup.insert(chunk.id.clone(), chunk_idx);
            self.chunks.push(ChunkNode {
                references: text::extract_references(&chunk.text),
                chunk,
                document: doc_idx,
                section: section_idx,
                sentences: sentence_start..self.sentences.len(),
                length: tokens.len(),
                term_freqs,
                terms,
            });
        }

        for &section_idx in &section_ids {
            let vectors: Vec<&[f32]> = self.sections[section_idx]
                .chunks
                .iter()
                .map(|&c| self.chunks[c].chunk.embedding.as_slice())
                .collect();
            let embedding = text::mean_vector(&vectors);
            let title_terms: Vec<String> = self.sections[section_idx].terms.iter().cloned().collect();
            doc_terms.extend(title_terms);
            self.sections[section_idx].embedding = embedding;
        }

        let vectors: Vec<&[f32]> = section_ids
            .iter()
            .flat_map(|&s| self.sections[s].chunks.iter())
            .map(|&c| self.chunks[c].chunk.embedding.as_slice())
            .collect();
        let embedding = text::mean_vector(&vectors);

        self.document_lookup.insert(document.id.clone(), doc_idx);
        self.documents.push(DocumentNode {
            id: document.id.clone(),
            path: document.path.clone(),
            content_type: document.content_type,
            sections: section_ids,
            embedding,
            terms: doc_terms,
            source: document,
        });
    }

    fn compute_term_stats(&mut self) {
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        let mut total_length = 0usize;
        for node in &self.chunks {
            total_length += node.length;
            for term in node.term_freqs.keys() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let chunk_count = self.chunks.len();
        self.term_stats = TermStats {
            document_frequency,
            chunk_count,
            average_length: if chunk_count == 0 {
                0.0
            } else {
                total_length as f32 / chunk_count as f32
            },
        };
    }

    /// Resolve textual references into chunk-to-chunk edges
    fn resolve_references(&self) -> ReferenceGraph {
        let mut graph = ReferenceGraph::with_nodes(self.chunks.len());

        let mut definitions: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, node) in self.chunks.iter().enumerate() {
            if node.chunk.content_type == ContentType::Code {
                for symbol in text::defined_symbols(&node.chunk.text) {
                    definitions.entry(symbol).or_default().push(idx);
                }
            }
        }

        for (idx, node) in self.chunks.iter().enumerate() {
            for reference in &node.references {
                match reference.kind {
                    ReferenceKind::Path | ReferenceKind::Link | ReferenceKind::Import => {
                        let target_doc = if reference.kind == ReferenceKind::Import {
                            self.find_module(&reference.target)
                        } else {
                            self.find_path(&reference.target)
                        };
                        if let Some(doc) = target_doc.filter(|&d| d != node.document) {
                            if let Some(first) = self.first_chunk_of(doc) {
                                graph.add_edge(idx, first, reference.kind);
                            }
                        }
                    }
                    ReferenceKind::Symbol => {
                        let name = reference
                            .target
                            .rsplit(['.', ':'])
                            .find(|s| !s.is_empty())
                            .unwrap_or(&reference.target);
                        if let Some(targets) = definitions.get(name) {
                            for &target in targets {
                                graph.add_edge(idx, target, ReferenceKind::Symbol);
                            }
                        }
                    }
                }
            }
        }

        graph
    }

    fn find_path(&self, target: &str) -> Option<usize> {
        if target.starts_with("http://") || target.starts_with("https://") {
            return None;
        }
        let target = target
            .split(['#', '?'])
            .next()
            .unwrap_or(target)
            .trim_start_matches("./")
            .to_ascii_lowercase();
        if target.is_empty() {
            return None;
        }
        let target_base = target.rsplit('/').next().unwrap_or(&target).to_string();

        self.documents
            .iter()
            .position(|d| {
                let path = d.path.to_ascii_lowercase();
                path == target || path.ends_with(&format!("/{}", target))
            })
            .or_else(|| {
                self.documents.iter().position(|d| {
                    let path = d.path.to_ascii_lowercase();
                    path.rsplit('/').next() == Some(target_base.as_str())
                })
            })
    }

    fn find_module(&self, module: &str) -> Option<usize> {
        let normalized = module.replace("::", "/").replace('.', "/").to_ascii_lowercase();
        let segments: Vec<&str> = normalized
            .split('/')
            .filter(|s| !s.is_empty() && *s != "crate" && *s != "self" && *s != "super")
            .collect();
        let joined = segments.join("/");
        if joined.is_empty() {
            return None;
        }

        let stem_of = |path: &str| -> String {
            let lower = path.to_ascii_lowercase();
            match lower.rsplit_once('.') {
                Some((stem, _)) => stem.to_string(),
                None => lower,
            }
        };

        self.documents
            .iter()
            .position(|d| {
                let stem = stem_of(&d.path);
                stem == joined || stem.ends_with(&format!("/{}", joined))
            })
            .or_else(|| {
                // `use crate::engine::Engine` names a symbol after the module
                segments.iter().rev().find_map(|segment| {
                    self.documents.iter().position(|d| {
                        stem_of(&d.path).rsplit('/').next() == Some(*segment)
                    })
                })
            })
    }

    fn first_chunk_of(&self, document: usize) -> Option<usize> {
        self.documents[document]
            .sections
            .iter()
            .flat_map(|&s| self.sections[s].chunks.iter().copied())
            .min()
    }

    /// Coarse-to-fine retrieval over the arenas
    pub fn hierarchical_retrieve(&self, probe: &QueryProbe, top_k: usize) -> HierarchicalHits {
        let threshold = self.config.min_level_score;

        // Level 1: documents
        let mut documents: Vec<(usize, f32)> = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, d)| (i, probe.similarity(&d.embedding).max(probe.coverage(&d.terms))))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        sort_scored(&mut documents);
        documents.truncate(self.config.document_top_k);
        if documents.is_empty() {
            return HierarchicalHits::short_circuit(IndexLevel::Document, 0, 0);
        }

        // Level 2: sections of surviving documents
        let mut sections: Vec<(usize, f32)> = documents
            .iter()
            .flat_map(|&(d, _)| self.documents[d].sections.iter().copied())
            .map(|s| {
                let node = &self.sections[s];
                (s, probe.similarity(&node.embedding).max(probe.coverage(&node.terms)))
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();
        sort_scored(&mut sections);
        sections.truncate(self.config.section_top_k);
        if sections.is_empty() {
            return HierarchicalHits::short_circuit(IndexLevel::Section, documents.len(), 0);
        }

        // Level 3: chunks of surviving sections
        let mut chunks: Vec<(usize, f32)> = sections
            .iter()
            .flat_map(|&(s, _)| self.sections[s].chunks.iter().copied())
            .map(|c| {
                let node = &self.chunks[c];
                let score = 0.5 * probe.similarity(&node.chunk.embedding) + 0.5 * probe.coverage(&node.terms);
                (c, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        sort_scored(&mut chunks);
        chunks.truncate(top_k);
        if chunks.is_empty() {
            return HierarchicalHits::short_circuit(IndexLevel::Chunk, documents.len(), sections.len());
        }

        // Level 4: sentences of surviving chunks
        let mut sentences: Vec<(usize, f32, usize)> = chunks
            .iter()
            .enumerate()
            .flat_map(|(rank, &(c, chunk_score))| {
                self.chunks[c].sentences.clone().map(move |s| (s, chunk_score, rank))
            })
            .map(|(s, chunk_score, rank)| {
                let coverage = probe.coverage(&self.sentences[s].terms);
                (s, 0.6 * coverage + 0.4 * chunk_score, rank)
            })
            .collect();
        sentences.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));
        sentences.truncate(top_k.saturating_mul(self.config.sentence_multiplier.max(1)));
        if sentences.is_empty() {
            return HierarchicalHits::short_circuit(IndexLevel::Sentence, documents.len(), sections.len());
        }

        HierarchicalHits {
            documents_matched: documents.len(),
            sections_matched: sections.len(),
            chunks: chunks
                .into_iter()
                .map(|(chunk, score)| ChunkHit { chunk, score })
                .collect(),
            sentences: sentences
                .into_iter()
                .map(|(sentence, score, _)| SentenceHit {
                    sentence,
                    chunk: self.sentences[sentence].chunk,
                    score,
                })
                .collect(),
            empty_level: None,
        }
    }

    /// Non-negative cosine between a chunk and the probe embedding
    pub fn chunk_similarity(&self, chunk: usize, probe: &QueryProbe) -> f32 {
        probe.similarity(&self.chunks[chunk].chunk.embedding)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn chunk(&self, idx: usize) -> &ChunkNode {
        &self.chunks[idx]
    }

    pub fn chunk_index(&self, id: &ChunkId) -> Option<usize> {
        self.chunk_lookup.get(id).copied()
    }

    pub fn sentence(&self, idx: usize) -> &SentenceNode {
        &self.sentences[idx]
    }

    pub fn document(&self, idx: usize) -> &DocumentNode {
        &self.documents[idx]
    }

    pub fn section(&self, idx: usize) -> &SectionNode {
        &self.sections[idx]
    }

    pub fn contains_document(&self, id: &DocumentId) -> bool {
        self.document_lookup.contains_key(id)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn term_stats(&self) -> &TermStats {
        &self.term_stats
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    /// Ids of every chunk in this snapshot
    pub fn chunk_ids(&self) -> HashSet<ChunkId> {
        self.chunk_lookup.keys().cloned().collect()
    }

    /// Documents and chunks in index order, for rebuilding
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.documents
            .iter()
            .map(|d| IndexEntry {
                document: d.source.clone(),
                chunks: d
                    .sections
                    .iter()
                    .flat_map(|&s| self.sections[s].chunks.iter())
                    .map(|&c| self.chunks[c].chunk.clone())
                    .collect(),
            })
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            version: self.version,
            documents: self.documents.len(),
            sections: self.sections.len(),
            chunks: self.chunks.len(),
            sentences: self.sentences.len(),
            reference_edges: self.graph.edge_count(),
            vocabulary: self.term_stats.document_frequency.len(),
        }
    }
}

/// Sentence spans of a chunk: code splits into blank-line blocks
fn sentence_spans_for(chunk: &Chunk) -> Vec<(usize, usize)> {
    if chunk.content_type != ContentType::Code {
        return text::sentence_spans(&chunk.text);
    }
    let mut spans = Vec::new();
    let mut offset = 0;
    for block in chunk.text.split("\n\n") {
        let leading = block.len() - block.trim_start().len();
        let trimmed = block.trim();
        if !trimmed.is_empty() {
            let start = offset + leading;
            spans.push((start, start + trimmed.len()));
        }
        offset += block.len() + 2;
    }
    spans
}

/// Score descending, then arena index ascending
fn sort_scored(items: &mut [(usize, f32)]) {
    items.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use lodestar_common::embeddings::HashingEmbedder;
    use lodestar_common::models::{LineRange, TextSpan};

    pub const DIM: usize = 256;

    /// Chunk with a hashing embedding; quality fields fixed at 1.0
    pub fn chunk(doc: &str, path: &str, section: usize, offset: usize, text: &str, content_type: ContentType) -> Arc<Chunk> {
        let document_id = DocumentId::new(doc);
        let span = TextSpan::new(offset, offset + text.len());
        Arc::new(Chunk {
            id: ChunkId::derive(&document_id, span),
            document_id,
            section_index: section,
            path: path.to_string(),
            span,
            lines: LineRange::new(1 + offset, 1 + offset + text.lines().count().saturating_sub(1)),
            content_type,
            text: text.to_string(),
            quality_score: 1.0,
            boundary_clarity: 1.0,
            stickiness: 1.0,
            embedding: HashingEmbedder::new(DIM).embed_sync(text),
        })
    }

    pub fn entry(doc: &str, path: &str, chunks: &[(&str, ContentType)]) -> IndexEntry {
        let document = Document::from_text(doc, path, chunks.iter().map(|(t, _)| *t).collect::<Vec<_>>().join("\n\n"));
        IndexEntry {
            document: Arc::new(document),
            chunks: chunks
                .iter()
                .enumerate()
                .map(|(i, (t, ct))| chunk(doc, path, 0, i * 1000, t, *ct))
                .collect(),
        }
    }

    /// Lexical-only probe, so level scores depend on term overlap alone
    pub fn probe(query: &str) -> QueryProbe {
        QueryProbe::new(query, &[], Vec::new())
    }

    pub fn dense_probe(query: &str) -> QueryProbe {
        QueryProbe::new(query, &[], HashingEmbedder::new(DIM).embed_sync(query))
    }

    /// README / ARCHITECTURE / engine corpus with cross-references
    pub fn corpus() -> HierarchicalIndex {
        HierarchicalIndex::build(
            1,
            vec![
                entry(
                    "readme",
                    "README.md",
                    &[
                        ("GRID is a distributed job scheduler. See ARCHITECTURE.md for the design.", ContentType::Prose),
                        ("Install with pip and run the grid command.", ContentType::Prose),
                    ],
                ),
                entry(
                    "architecture",
                    "ARCHITECTURE.md",
                    &[(
                        "The GRID architecture has three layers. The `GridEngine` coordinates workers.",
                        ContentType::Prose,
                    )],
                ),
                entry(
                    "engine",
                    "src/engine.py",
                    &[(
                        "class GridEngine:\n    def schedule(self, job):\n        return self.workers.pick(job)",
                        ContentType::Code,
                    )],
                ),
                entry(
                    "recipes",
                    "recipes.md",
                    &[("Banana bread needs ripe bananas and flour.", ContentType::Prose)],
                ),
            ],
            IndexConfig::default(),
        )
    }
}
