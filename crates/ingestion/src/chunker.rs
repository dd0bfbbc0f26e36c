//! Content-aware chunking with quality scoring
//!
//! Each document section is split by a strategy picked from a fixed table
//! keyed on content type, then every chunk is scored:
//!
//! `quality = 0.5 * boundary_clarity + 0.5 * stickiness`
//!
//! Boundary clarity rates the split points (1.0 on a paragraph or sentence
//! end, 0.0 mid-token). Stickiness is the mean pairwise cosine of the
//! chunk's sentence embeddings, with negative pairs counted as 0.
//! Chunks below `quality_threshold` never reach the index.

use lodestar_common::config::ChunkingConfig;
use lodestar_common::embeddings::Embedder;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::models::{
    is_list_line, is_table_line, Chunk, ChunkId, ContentType, Document, LineRange, TextSpan,
};
use lodestar_common::text;
use std::collections::HashSet;
use text_splitter::TextSplitter;
use tracing::{debug, info, warn};

/// Pairs sampled for stickiness are bounded by this many units per chunk
const MAX_STICKINESS_UNITS: usize = 24;

/// Chunking strategy, chosen by content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// Line windows with overlap (code)
    FixedWithOverlap,
    /// Paragraph/sentence grouping split where topics change (prose)
    SemanticBoundary,
    /// Row groups that never split a row (tables)
    CellAware,
    /// Item groups that never split an item (lists)
    Structured,
    /// Segment into typed blocks, then apply the matching strategy per block
    Hierarchical,
}

impl ChunkingStrategy {
    pub fn for_content(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Code => ChunkingStrategy::FixedWithOverlap,
            ContentType::Prose => ChunkingStrategy::SemanticBoundary,
            ContentType::Table => ChunkingStrategy::CellAware,
            ContentType::List => ChunkingStrategy::Structured,
            ContentType::Mixed => ChunkingStrategy::Hierarchical,
        }
    }
}

/// A chunk boundary plan before embedding and scoring
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub section_index: usize,
    /// Span within the section text
    pub span: TextSpan,
    pub lines: LineRange,
    pub content_type: ContentType,
    pub text: String,
    pub boundary_clarity: f32,
    /// Coherence units (sentences, rows, items or code blocks)
    pub units: Vec<String>,
}

/// Result of chunking one document
#[derive(Debug, Clone, Default)]
pub struct ChunkingOutcome {
    /// Chunks at or above the quality threshold, in document order
    pub chunks: Vec<Chunk>,
    /// Chunks dropped by the quality threshold
    pub rejected: usize,
    /// Stickiness came from term overlap because embedding failed
    pub scored_lexically: bool,
}

pub struct ChunkingEngine {
    config: ChunkingConfig,
}

impl ChunkingEngine {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split, embed and score a document
    ///
    /// All unit and chunk texts go to the embedder in a single batch. If the
    /// embedder is unavailable, stickiness falls back to lexical overlap and
    /// the chunks carry no embedding.
    pub async fn chunk_document(&self, document: &Document, embedder: &dyn Embedder) -> Result<ChunkingOutcome> {
        let planned = self.plan(document);
        if planned.is_empty() {
            return Ok(ChunkingOutcome::default());
        }

        let inputs = embedding_inputs(&planned);
        match embedder.embed_batch(&inputs).await {
            Ok(embeddings) => self.assemble(document, planned, embeddings),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(
                    document_id = %document.id,
                    error = %e,
                    "Embedder unavailable, scoring stickiness lexically"
                );
                Ok(self.score_lexical(document, planned))
            }
        }
    }

    /// Pair planned chunks with the embeddings of [`embedding_inputs`] and score them
    pub fn assemble(
        &self,
        document: &Document,
        planned: Vec<PlannedChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<ChunkingOutcome> {
        let expected: usize = planned
            .iter()
            .map(|c| 1 + c.units.len().min(MAX_STICKINESS_UNITS))
            .sum();
        if embeddings.len() != expected {
            return Err(AppError::Indexing {
                message: format!(
                    "Embedder returned {} vectors for {} inputs",
                    embeddings.len(),
                    expected
                ),
            });
        }

        let mut cursor = embeddings.into_iter();
        let mut scored = Vec::with_capacity(planned.len());
        for chunk in planned {
            let chunk_embedding = cursor.next().unwrap_or_default();
            let unit_count = chunk.units.len().min(MAX_STICKINESS_UNITS);
            let unit_embeddings: Vec<Vec<f32>> = cursor.by_ref().take(unit_count).collect();
            scored.push((chunk, chunk_embedding, unit_embeddings));
        }

        Ok(self.score(document, scored))
    }

    /// Apply quality scoring and the threshold to planned chunks
    pub fn score(
        &self,
        document: &Document,
        planned: Vec<(PlannedChunk, Vec<f32>, Vec<Vec<f32>>)>,
    ) -> ChunkingOutcome {
        let mut outcome = ChunkingOutcome::default();
        let section_bases = section_offsets(document);
        for (plan, embedding, unit_embeddings) in planned {
            let stickiness = stickiness(&unit_embeddings);
            self.accept(document, &section_bases, plan, embedding, stickiness, &mut outcome);
        }
        self.log_outcome(document, &outcome);
        outcome
    }

    /// Score without embeddings: stickiness from pairwise term overlap
    pub fn score_lexical(&self, document: &Document, planned: Vec<PlannedChunk>) -> ChunkingOutcome {
        let mut outcome = ChunkingOutcome {
            scored_lexically: true,
            ..ChunkingOutcome::default()
        };
        let section_bases = section_offsets(document);
        for plan in planned {
            let units: Vec<&str> = plan.units.iter().take(MAX_STICKINESS_UNITS).map(String::as_str).collect();
            let stickiness = lexical_stickiness(&units);
            self.accept(document, &section_bases, plan, Vec::new(), stickiness, &mut outcome);
        }
        self.log_outcome(document, &outcome);
        outcome
    }

    fn accept(
        &self,
        document: &Document,
        section_bases: &[usize],
        plan: PlannedChunk,
        embedding: Vec<f32>,
        stickiness: f32,
        outcome: &mut ChunkingOutcome,
    ) {
        let quality = (0.5 * plan.boundary_clarity + 0.5 * stickiness).clamp(0.0, 1.0);

        if quality < self.config.quality_threshold {
            debug!(
                document_id = %document.id,
                lines = %plan.lines,
                quality = quality,
                boundary_clarity = plan.boundary_clarity,
                stickiness = stickiness,
                "Chunk rejected by quality threshold"
            );
            outcome.rejected += 1;
            return;
        }

        let base = section_bases.get(plan.section_index).copied().unwrap_or(0);
        let global = TextSpan::new(base + plan.span.start, base + plan.span.end);

        outcome.chunks.push(Chunk {
            id: ChunkId::derive(&document.id, global),
            document_id: document.id.clone(),
            section_index: plan.section_index,
            path: document.path.clone(),
            span: plan.span,
            lines: plan.lines,
            content_type: plan.content_type,
            text: plan.text,
            quality_score: quality,
            boundary_clarity: plan.boundary_clarity,
            stickiness,
            embedding,
        });
    }

    fn log_outcome(&self, document: &Document, outcome: &ChunkingOutcome) {
        info!(
            document_id = %document.id,
            accepted = outcome.chunks.len(),
            rejected = outcome.rejected,
            "Document chunked"
        );
    }

    /// Plan chunk boundaries for every section (no embedding)
    pub fn plan(&self, document: &Document) -> Vec<PlannedChunk> {
        let strategy = ChunkingStrategy::for_content(document.content_type);
        let mut planned = Vec::new();

        for (section_index, section) in document.sections.iter().enumerate() {
            let text = section.text.as_str();
            if text.trim().is_empty() {
                continue;
            }

            let drafts = match strategy {
                ChunkingStrategy::Hierarchical => segment_blocks(text)
                    .into_iter()
                    .flat_map(|block| self.split_block(text, block.kind, block.start, block.end))
                    .collect(),
                _ => {
                    let kind = match strategy {
                        ChunkingStrategy::FixedWithOverlap => ContentType::Code,
                        ChunkingStrategy::CellAware => ContentType::Table,
                        ChunkingStrategy::Structured => ContentType::List,
                        _ => ContentType::Prose,
                    };
                    self.split_block(text, kind, 0, text.len())
                }
            };

            for draft in drafts {
                let chunk_text = &text[draft.start..draft.end];
                if chunk_text.trim().is_empty() {
                    continue;
                }
                let first = section.start_line + text::line_offset(text, draft.start);
                let last = section.start_line + text::line_offset(text, draft.end.saturating_sub(1).max(draft.start));
                let clarity = (boundary_score(text, draft.start) + boundary_score(text, draft.end)) / 2.0;

                planned.push(PlannedChunk {
                    section_index,
                    span: TextSpan::new(draft.start, draft.end),
                    lines: LineRange::new(first, last),
                    content_type: draft.kind,
                    text: chunk_text.to_string(),
                    boundary_clarity: clarity,
                    units: coherence_units(chunk_text, draft.kind),
                });
            }
        }

        planned
    }

    fn split_block(&self, text: &str, kind: ContentType, start: usize, end: usize) -> Vec<Draft> {
        match kind {
            ContentType::Code => self.split_code(text, start, end),
            ContentType::Table => self.split_rows(text, start, end),
            ContentType::List => self.split_items(text, start, end),
            ContentType::Prose | ContentType::Mixed => self.split_prose(text, start, end),
        }
    }

    fn split_code(&self, text: &str, start: usize, end: usize) -> Vec<Draft> {
        let lines = line_spans(text, start, end);
        if lines.is_empty() {
            return Vec::new();
        }

        let window = self.config.code_window_lines.max(1);
        let overlap = self.config.code_overlap_lines.min(window.saturating_sub(1));
        if lines.len() <= window {
            return vec![trimmed_draft(text, lines[0].0, lines[lines.len() - 1].1, ContentType::Code)];
        }

        let mut drafts = Vec::new();
        let mut first = 0;
        loop {
            let mut last = (first + window).min(lines.len()) - 1;
            if last + 1 < lines.len() {
                // Prefer ending right before a top-level statement
                let floor = last.saturating_sub(overlap).max(first);
                if let Some(snap) = (floor..=last).rev().find(|&i| starts_top_level(text, lines[i + 1].0)) {
                    last = snap;
                }
            }
            drafts.push(trimmed_draft(text, lines[first].0, lines[last].1, ContentType::Code));
            if last + 1 >= lines.len() {
                break;
            }
            first = (last + 1).saturating_sub(overlap).max(first + 1);
        }
        drafts
    }

    fn split_rows(&self, text: &str, start: usize, end: usize) -> Vec<Draft> {
        let rows: Vec<(usize, usize)> = line_spans(text, start, end)
            .into_iter()
            .filter(|(s, e)| !text[*s..*e].trim().is_empty())
            .collect();
        let per_chunk = self.config.table_rows_per_chunk.max(1);

        let mut drafts = Vec::new();
        let mut i = 0;
        while i < rows.len() {
            // The first group carries the header and separator rows
            let take = if i == 0 { per_chunk + 2 } else { per_chunk };
            let last = (i + take).min(rows.len()) - 1;
            drafts.push(trimmed_draft(text, rows[i].0, rows[last].1, ContentType::Table));
            i = last + 1;
        }
        drafts
    }

    fn split_items(&self, text: &str, start: usize, end: usize) -> Vec<Draft> {
        let mut items: Vec<(usize, usize)> = Vec::new();
        for (s, e) in line_spans(text, start, end) {
            let line = &text[s..e];
            if line.trim().is_empty() {
                continue;
            }
            match items.last_mut() {
                Some(item) if !is_list_line(line) => item.1 = e,
                _ => items.push((s, e)),
            }
        }

        let per_chunk = self.config.list_items_per_chunk.max(1);
        let max_chars = self.config.max_chunk_chars.max(1);
        let mut drafts = Vec::new();
        let mut group: Option<(usize, usize, usize)> = None;

        for (s, e) in items {
            group = match group {
                Some((gs, ge, n)) if n < per_chunk && e - gs <= max_chars => Some((gs, e.max(ge), n + 1)),
                Some((gs, ge, _)) => {
                    drafts.push(trimmed_draft(text, gs, ge, ContentType::List));
                    Some((s, e, 1))
                }
                None => Some((s, e, 1)),
            };
        }
        if let Some((gs, ge, _)) = group {
            drafts.push(trimmed_draft(text, gs, ge, ContentType::List));
        }
        drafts
    }

    fn split_prose(&self, text: &str, start: usize, end: usize) -> Vec<Draft> {
        let max_chars = self.config.max_chunk_chars.max(1);

        // Units: paragraphs, broken down to sentences or splitter pieces when oversized
        let mut units: Vec<(usize, usize)> = Vec::new();
        for (ps, pe) in paragraph_spans(text, start, end) {
            if pe - ps <= max_chars {
                units.push((ps, pe));
                continue;
            }
            for (ss, se) in text::sentence_spans(&text[ps..pe]) {
                let (ss, se) = (ps + ss, ps + se);
                if se - ss <= max_chars {
                    units.push((ss, se));
                } else {
                    let splitter = TextSplitter::new(max_chars);
                    for (offset, piece) in splitter.chunk_indices(&text[ss..se]) {
                        units.push((ss + offset, ss + offset + piece.len()));
                    }
                }
            }
        }

        let mut drafts: Vec<Draft> = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (us, ue) in units {
            current = match current {
                Some((cs, ce)) => {
                    let fits = ue - cs <= max_chars;
                    let short = ce - cs < self.config.min_chunk_chars;
                    let cohesive = lexical_overlap(&text[cs..ce], &text[us..ue])
                        >= self.config.semantic_break_threshold;
                    if fits && (short || cohesive) {
                        Some((cs, ue))
                    } else {
                        drafts.push(trimmed_draft(text, cs, ce, ContentType::Prose));
                        Some((us, ue))
                    }
                }
                None => Some((us, ue)),
            };
        }
        if let Some((cs, ce)) = current {
            drafts.push(trimmed_draft(text, cs, ce, ContentType::Prose));
        }
        drafts
    }
}

#[derive(Debug, Clone, Copy)]
struct Draft {
    start: usize,
    end: usize,
    kind: ContentType,
}

fn trimmed_draft(text: &str, start: usize, end: usize, kind: ContentType) -> Draft {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    Draft {
        start: start + leading,
        end: (end - trailing).max(start + leading),
        kind,
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    kind: ContentType,
    start: usize,
    end: usize,
}

/// Segment mixed text into contiguous typed blocks
fn segment_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut in_fence = false;

    for (s, e) in line_spans(text, 0, text.len()) {
        let line = &text[s..e];
        let fence = line.trim_start().starts_with("```");

        let kind = if in_fence || fence {
            ContentType::Code
        } else if line.trim().is_empty() {
            // Blank lines belong to whatever block is open
            if let Some(block) = blocks.last_mut() {
                block.end = e;
            }
            continue;
        } else if is_table_line(line) {
            ContentType::Table
        } else if is_list_line(line) {
            ContentType::List
        } else if line.starts_with("  ") && matches!(blocks.last(), Some(b) if b.kind == ContentType::List) {
            ContentType::List
        } else {
            ContentType::Prose
        };

        if fence {
            in_fence = !in_fence;
        }

        match blocks.last_mut() {
            // An opening fence always starts a new block
            Some(block) if block.kind == kind && !(fence && in_fence && kind == ContentType::Code) => {
                block.end = e
            }
            _ => blocks.push(Block { kind, start: s, end: e }),
        }
    }

    blocks
}

/// Byte spans of lines in `text[start..end]`, excluding newlines
fn line_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = start;
    for line in text[start..end].split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        spans.push((cursor, cursor + content.len()));
        cursor += line.len();
    }
    spans
}

/// Paragraph spans (separated by blank lines), trimmed
fn paragraph_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut paragraphs = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    for (s, e) in line_spans(text, start, end) {
        if text[s..e].trim().is_empty() {
            if let Some(p) = open.take() {
                paragraphs.push(p);
            }
        } else {
            open = Some(match open {
                Some((ps, _)) => (ps, e),
                None => (s, e),
            });
        }
    }
    if let Some(p) = open {
        paragraphs.push(p);
    }
    paragraphs
        .into_iter()
        .map(|(s, e)| {
            let d = trimmed_draft(text, s, e, ContentType::Prose);
            (d.start, d.end)
        })
        .filter(|(s, e)| s < e)
        .collect()
}

fn starts_top_level(text: &str, line_start: usize) -> bool {
    text[line_start..]
        .chars()
        .next()
        .is_some_and(|c| !c.is_whitespace() && c != '}' && c != ')')
}

/// Jaccard overlap of key terms
fn lexical_overlap(a: &str, b: &str) -> f32 {
    let a: HashSet<String> = text::key_terms(a).into_iter().collect();
    let b: HashSet<String> = text::key_terms(b).into_iter().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f32;
    shared / a.union(&b).count() as f32
}

/// Score a split point in `text` from 0.0 (mid-token) to 1.0 (paragraph/sentence end)
pub fn boundary_score(text: &str, offset: usize) -> f32 {
    if offset == 0 || offset >= text.len() || !text.is_char_boundary(offset) {
        return if offset == 0 || offset >= text.len() { 1.0 } else { 0.0 };
    }

    let before = &text[..offset];
    let after = &text[offset..];
    let before_trim = before.trim_end_matches([' ', '\t', '\r']);
    let after_trim = after.trim_start_matches([' ', '\t', '\r']);

    // Paragraph or end of text on either side
    if before_trim.ends_with("\n\n")
        || after_trim.starts_with("\n\n")
        || (before_trim.ends_with('\n') && after_trim.starts_with('\n'))
        || after.trim().is_empty()
        || before.trim().is_empty()
    {
        return 1.0;
    }

    let last = before_trim.trim_end_matches('\n').chars().last();
    let at_whitespace = before.ends_with(char::is_whitespace) || after.starts_with(char::is_whitespace);

    if at_whitespace && matches!(last, Some('.' | '!' | '?' | ':' | ';' | '`' | '}')) {
        return 1.0;
    }

    let at_line = before_trim.ends_with('\n') || after_trim.starts_with('\n');
    if at_line {
        let next_line = after_trim.trim_start_matches('\n');
        return if next_line.starts_with(|c: char| !c.is_whitespace()) { 0.9 } else { 0.7 };
    }

    if at_whitespace {
        0.4
    } else if matches!(last, Some(c) if c.is_ascii_punctuation()) {
        0.3
    } else {
        0.0
    }
}

/// Units whose mutual similarity defines stickiness
fn coherence_units(chunk_text: &str, kind: ContentType) -> Vec<String> {
    let units: Vec<&str> = match kind {
        ContentType::Prose | ContentType::Mixed => text::split_sentences(chunk_text),
        ContentType::Table => chunk_text
            .lines()
            .filter(|l| is_table_line(l) && !l.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ')))
            .collect(),
        ContentType::List => {
            let mut items: Vec<&str> = Vec::new();
            let mut start: Option<usize> = None;
            for (s, _) in line_spans(chunk_text, 0, chunk_text.len()) {
                if is_list_line(&chunk_text[s..]) {
                    if let Some(prev) = start {
                        items.push(chunk_text[prev..s].trim());
                    }
                    start = Some(s);
                }
            }
            if let Some(prev) = start {
                items.push(chunk_text[prev..].trim());
            }
            items
        }
        ContentType::Code => chunk_text
            .split("\n\n")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect(),
    };
    units
        .into_iter()
        .filter(|u| !u.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Mean pairwise cosine of unit embeddings, negatives clamped to 0; 1.0 for fewer than two units
pub fn stickiness(embeddings: &[Vec<f32>]) -> f32 {
    if embeddings.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            total += text::cosine_similarity(&embeddings[i], &embeddings[j]).max(0.0);
            pairs += 1;
        }
    }
    (total / pairs as f32).clamp(0.0, 1.0)
}

/// Texts to embed for planned chunks: each chunk followed by its units
pub fn embedding_inputs(planned: &[PlannedChunk]) -> Vec<String> {
    let mut inputs = Vec::new();
    for chunk in planned {
        inputs.push(chunk.text.clone());
        inputs.extend(chunk.units.iter().take(MAX_STICKINESS_UNITS).cloned());
    }
    inputs
}

/// Mean pairwise Jaccard overlap of key terms; 1.0 for fewer than two units
pub fn lexical_stickiness(units: &[&str]) -> f32 {
    if units.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for i in 0..units.len() {
        for j in (i + 1)..units.len() {
            total += lexical_overlap(units[i], units[j]);
            pairs += 1;
        }
    }
    (total / pairs as f32).clamp(0.0, 1.0)
}

fn section_offsets(document: &Document) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(document.sections.len());
    let mut base = 0;
    for section in &document.sections {
        offsets.push(base);
        base += section.text.len();
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_common::embeddings::HashingEmbedder;

    fn engine() -> ChunkingEngine {
        ChunkingEngine::new(ChunkingConfig::default())
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(ChunkingStrategy::for_content(ContentType::Code), ChunkingStrategy::FixedWithOverlap);
        assert_eq!(ChunkingStrategy::for_content(ContentType::Prose), ChunkingStrategy::SemanticBoundary);
        assert_eq!(ChunkingStrategy::for_content(ContentType::Table), ChunkingStrategy::CellAware);
        assert_eq!(ChunkingStrategy::for_content(ContentType::List), ChunkingStrategy::Structured);
        assert_eq!(ChunkingStrategy::for_content(ContentType::Mixed), ChunkingStrategy::Hierarchical);
    }

    #[test]
    fn test_boundary_scores() {
        let text = "First sentence. Second sentence\n\nNew paragraph";
        assert_eq!(boundary_score(text, 0), 1.0);
        assert_eq!(boundary_score(text, text.len()), 1.0);
        // After "First sentence."
        assert_eq!(boundary_score(text, 15), 1.0);
        // Between "Second" and "sentence"
        assert_eq!(boundary_score(text, 23), 0.4);
        // Inside "Second"
        assert_eq!(boundary_score(text, 19), 0.0);
        // Paragraph break
        assert_eq!(boundary_score(text, text.find("New").unwrap()), 1.0);
    }

    #[test]
    fn test_stickiness() {
        assert_eq!(stickiness(&[]), 1.0);
        assert_eq!(stickiness(&[vec![1.0, 0.0]]), 1.0);
        let same = stickiness(&[vec![1.0, 0.0], vec![1.0, 0.0]]);
        let orthogonal = stickiness(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let opposite = stickiness(&[vec![1.0, 0.0], vec![-1.0, 0.0]]);
        assert!((same - 1.0).abs() < 1e-6);
        assert!(orthogonal.abs() < 1e-6);
        assert!(opposite.abs() < 1e-6);
        let mixed = stickiness(&[vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!((mixed - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_code_windows_overlap() {
        let body: String = (0..100).map(|i| format!("    x{} = compute({})\n", i, i)).collect();
        let source = format!("def run():\n{}", body);
        let doc = Document::from_text("d", "run.py", source);
        let planned = engine().plan(&doc);
        assert!(planned.len() >= 3);
        for pair in planned.windows(2) {
            assert!(pair[1].lines.start <= pair[0].lines.end, "windows should overlap");
            assert!(pair[1].lines.start > pair[0].lines.start);
        }
        assert!(planned.iter().all(|c| c.content_type == ContentType::Code));
    }

    #[test]
    fn test_small_code_file_is_one_clean_chunk() {
        let doc = Document::from_text("e", "engine.py", "class Engine:\n    def run(self):\n        return 1\n");
        let planned = engine().plan(&doc);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].boundary_clarity, 1.0);
        assert_eq!(planned[0].lines, LineRange::new(1, 3));
    }

    #[test]
    fn test_table_rows_are_never_split() {
        let mut table = String::from("| name | value |\n|---|---|\n");
        for i in 0..45 {
            table.push_str(&format!("| key{} | {} |\n", i, i));
        }
        let doc = Document::from_text("t", "data.csv", table);
        let planned = engine().plan(&doc);
        assert_eq!(planned.len(), 3);
        for chunk in &planned {
            assert!(chunk.text.lines().all(is_table_line));
        }
        assert!(planned[0].text.starts_with("| name |"));
    }

    #[test]
    fn test_list_items_keep_continuations() {
        let text = "- first item\n  continues here\n- second item\n- third item\n";
        let doc = Document {
            content_type: ContentType::List,
            ..Document::from_text("l", "notes", text)
        };
        let planned = engine().plan(&doc);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].units.len(), 3);
        assert!(planned[0].units[0].contains("continues here"));
    }

    #[test]
    fn test_mixed_document_is_segmented_by_block_type() {
        let text = "# Engine\n\nThe engine schedules jobs.\n\n```python\ndef run():\n    pass\n```\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n- item one\n- item two\n";
        let doc = Document::from_markdown("m", "README.md", text);
        let planned = engine().plan(&doc);
        let kinds: Vec<ContentType> = planned.iter().map(|c| c.content_type).collect();
        assert_eq!(
            kinds,
            vec![ContentType::Prose, ContentType::Code, ContentType::Table, ContentType::List]
        );
        assert!(planned[1].text.starts_with("```python"));
        assert!(planned[1].text.ends_with("```"));
    }

    #[test]
    fn test_prose_splits_on_topic_change() {
        let config = ChunkingConfig {
            min_chunk_chars: 10,
            ..ChunkingConfig::default()
        };
        let text = "The scheduler assigns jobs to workers. The scheduler retries failed jobs.\n\nBananas are yellow fruit grown in warm climates.";
        let doc = Document::from_text("p", "notes.txt", text);
        let planned = ChunkingEngine::new(config).plan(&doc);
        assert_eq!(planned.len(), 2);
        assert!(planned[0].text.contains("retries"));
        assert!(planned[1].text.starts_with("Bananas"));
    }

    #[tokio::test]
    async fn test_chunk_document_scores_and_filters() {
        let embedder = HashingEmbedder::new(128);
        let doc = Document::from_markdown(
            "readme",
            "README.md",
            "# GRID\n\nGRID is a distributed scheduler. GRID routes jobs to workers.\n",
        );
        let outcome = engine().chunk_document(&doc, &embedder).await.unwrap();
        assert!(!outcome.scored_lexically);
        assert_eq!(outcome.rejected, 0);
        assert_eq!(outcome.chunks.len(), 1);
        let chunk = &outcome.chunks[0];
        assert!(chunk.quality_score >= 0.6 && chunk.quality_score <= 1.0);
        assert_eq!(chunk.embedding.len(), 128);
        assert_eq!(chunk.lines.start, 1);
    }

    #[tokio::test]
    async fn test_embedder_outage_scores_lexically() {
        struct Offline;

        #[async_trait::async_trait]
        impl Embedder for Offline {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Err(AppError::EmbeddingUnavailable { message: "offline".into() })
            }
            async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Err(AppError::EmbeddingUnavailable { message: "offline".into() })
            }
            fn model_name(&self) -> &str {
                "offline"
            }
            fn dimension(&self) -> usize {
                8
            }
        }

        let doc = Document::from_text(
            "notes",
            "notes.txt",
            "The scheduler assigns jobs to workers. The scheduler retries failed jobs.",
        );
        let outcome = engine().chunk_document(&doc, &Offline).await.unwrap();
        assert_eq!(outcome.chunks.len(), 1);
        assert!(outcome.scored_lexically);
        assert!(outcome.chunks[0].embedding.is_empty());
        // {scheduler, job} shared out of {scheduler, assign, job, worker, retry, failed}
        assert!((outcome.chunks[0].stickiness - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_lexical_stickiness() {
        assert_eq!(lexical_stickiness(&["only one"]), 1.0);
        assert_eq!(lexical_stickiness(&["apples oranges", "trucks engines"]), 0.0);
        assert!((lexical_stickiness(&["grid scheduler", "grid workers"]) - 1.0 / 3.0).abs() < 1e-6);
        assert!((lexical_stickiness(&["grid scheduler", "grid scheduler"]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_assemble_rejects_mismatched_embeddings() {
        let doc = Document::from_text("p", "notes.txt", "One sentence here. Another sentence there.");
        let planned = engine().plan(&doc);
        let result = engine().assemble(&doc, planned, vec![vec![1.0]]);
        assert!(matches!(result, Err(AppError::Indexing { .. })));
    }

    #[tokio::test]
    async fn test_incoherent_chunk_is_rejected() {
        let embedder = HashingEmbedder::new(384);
        // Clean boundaries, but the sentences share no terms
        let doc = Document::from_text(
            "notes",
            "notes.txt",
            "Bananas ripen quickly in warm kitchens. Compilers translate source code into machine instructions.",
        );
        let outcome = engine().chunk_document(&doc, &embedder).await.unwrap();
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_threshold_drops_low_quality_chunks() {
        let doc = Document::from_text("x", "x.txt", "alpha beta");
        let plan = PlannedChunk {
            section_index: 0,
            span: TextSpan::new(0, 10),
            lines: LineRange::new(1, 1),
            content_type: ContentType::Prose,
            text: "alpha beta".into(),
            boundary_clarity: 0.0,
            units: vec!["alpha".into(), "beta".into()],
        };
        // Opposite unit embeddings: stickiness 0, clarity 0
        let outcome = engine().score(&doc, vec![(plan, vec![1.0], vec![vec![1.0], vec![-1.0]])]);
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.rejected, 1);
    }
}
