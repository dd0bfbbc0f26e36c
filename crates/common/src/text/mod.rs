//! Text utilities shared by chunking, indexing and evidence extraction
//!
//! Provides:
//! - Tokenization and stop-word filtering
//! - Sentence segmentation with byte spans
//! - Cross-reference extraction (imports, links, paths, symbols)
//! - Vector similarity helpers

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "and", "or", "but", "not", "this", "that", "these",
    "those", "it", "its", "as", "do", "does", "did", "has", "have", "had", "can", "could",
    "will", "would", "should", "may", "might", "what", "which", "who", "whom", "how", "why",
    "when", "where", "there", "here", "into", "about", "over", "than", "then", "so", "if",
    "any", "all", "some", "such", "our", "your", "their", "his", "her", "we", "you", "they",
    "them", "i", "me", "my", "us", "also", "just", "only", "very", "each", "other", "use",
    "uses", "used", "using", "via", "per", "get", "gets",
];

/// Whether a lower-cased token is a stop word
pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lower-case word tokens (alphanumeric and underscore), at least 2 chars
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Light plural folding so "chunks" and "chunk" match
pub fn stem(token: &str) -> String {
    if token.len() > 4 && token.ends_with("ies") {
        format!("{}y", &token[..token.len() - 3])
    } else if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") && !token.ends_with("us") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Stemmed, stop-word-free, de-duplicated terms in first-seen order
pub fn key_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stop_word(t))
        .map(|t| stem(&t))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Split text into sentence spans (byte offsets, trimmed)
///
/// Breaks after `.`, `!` or `?` followed by whitespace, and at blank lines.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let terminal = matches!(b, b'.' | b'!' | b'?')
            && (i + 1 == bytes.len() || bytes[i + 1].is_ascii_whitespace());
        let blank_line = b == b'\n' && i + 1 < bytes.len() && bytes[i + 1] == b'\n';

        if terminal || blank_line {
            let end = if terminal { i + 1 } else { i };
            push_trimmed(text, start, end, &mut spans);
            start = end;
        }
        i += 1;
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    if start >= end {
        return;
    }
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    let (s, e) = (start + leading, end - trailing);
    if s < e {
        spans.push((s, e));
    }
}

/// Split text into trimmed sentences
pub fn split_sentences(text: &str) -> Vec<&str> {
    sentence_spans(text).into_iter().map(|(s, e)| &text[s..e]).collect()
}

/// Count of newlines before `offset`
pub fn line_offset(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
}

/// Kind of an explicit cross-reference found in text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Import,
    Link,
    Path,
    Symbol,
}

/// Explicit reference to another module, file, URL or symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrossReference {
    pub kind: ReferenceKind,
    pub target: String,
}

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn import_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(
        &CELL,
        r"(?m)^\s*(?:from\s+([\w\.]+)\s+import|import\s+([\w\.]+)|use\s+(\w+::[\w:]+))",
    )
}

fn link_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(&CELL, r"\[[^\]]*\]\(([^)\s]+)\)|(https?://[^\s)>\]]+)")
}

fn path_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(
        &CELL,
        r"\b([\w\-/\.]*\w\.(?:py|rs|md|js|ts|go|java|toml|yaml|yml|json|txt))\b",
    )
}

fn symbol_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(
        &CELL,
        r"`([A-Za-z_][\w:\.]*)(?:\(\))?`|\b([A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+)\b",
    )
}

fn definition_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    cached(
        &CELL,
        r"(?m)^\s*(?:pub(?:\([\w:]+\))?\s+)?(?:export\s+)?(?:async\s+)?(?:def|class|fn|struct|enum|trait|interface|function|type|impl)\s+([A-Za-z_]\w*)",
    )
}

/// Names of symbols defined in source text (functions, classes, types)
pub fn defined_symbols(text: &str) -> Vec<String> {
    let mut names: Vec<String> = definition_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Extract explicit cross-references from text, de-duplicated and sorted
pub fn extract_references(text: &str) -> Vec<CrossReference> {
    let mut refs: HashSet<CrossReference> = HashSet::new();

    for caps in import_regex().captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
            refs.insert(CrossReference {
                kind: ReferenceKind::Import,
                target: m.as_str().trim_end_matches(';').to_string(),
            });
        }
    }

    for caps in link_regex().captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            refs.insert(CrossReference {
                kind: ReferenceKind::Link,
                target: m.as_str().to_string(),
            });
        }
    }

    for caps in path_regex().captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let target = m.as_str();
            if !target.starts_with("http") && !target.contains("//") {
                refs.insert(CrossReference {
                    kind: ReferenceKind::Path,
                    target: target.to_string(),
                });
            }
        }
    }

    for caps in symbol_regex().captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let target = m.as_str();
            // Backticked file names are already captured as paths
            if !path_regex().is_match(target) {
                refs.insert(CrossReference {
                    kind: ReferenceKind::Symbol,
                    target: target.to_string(),
                });
            }
        }
    }

    let mut refs: Vec<CrossReference> = refs.into_iter().collect();
    refs.sort();
    refs
}

/// Cosine similarity in [-1, 1]; 0.0 for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Element-wise mean of vectors of equal length
pub fn mean_vector(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.iter().find(|v| !v.is_empty()) else {
        return Vec::new();
    };
    let dim = first.len();
    let mut sum = vec![0.0f32; dim];
    let mut count = 0usize;
    for v in vectors.iter().filter(|v| v.len() == dim) {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += x;
        }
        count += 1;
    }
    if count > 0 {
        for acc in &mut sum {
            *acc /= count as f32;
        }
    }
    sum
}

/// Share of `terms` present in `text_terms`
pub fn term_coverage(terms: &[String], text_terms: &HashSet<String>) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms.iter().filter(|t| text_terms.contains(*t)).count();
    hits as f32 / terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_terms_filter_and_stem() {
        let terms = key_terms("What is the GRID architecture? The chunks are ranked.");
        assert_eq!(terms, vec!["grid", "architecture", "chunk", "ranked"]);
    }

    #[test]
    fn test_sentence_spans() {
        let text = "First sentence. Second one!\n\nThird part";
        let sentences = split_sentences(text);
        assert_eq!(sentences, vec!["First sentence.", "Second one!", "Third part"]);
    }

    #[test]
    fn test_sentence_spans_ignore_decimal_points() {
        let sentences = split_sentences("Version 2.5 is stable. Done.");
        assert_eq!(sentences, vec!["Version 2.5 is stable.", "Done."]);
    }

    #[test]
    fn test_extract_references() {
        let text = "from grid.scheduler import Scheduler\nimport numpy\nSee [design](ARCHITECTURE.md) and `GridEngine`.\nAlso engine.py.";
        let refs = extract_references(text);
        let has = |kind, target: &str| refs.iter().any(|r| r.kind == kind && r.target == target);
        assert!(has(ReferenceKind::Import, "grid.scheduler"));
        assert!(has(ReferenceKind::Import, "numpy"));
        assert!(has(ReferenceKind::Link, "ARCHITECTURE.md"));
        assert!(has(ReferenceKind::Path, "engine.py"));
        assert!(has(ReferenceKind::Symbol, "GridEngine"));
    }

    #[test]
    fn test_defined_symbols() {
        let code = "class GridEngine:\n    def run(self):\n        pass\n\npub fn schedule() {}\nlet x = 1;";
        assert_eq!(defined_symbols(code), vec!["GridEngine", "run", "schedule"]);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_mean_vector() {
        let a = [1.0, 3.0];
        let b = [3.0, 5.0];
        assert_eq!(mean_vector(&[&a, &b]), vec![2.0, 4.0]);
        assert!(mean_vector(&[]).is_empty());
    }
}
