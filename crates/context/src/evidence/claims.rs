//! Claim segmentation and classification
//!
//! A claim is the smallest unit that can support an answer: a sentence, a
//! fenced code block, a list item, a key/value line or a table row. Line
//! numbers are 0-based offsets within the chunk text.

use super::EvidenceType;
use lodestar_common::models::{is_list_line, is_table_line, ContentType};
use lodestar_common::text;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Structural form of a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimShape {
    Sentence,
    CodeBlock,
    ListItem,
    KeyValue,
    TableRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub shape: ClaimShape,
    pub text: String,
    pub first_line: usize,
    pub last_line: usize,
    /// Numbered list item
    pub ordered: bool,
}

const METADATA_KEYS: &[&str] = &[
    "author", "authors", "version", "license", "date", "status", "owner", "updated", "created", "maintainer", "title",
];

const METADATA_CUES: &[&str] = &["version", "license", "licensed", "copyright", "author", "maintained by", "released"];

const REFERENCE_CUES: &[&str] = &["see also", "refer to", "described in", "documented in", "details in", " see "];

const EXAMPLE_CUES: &[&str] = &["for example", "e.g.", "for instance", "example:", "such as"];

const IMPLEMENTATION_CUES: &[&str] = &[
    "implement", "implements", "implemented", "calls", "returns", "invokes", "coordinates", "delegates",
    "dispatches", "function", "method", "class",
];

const IMPERATIVE_VERBS: &[&str] = &[
    "install", "run", "set", "add", "create", "call", "configure", "build", "start", "open", "execute", "clone",
    "enable", "disable", "copy", "edit", "export", "pip", "cargo", "npm", "make", "restart", "deploy",
];

const NUMBER_WORDS: &[&str] = &[
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven", "twelve",
];

const COMMENT_MARKERS: &[&str] = &["#", "//", "/*", "*", "\"\"\"", "'''", "--"];

/// Split chunk text into claims
pub fn segment(text: &str, content_type: ContentType) -> Vec<Claim> {
    if content_type == ContentType::Code {
        return segment_code(text);
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut claims = Vec::new();
    let mut paragraph: Vec<(usize, &str)> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            flush_paragraph(&mut paragraph, &mut claims);
            let start = i;
            let mut body = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim().starts_with("```") {
                body.push(lines[i]);
                i += 1;
            }
            let code = body.join("\n");
            if !code.trim().is_empty() {
                claims.push(Claim {
                    shape: ClaimShape::CodeBlock,
                    text: code,
                    first_line: start,
                    last_line: i.min(lines.len().saturating_sub(1)),
                    ordered: false,
                });
            }
            i += 1;
            continue;
        }

        if trimmed.is_empty() || is_heading(trimmed) {
            flush_paragraph(&mut paragraph, &mut claims);
            i += 1;
            continue;
        }

        if is_table_line(trimmed) {
            flush_paragraph(&mut paragraph, &mut claims);
            let is_header = lines.get(i + 1).is_some_and(|next| is_separator_row(next.trim()));
            if !is_separator_row(trimmed) && !is_header {
                let cells: Vec<&str> = trimmed
                    .trim_matches('|')
                    .split('|')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .collect();
                claims.push(Claim {
                    shape: ClaimShape::TableRow,
                    text: cells.join(" | "),
                    first_line: i,
                    last_line: i,
                    ordered: false,
                });
            }
            i += 1;
            continue;
        }

        if is_list_line(line) {
            flush_paragraph(&mut paragraph, &mut claims);
            let start = i;
            let ordered = trimmed.starts_with(|c: char| c.is_ascii_digit());
            let mut item = strip_list_marker(trimmed).to_string();
            i += 1;
            // Indented continuation lines belong to the item
            while i < lines.len()
                && !lines[i].trim().is_empty()
                && lines[i].starts_with(' ')
                && !is_list_line(lines[i])
            {
                item.push(' ');
                item.push_str(lines[i].trim());
                i += 1;
            }
            claims.push(Claim {
                shape: ClaimShape::ListItem,
                text: item,
                first_line: start,
                last_line: i - 1,
                ordered,
            });
            continue;
        }

        if key_value(trimmed).is_some() {
            flush_paragraph(&mut paragraph, &mut claims);
            claims.push(Claim {
                shape: ClaimShape::KeyValue,
                text: trimmed.to_string(),
                first_line: i,
                last_line: i,
                ordered: false,
            });
            i += 1;
            continue;
        }

        paragraph.push((i, line));
        i += 1;
    }
    flush_paragraph(&mut paragraph, &mut claims);
    claims
}

/// Blank-line separated blocks; comment-only blocks become sentences
fn segment_code(text: &str) -> Vec<Claim> {
    let mut claims = Vec::new();
    let mut block: Vec<(usize, &str)> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            push_code_block(&mut block, &mut claims);
        } else {
            block.push((idx, line));
        }
    }
    push_code_block(&mut block, &mut claims);
    claims
}

fn push_code_block(block: &mut Vec<(usize, &str)>, claims: &mut Vec<Claim>) {
    let (Some(&(first, _)), Some(&(last, _))) = (block.first(), block.last()) else {
        return;
    };

    if block.iter().all(|(_, l)| is_comment_line(l)) {
        let prose: Vec<(usize, &str)> = block.iter().map(|&(i, l)| (i, strip_comment(l))).collect();
        let mut prose = prose.into_iter().filter(|(_, l)| !l.is_empty()).collect();
        flush_paragraph(&mut prose, claims);
    } else {
        let code: Vec<&str> = block.iter().map(|(_, l)| *l).collect();
        claims.push(Claim {
            shape: ClaimShape::CodeBlock,
            text: code.join("\n"),
            first_line: first,
            last_line: last,
            ordered: false,
        });
    }
    block.clear();
}

fn flush_paragraph(paragraph: &mut Vec<(usize, &str)>, claims: &mut Vec<Claim>) {
    let Some(&(first_line, _)) = paragraph.first() else {
        return;
    };
    let joined = paragraph.iter().map(|(_, l)| l.trim()).collect::<Vec<_>>().join("\n");
    for (start, end) in text::sentence_spans(&joined) {
        claims.push(Claim {
            shape: ClaimShape::Sentence,
            text: joined[start..end].replace('\n', " "),
            first_line: first_line + text::line_offset(&joined, start),
            last_line: first_line + text::line_offset(&joined, end.saturating_sub(1)),
            ordered: false,
        });
    }
    paragraph.clear();
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    hashes > 0 && (line.len() == hashes || line[hashes..].starts_with(' '))
}

fn is_separator_row(line: &str) -> bool {
    is_table_line(line) && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    COMMENT_MARKERS.iter().any(|m| trimmed.starts_with(m))
}

fn strip_comment(line: &str) -> &str {
    let mut rest = line.trim();
    for marker in COMMENT_MARKERS {
        rest = rest.trim_start_matches(marker);
    }
    for marker in ["\"\"\"", "'''", "*/"] {
        rest = rest.trim_end_matches(marker);
    }
    rest.trim()
}

fn strip_list_marker(line: &str) -> &str {
    let trimmed = line.trim_start();
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return rest.trim();
        }
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    trimmed[digits..]
        .strip_prefix(". ")
        .or_else(|| trimmed[digits..].strip_prefix(") "))
        .unwrap_or(trimmed)
        .trim()
}

/// `key: value` or `key = value` with an identifier key and a short value
pub fn key_value(line: &str) -> Option<(String, String)> {
    let split = line.find([':', '='])?;
    let key = line[..split].trim();
    let value = line[split + 1..].trim();
    let valid_key = !key.is_empty()
        && key.len() <= 40
        && key.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    let short_value = !value.is_empty() && !value.starts_with("//") && value.split_whitespace().count() <= 6;
    (valid_key && short_value).then(|| (key.to_lowercase(), value.to_string()))
}

/// Classify a claim into one of the evidence types
pub fn classify(claim: &Claim) -> EvidenceType {
    match claim.shape {
        ClaimShape::CodeBlock => {
            if text::defined_symbols(&claim.text).is_empty() {
                EvidenceType::Example
            } else {
                EvidenceType::Implementation
            }
        }
        ClaimShape::KeyValue => match key_value(&claim.text) {
            Some((key, _)) if METADATA_KEYS.contains(&key.as_str()) => EvidenceType::Metadata,
            _ => EvidenceType::Configuration,
        },
        ClaimShape::ListItem if claim.ordered || starts_imperative(&claim.text) => {
            EvidenceType::Procedure
        }
        ClaimShape::ListItem | ClaimShape::TableRow | ClaimShape::Sentence => classify_sentence(&claim.text),
    }
}

fn classify_sentence(sentence: &str) -> EvidenceType {
    let lower = format!(" {} ", sentence.to_lowercase());
    let words = words(&lower);
    let has_word = |cue: &str| {
        if cue.contains(' ') {
            lower.contains(cue)
        } else {
            words.iter().any(|w| *w == cue)
        }
    };

    if METADATA_CUES.iter().any(|c| has_word(c)) {
        EvidenceType::Metadata
    } else if lower.trim_start().starts_with("see ") || REFERENCE_CUES.iter().any(|c| lower.contains(c)) {
        EvidenceType::Reference
    } else if starts_imperative(sentence)
        || ["first,", "then ", "next,", "finally,"].iter().any(|c| lower.trim_start().starts_with(c))
    {
        EvidenceType::Procedure
    } else if EXAMPLE_CUES.iter().any(|c| lower.contains(c)) {
        EvidenceType::Example
    } else if is_definitional(&lower, &words) {
        EvidenceType::Definition
    } else if IMPLEMENTATION_CUES.iter().any(|c| has_word(c)) {
        EvidenceType::Implementation
    } else {
        EvidenceType::Assertion
    }
}

fn is_definitional(lower: &str, words: &[&str]) -> bool {
    if ["refers to", "defined as", " means ", "stands for", "consists of", "composed of"]
        .iter()
        .any(|c| lower.contains(c))
    {
        return true;
    }
    words.windows(2).any(|pair| match pair[0] {
        "is" | "are" => matches!(pair[1], "a" | "an" | "the"),
        "has" | "have" | "contains" => is_number(pair[1]),
        _ => false,
    })
}

fn starts_imperative(sentence: &str) -> bool {
    let lower = sentence.to_lowercase();
    words(&lower).first().is_some_and(|w| IMPERATIVE_VERBS.contains(w))
}

/// Lower-case words without any length filter
pub fn words(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Numeric value of a digit string or a small number word
pub fn number_value(word: &str) -> Option<f64> {
    if let Some(pos) = NUMBER_WORDS.iter().position(|w| *w == word) {
        return Some(pos as f64);
    }
    if word.chars().all(|c| c.is_ascii_digit()) {
        return word.parse().ok();
    }
    None
}

pub fn is_number(word: &str) -> bool {
    number_value(word).is_some()
}

/// Stemmed terms of a claim, with identifiers split at case and `_`
/// boundaries so `GridEngine` also yields `grid` and `engine`
pub fn claim_terms(claim: &str) -> HashSet<String> {
    let mut terms: HashSet<String> = text::key_terms(claim).into_iter().collect();
    for word in claim.split(|c: char| !c.is_alphanumeric()) {
        for part in split_camel(word) {
            let lower = part.to_lowercase();
            if lower.chars().count() >= 2 && !text::is_stop_word(&lower) {
                terms.insert(text::stem(&lower));
            }
        }
    }
    terms
}

fn split_camel(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev_lower = false;
    for (idx, c) in word.char_indices() {
        if c.is_uppercase() && prev_lower {
            parts.push(&word[start..idx]);
            start = idx;
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(claims: &[Claim]) -> Vec<ClaimShape> {
        claims.iter().map(|c| c.shape).collect()
    }

    #[test]
    fn test_mixed_segmentation() {
        let text = "# Setup\n\nGRID is a scheduler. It runs jobs.\n\n- Install with pip\n- Run grid\n\nworkers: 4\n\n```\ngrid run --all\n```\n";
        let claims = segment(text, ContentType::Mixed);

        assert_eq!(
            shapes(&claims),
            vec![
                ClaimShape::Sentence,
                ClaimShape::Sentence,
                ClaimShape::ListItem,
                ClaimShape::ListItem,
                ClaimShape::KeyValue,
                ClaimShape::CodeBlock,
            ]
        );
        assert_eq!(claims[0].text, "GRID is a scheduler.");
        assert_eq!(claims[0].first_line, 2);
        assert_eq!(claims[2].text, "Install with pip");
        assert_eq!(claims[5].text, "grid run --all");
        assert_eq!((claims[5].first_line, claims[5].last_line), (9, 11));
    }

    #[test]
    fn test_sentence_line_numbers_follow_wrapping() {
        let text = "First sentence here.\nSecond sentence\nwraps onto a new line.";
        let claims = segment(text, ContentType::Prose);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[1].text, "Second sentence wraps onto a new line.");
        assert_eq!((claims[1].first_line, claims[1].last_line), (1, 2));
    }

    #[test]
    fn test_table_rows_skip_header_and_separator() {
        let text = "| key | value |\n|---|---|\n| port | 8080 |\n| host | local |";
        let claims = segment(text, ContentType::Table);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].text, "port | 8080");
        assert_eq!(claims[0].shape, ClaimShape::TableRow);
    }

    #[test]
    fn test_code_blocks_and_docstrings() {
        let text = "\"\"\"Core engine of the GRID architecture.\"\"\"\n\nclass GridEngine:\n    def schedule(self, job):\n        return job";
        let claims = segment(text, ContentType::Code);
        assert_eq!(shapes(&claims), vec![ClaimShape::Sentence, ClaimShape::CodeBlock]);
        assert_eq!(claims[0].text, "Core engine of the GRID architecture.");
        assert_eq!((claims[1].first_line, claims[1].last_line), (2, 4));
        assert_eq!(classify(&claims[1]), EvidenceType::Implementation);
    }

    #[test]
    fn test_sentence_classification() {
        let kind = |text: &str| classify_sentence(text);
        assert_eq!(kind("GRID is a distributed job scheduler."), EvidenceType::Definition);
        assert_eq!(kind("The GRID architecture has three layers."), EvidenceType::Definition);
        assert_eq!(kind("See ARCHITECTURE.md for the design."), EvidenceType::Reference);
        assert_eq!(kind("Install with pip and run the grid command."), EvidenceType::Procedure);
        assert_eq!(kind("For example, a job can be retried."), EvidenceType::Example);
        assert_eq!(kind("The `GridEngine` class coordinates workers."), EvidenceType::Implementation);
        assert_eq!(kind("Licensed under the MIT license."), EvidenceType::Metadata);
        assert_eq!(kind("The scheduler assigns queued jobs to idle workers."), EvidenceType::Assertion);
    }

    #[test]
    fn test_key_value_lines() {
        assert_eq!(key_value("max_hops = 3"), Some(("max_hops".to_string(), "3".to_string())));
        assert_eq!(key_value("version: 1.2.0").map(|(k, _)| k), Some("version".to_string()));
        assert!(key_value("Note: this line keeps going on for far too many words to be a value").is_none());
        assert!(key_value("https://example.com").is_none());
        assert!(key_value("The ratio is 3:1 overall").is_none());
    }

    #[test]
    fn test_claim_terms_split_identifiers() {
        let terms = claim_terms("class GridEngine:\n    def schedule_jobs(self):");
        for term in ["grid", "engine", "gridengine", "schedule", "job", "class"] {
            assert!(terms.contains(term), "missing {}", term);
        }
    }

    #[test]
    fn test_number_values() {
        assert_eq!(number_value("three"), Some(3.0));
        assert_eq!(number_value("8080"), Some(8080.0));
        assert_eq!(number_value("layers"), None);
    }
}
