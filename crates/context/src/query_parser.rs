//! Query Understanding - intent, entities and expansions
//!
//! Provides:
//! - Intent classification over a closed set
//! - Entity extraction (symbols, paths, domain terms)
//! - 1-3 deterministic query expansions
//!
//! Parsing is pure: the same query always yields the same understanding.

use lodestar_common::errors::{AppError, Result};
use lodestar_common::text::{self, ReferenceKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What the user is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// What something is
    Definition,
    /// How something works internally
    Implementation,
    /// How to use something
    Usage,
    /// Where something lives
    Location,
    /// Why something fails
    Debugging,
    /// How the system is structured
    Architecture,
    /// How two things differ
    Comparison,
    /// Sequence of steps or data flow
    Workflow,
    Other,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Definition => "definition",
            QueryIntent::Implementation => "implementation",
            QueryIntent::Usage => "usage",
            QueryIntent::Location => "location",
            QueryIntent::Debugging => "debugging",
            QueryIntent::Architecture => "architecture",
            QueryIntent::Comparison => "comparison",
            QueryIntent::Workflow => "workflow",
            QueryIntent::Other => "other",
        }
    }
}

/// Entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Code identifier: `GridEngine`, `schedule()`, `max_hops`
    Symbol,
    /// File or module path
    Path,
    /// Acronym or proper noun of the domain
    DomainTerm,
}

/// Extracted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity text as written
    pub text: String,

    pub entity_type: EntityType,

    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Parsed query understanding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryUnderstanding {
    /// Query as submitted (trimmed)
    pub original_query: String,

    /// Lower-cased, whitespace-collapsed query
    pub normalized_query: String,

    pub intent: QueryIntent,

    /// Intent confidence (0.0 - 1.0)
    pub intent_confidence: f32,

    pub entities: Vec<Entity>,

    /// Stemmed, stop-word-free query terms
    pub key_terms: Vec<String>,

    /// Expanded query variants (1-3)
    pub expansions: Vec<String>,
}

impl QueryUnderstanding {
    /// Queries that benefit from iterative retrieval
    pub fn is_complex(&self) -> bool {
        matches!(
            self.intent,
            QueryIntent::Comparison | QueryIntent::Workflow | QueryIntent::Debugging
        ) || self.entities.len() >= 3
    }
}

/// Query parser configuration
#[derive(Debug, Clone)]
pub struct QueryParserConfig {
    /// Longest accepted query, in characters
    pub max_query_chars: usize,

    /// Maximum query expansions (at most 3)
    pub max_expansions: usize,

    /// Minimum confidence for entity extraction
    pub min_entity_confidence: f32,
}

impl Default for QueryParserConfig {
    fn default() -> Self {
        Self {
            max_query_chars: 2_000,
            max_expansions: 3,
            min_entity_confidence: 0.6,
        }
    }
}

/// Intent cue lists, checked in order; the first intent with a hit wins
const INTENT_CUES: &[(QueryIntent, &[&str])] = &[
    (
        QueryIntent::Comparison,
        &[" vs ", " vs. ", " versus ", "compare", "comparison", "difference between", "differ", "better than"],
    ),
    (
        QueryIntent::Debugging,
        &["error", "bug", "fail", "crash", "exception", "traceback", "panic", "debug", "broken", "not working", "doesn't work"],
    ),
    (
        QueryIntent::Location,
        &["where is", "where are", "where does", "which file", "which module", "located", "defined in", "find the"],
    ),
    (
        QueryIntent::Architecture,
        &["architecture", "design", "structure", "components", "overview", "organized", "layers", "modules"],
    ),
    (
        QueryIntent::Workflow,
        &["workflow", "steps", "step by step", "process", "lifecycle", "what happens when", "end to end", "sequence", "flow"],
    ),
    (
        QueryIntent::Usage,
        &["how do i", "how to", "how can i", "usage", "example", "use the", "configure", "install", "call the"],
    ),
    (
        QueryIntent::Implementation,
        &["how does", "how is", "implement", "implementation", "algorithm", "internals", "works", "under the hood"],
    ),
    (
        QueryIntent::Definition,
        &["what is", "what are", "what's", "define", "definition", "meaning of", "stands for", "who is"],
    ),
];

/// Synonyms used for expansion, keyed by stemmed term
const SYNONYMS: &[(&str, &str)] = &[
    ("architecture", "design"),
    ("design", "architecture"),
    ("function", "method"),
    ("method", "function"),
    ("error", "exception"),
    ("exception", "error"),
    ("config", "configuration"),
    ("configuration", "setting"),
    ("install", "setup"),
    ("setup", "installation"),
    ("bug", "defect"),
    ("doc", "documentation"),
    ("auth", "authentication"),
    ("db", "database"),
    ("repo", "repository"),
    ("param", "parameter"),
    ("arg", "argument"),
    ("init", "initialization"),
];

/// Query parser
pub struct QueryParser {
    config: QueryParserConfig,
}

impl QueryParser {
    /// Create a new query parser
    pub fn new(config: QueryParserConfig) -> Self {
        Self { config }
    }

    /// Parse and understand a query
    pub fn parse(&self, query: &str) -> Result<QueryUnderstanding> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidQuery {
                message: "Query is empty".to_string(),
            });
        }
        let length = trimmed.chars().count();
        if length > self.config.max_query_chars {
            return Err(AppError::InvalidQuery {
                message: format!(
                    "Query is {} characters, limit is {}",
                    length, self.config.max_query_chars
                ),
            });
        }

        let normalized = trimmed
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let (intent, intent_confidence) = self.detect_intent(&normalized);
        let entities = self.extract_entities(trimmed);
        let key_terms = text::key_terms(trimmed);
        let expansions = self.expand_query(&normalized, &key_terms, &entities);

        Ok(QueryUnderstanding {
            original_query: trimmed.to_string(),
            normalized_query: normalized,
            intent,
            intent_confidence,
            entities,
            key_terms,
            expansions,
        })
    }

    /// Detect query intent from cue phrases
    fn detect_intent(&self, query: &str) -> (QueryIntent, f32) {
        // Pad so cues with surrounding spaces also match at the edges
        let padded = format!(" {} ", query.trim_end_matches(&['?', '!', '.'][..]));

        for (intent, cues) in INTENT_CUES {
            let hits = cues.iter().filter(|cue| padded.contains(*cue)).count();
            if hits > 0 {
                let leading = cues.iter().any(|cue| padded.trim_start().starts_with(cue.trim()));
                let mut confidence = 0.55 + 0.15 * hits as f32;
                if leading {
                    confidence += 0.1;
                }
                return (*intent, confidence.min(0.95));
            }
        }

        (QueryIntent::Other, 0.3)
    }

    /// Extract entities from the raw query
    fn extract_entities(&self, query: &str) -> Vec<Entity> {
        let mut entities: Vec<Entity> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |text: &str, entity_type: EntityType, confidence: f32, entities: &mut Vec<Entity>| {
            if seen.insert(text.to_lowercase()) {
                entities.push(Entity {
                    text: text.to_string(),
                    entity_type,
                    confidence,
                });
            }
        };

        for reference in text::extract_references(query) {
            let (entity_type, confidence) = match reference.kind {
                ReferenceKind::Path | ReferenceKind::Link => (EntityType::Path, 0.95),
                ReferenceKind::Import => (EntityType::Path, 0.85),
                ReferenceKind::Symbol => (EntityType::Symbol, 0.9),
            };
            push(&reference.target, entity_type, confidence, &mut entities);
        }

        for (position, raw) in query.split_whitespace().enumerate() {
            let word = raw.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '(' || c == ')'));
            let bare = word.trim_end_matches("()");
            if bare.len() < 2 || text::is_stop_word(&bare.to_lowercase()) {
                continue;
            }

            if word.ends_with("()") || (bare.contains('_') && bare.chars().all(|c| c.is_alphanumeric() || c == '_')) {
                push(bare, EntityType::Symbol, 0.8, &mut entities);
            } else if bare.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                && bare.chars().any(|c| c.is_ascii_uppercase())
            {
                push(bare, EntityType::DomainTerm, 0.85, &mut entities);
            } else if position > 0 && bare.chars().next().is_some_and(|c| c.is_uppercase()) {
                push(bare, EntityType::DomainTerm, 0.7, &mut entities);
            } else if bare.contains('-') {
                push(bare, EntityType::DomainTerm, 0.65, &mut entities);
            }
        }

        entities
            .into_iter()
            .filter(|e| e.confidence >= self.config.min_entity_confidence)
            .collect()
    }

    /// Keyword form, synonym variants and an entity focus, de-duplicated
    fn expand_query(&self, normalized: &str, key_terms: &[String], entities: &[Entity]) -> Vec<String> {
        let limit = self.config.max_expansions.clamp(1, 3);
        let mut expansions: Vec<String> = Vec::new();
        let add = |candidate: String, expansions: &mut Vec<String>| {
            let candidate = candidate.trim().to_string();
            if !candidate.is_empty() && candidate != normalized && !expansions.contains(&candidate) {
                expansions.push(candidate);
            }
        };

        if !key_terms.is_empty() {
            add(key_terms.join(" "), &mut expansions);
        }

        for (position, term) in key_terms.iter().enumerate() {
            if let Some((_, synonym)) = SYNONYMS.iter().find(|(word, _)| word == term) {
                let mut variant = key_terms.to_vec();
                variant[position] = synonym.to_string();
                add(variant.join(" "), &mut expansions);
            }
        }

        if !entities.is_empty() {
            let focus: Vec<String> = entities.iter().map(|e| e.text.to_lowercase()).collect();
            add(focus.join(" "), &mut expansions);
        }

        if expansions.is_empty() {
            expansions.push(normalized.to_string());
        }
        expansions.truncate(limit);
        expansions
    }
}
