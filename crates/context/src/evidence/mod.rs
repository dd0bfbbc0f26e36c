//! Evidence extraction
//!
//! Turns retrieved chunks into typed, confidence-scored evidence units with
//! file/line provenance. Confidence is recomputed for every query from:
//! - query term overlap
//! - the originating retrieval score
//! - a prior for the evidence type
//!
//! Types that do not answer the query intent are discounted. The weighted
//! sum stays in [0, 1] without clamping, so well-supported units still
//! spread out instead of piling up at 1.0.

mod claims;
mod contradictions;

pub use claims::ClaimShape;

use crate::query_parser::{QueryIntent, QueryUnderstanding};
use claims::Claim;
use lodestar_common::config::EvidenceConfig;
use lodestar_common::models::{ChunkId, DocumentId, LineRange};
use lodestar_common::text::{self, CrossReference};
use lodestar_search::{RetrievalCandidate, RetrievedSentence};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Factor applied when the query intent prefers other evidence types
const INTENT_MISMATCH_FACTOR: f32 = 0.9;

/// Closed set of evidence types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Definition,
    Implementation,
    Example,
    Reference,
    Configuration,
    Assertion,
    Procedure,
    Metadata,
}

impl EvidenceType {
    /// Prior reliability of the type as an answer source
    pub fn prior(&self) -> f32 {
        match self {
            EvidenceType::Definition => 0.9,
            EvidenceType::Implementation => 0.85,
            EvidenceType::Configuration => 0.75,
            EvidenceType::Procedure => 0.75,
            EvidenceType::Example => 0.7,
            EvidenceType::Assertion => 0.65,
            EvidenceType::Reference => 0.55,
            EvidenceType::Metadata => 0.4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::Definition => "definition",
            EvidenceType::Implementation => "implementation",
            EvidenceType::Example => "example",
            EvidenceType::Reference => "reference",
            EvidenceType::Configuration => "configuration",
            EvidenceType::Assertion => "assertion",
            EvidenceType::Procedure => "procedure",
            EvidenceType::Metadata => "metadata",
        }
    }

    /// Confidence factor for this type under `intent`
    fn intent_factor(&self, intent: QueryIntent) -> f32 {
        let preferred = Self::preferred_for(intent);
        if preferred.is_empty() || preferred.contains(self) {
            1.0
        } else {
            INTENT_MISMATCH_FACTOR
        }
    }

    fn preferred_for(intent: QueryIntent) -> &'static [EvidenceType] {
        match intent {
            QueryIntent::Definition => &[EvidenceType::Definition],
            QueryIntent::Implementation => &[EvidenceType::Implementation],
            QueryIntent::Usage => &[EvidenceType::Example, EvidenceType::Procedure],
            QueryIntent::Location => &[EvidenceType::Reference, EvidenceType::Implementation],
            QueryIntent::Debugging => &[
                EvidenceType::Assertion,
                EvidenceType::Implementation,
                EvidenceType::Configuration,
            ],
            QueryIntent::Architecture => &[EvidenceType::Definition, EvidenceType::Reference],
            QueryIntent::Comparison => &[EvidenceType::Definition, EvidenceType::Assertion],
            QueryIntent::Workflow => &[EvidenceType::Procedure],
            QueryIntent::Other => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    Weak,
    Moderate,
    Strong,
}

/// One atomic, attributable piece of support for an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Query-local id (`ev-1`, `ev-2`, ...) in confidence order
    pub id: String,

    pub chunk_id: ChunkId,

    pub document_id: DocumentId,

    /// Source path of the chunk's document
    pub file: String,

    pub lines: LineRange,

    pub evidence_type: EvidenceType,

    pub shape: ClaimShape,

    pub strength: EvidenceStrength,

    /// Confidence (0.0 - 1.0)
    pub confidence: f32,

    pub text: String,

    /// Query terms found in the claim
    pub matched_terms: Vec<String>,

    /// Retrieval relevance the claim inherited
    pub retrieval_score: f32,

    pub references: Vec<CrossReference>,

    /// Shared by units that contradict each other
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradiction_group: Option<usize>,
}

/// Evidence for one query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub items: Vec<Evidence>,

    /// Number of distinct contradiction groups
    pub contradiction_groups: usize,

    /// Claims scored before per-chunk and global caps
    pub claims_considered: usize,
}

impl EvidenceSet {
    pub fn get(&self, id: &str) -> Option<&Evidence> {
        self.items.iter().find(|e| e.id == id)
    }

    pub fn strong(&self) -> impl Iterator<Item = &Evidence> {
        self.items.iter().filter(|e| e.strength == EvidenceStrength::Strong)
    }

    /// Distinct source files in first-seen order
    pub fn files(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .map(|e| e.file.as_str())
            .filter(|f| seen.insert(*f))
            .collect()
    }

    pub fn has_contradictions(&self) -> bool {
        self.contradiction_groups > 0
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

pub struct EvidenceExtractor {
    config: EvidenceConfig,
    /// Chunks below this quality never contribute evidence
    quality_floor: f32,
}

impl EvidenceExtractor {
    pub fn new(config: EvidenceConfig, quality_floor: f32) -> Self {
        Self { config, quality_floor }
    }

    /// Extract, score and cross-check evidence from ranked candidates
    pub fn extract(
        &self,
        understanding: &QueryUnderstanding,
        candidates: &[RetrievalCandidate],
        sentences: &[RetrievedSentence],
    ) -> EvidenceSet {
        let query_terms: BTreeSet<&str> = understanding.key_terms.iter().map(String::as_str).collect();
        let mut pool = Vec::new();
        let mut claims_considered = 0;

        for candidate in candidates {
            let chunk = &candidate.chunk;
            if chunk.quality_score < self.quality_floor {
                debug!(chunk_id = %chunk.id, quality = chunk.quality_score, "Skipping low-quality chunk");
                continue;
            }

            let segmented = claims::segment(&chunk.text, chunk.content_type);
            claims_considered += segmented.len();

            let mut scored: Vec<Evidence> = segmented
                .into_iter()
                .map(|claim| self.score_claim(understanding, &query_terms, candidate, sentences, claim))
                .collect();
            scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            scored.truncate(self.config.max_per_chunk);
            pool.extend(scored);
        }

        pool.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut seen_text = HashSet::new();
        let mut items: Vec<Evidence> = pool
            .into_iter()
            .filter(|e| seen_text.insert(normalize(&e.text)))
            .take(self.config.max_total)
            .collect();
        for (idx, item) in items.iter_mut().enumerate() {
            item.id = format!("ev-{}", idx + 1);
        }

        let contradiction_groups = contradictions::flag_contradictions(&mut items);

        debug!(
            evidence = items.len(),
            claims = claims_considered,
            contradiction_groups,
            "Extracted evidence"
        );

        EvidenceSet {
            items,
            contradiction_groups,
            claims_considered,
        }
    }

    fn score_claim(
        &self,
        understanding: &QueryUnderstanding,
        query_terms: &BTreeSet<&str>,
        candidate: &RetrievalCandidate,
        sentences: &[RetrievedSentence],
        claim: Claim,
    ) -> Evidence {
        let chunk = &candidate.chunk;
        let evidence_type = claims::classify(&claim);

        let claim_terms = claims::claim_terms(&claim.text);
        let matched_terms: Vec<String> = query_terms
            .iter()
            .filter(|t| claim_terms.contains(**t))
            .map(|t| t.to_string())
            .collect();
        let overlap = if query_terms.is_empty() {
            0.0
        } else {
            matched_terms.len() as f32 / query_terms.len() as f32
        };

        let sentence_score = sentences
            .iter()
            .filter(|s| s.chunk_id == chunk.id && sentence_matches(&claim.text, &s.text))
            .map(|s| s.score.clamp(0.0, 1.0))
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))));
        let retrieval_score = sentence_score.map_or(candidate.relevance, |s| s.max(candidate.relevance));

        let weighted = self.config.overlap_weight * overlap
            + self.config.retrieval_weight * retrieval_score
            + self.config.prior_weight * evidence_type.prior();
        let confidence = (weighted * evidence_type.intent_factor(understanding.intent)).clamp(0.0, 1.0);

        Evidence {
            id: String::new(),
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            file: chunk.path.clone(),
            lines: LineRange::new(chunk.lines.start + claim.first_line, chunk.lines.start + claim.last_line),
            evidence_type,
            shape: claim.shape,
            strength: self.strength(confidence),
            confidence,
            references: text::extract_references(&claim.text),
            text: claim.text,
            matched_terms,
            retrieval_score,
            contradiction_group: None,
        }
    }

    fn strength(&self, confidence: f32) -> EvidenceStrength {
        if confidence >= self.config.strong_threshold {
            EvidenceStrength::Strong
        } else if confidence >= self.config.moderate_threshold {
            EvidenceStrength::Moderate
        } else {
            EvidenceStrength::Weak
        }
    }
}

fn sentence_matches(claim: &str, sentence: &str) -> bool {
    let (claim, sentence) = (normalize(claim), normalize(sentence));
    !sentence.is_empty() && (claim.contains(&sentence) || sentence.contains(&claim))
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
