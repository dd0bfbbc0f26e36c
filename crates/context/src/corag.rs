//! Chain-of-retrieval
//!
//! An explicit, strictly sequential loop:
//! `Retrieve -> Analyze -> (Reformulate -> Retrieve)* -> Finalize`.
//!
//! Analysis extracts evidence for the original question from everything
//! retrieved so far and applies the same sufficiency rule as the reasoning
//! engine's conclusion. Reformulation asks the language model for a focused
//! sub-query and falls back to a heuristic built from the coverage gaps.
//! The loop stops on sufficiency, after `max_hops`, when no new query can
//! be formed, or at the request deadline; only the first ends without the
//! incomplete flag. A deadline keeps every hop completed before it.

use crate::evidence::{EvidenceExtractor, EvidenceSet};
use crate::query_parser::QueryUnderstanding;
use crate::reasoner::{self, ReasoningEngine};
use lodestar_common::config::{ChainMode, CoragConfig};
use lodestar_common::models::ChunkId;
use lodestar_common::providers::LanguageModel;
use lodestar_common::resilience::{check_cancelled, deadline_passed, within_deadline, ProviderGate};
use lodestar_common::Result;
use lodestar_search::{
    HierarchicalIndex, RetrievalCandidate, RetrievalOrchestrator, RetrievalOutcome, RetrievalProvenance,
    RetrievalRequest, RetrievedSentence,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reference targets added to a heuristic sub-query
const MAX_REFERENCE_TERMS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Retrieve,
    Analyze,
    Reformulate,
    Finalize,
}

/// Where a reformulated sub-query came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReformulationSource {
    LanguageModel,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Sufficient,
    MaxHops,
    /// No new sub-query could be formed
    Exhausted,
    /// The request deadline passed before the chain finished
    Deadline,
}

/// One retrieval round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHop {
    /// 1-based hop number
    pub hop: usize,

    pub query: String,

    pub candidate_ids: Vec<ChunkId>,

    /// Sufficiency verdict after this hop
    pub sufficient: bool,

    pub coverage: f32,

    pub strong_evidence: usize,

    /// Sub-query issued after this hop, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reformulated: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reformulation_source: Option<ReformulationSource>,

    pub provenance: RetrievalProvenance,
}

/// Hops for one logical query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalChain {
    pub hops: Vec<RetrievalHop>,

    /// Ended without sufficient evidence
    pub potentially_incomplete: bool,

    pub stop_reason: StopReason,
}

/// Merged retrieval result plus the hop trace
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub outcome: RetrievalOutcome,
    pub chain: RetrievalChain,
}

/// Whether a query runs through the loop
///
/// A per-request choice wins over the configured mode; `Auto` only loops
/// for complex queries.
pub fn should_run(mode: ChainMode, understanding: &QueryUnderstanding, forced: Option<bool>) -> bool {
    match forced {
        Some(forced) => forced,
        None => match mode {
            ChainMode::Off => false,
            ChainMode::Always => true,
            ChainMode::Auto => understanding.is_complex(),
        },
    }
}

/// Borrowed pipeline stages the loop drives
pub struct ChainStages<'a> {
    pub orchestrator: &'a RetrievalOrchestrator,
    pub extractor: &'a EvidenceExtractor,
    pub reasoner: &'a ReasoningEngine,
}

pub struct CoragController {
    config: CoragConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    llm_gate: ProviderGate,
}

impl CoragController {
    pub fn new(config: CoragConfig, llm: Option<Arc<dyn LanguageModel>>, llm_gate: ProviderGate) -> Self {
        Self { config, llm, llm_gate }
    }

    pub fn config(&self) -> &CoragConfig {
        &self.config
    }

    /// Run the loop against one snapshot
    pub async fn run(
        &self,
        stages: &ChainStages<'_>,
        index: &HierarchicalIndex,
        understanding: &QueryUnderstanding,
        top_k: usize,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<ChainOutcome> {
        let max_hops = self.config.max_hops.max(1);
        let mut state = LoopState::Retrieve;
        let mut query = understanding.original_query.clone();
        let mut asked: HashSet<String> = HashSet::from([normalize(&query)]);

        let mut merged = Merged::default();
        let mut hops: Vec<RetrievalHop> = Vec::new();
        let mut evidence = EvidenceSet::default();
        let mut gaps: Vec<String> = Vec::new();
        let mut stop_reason = StopReason::Exhausted;

        loop {
            match state {
                LoopState::Retrieve => {
                    check_cancelled(cancel, "corag_retrieve")?;
                    let expansions = if hops.is_empty() {
                        understanding.expansions.clone()
                    } else {
                        Vec::new()
                    };
                    let request = RetrievalRequest::new(query.clone(), top_k).with_expansions(expansions);
                    let Some(outcome) =
                        within_deadline(deadline, stages.orchestrator.retrieve(index, &request, cancel)).await
                    else {
                        warn!(hop = hops.len() + 1, "Deadline reached during chain retrieval");
                        merged.mark_timed_out();
                        stop_reason = StopReason::Deadline;
                        state = LoopState::Finalize;
                        continue;
                    };
                    let outcome = outcome?;

                    hops.push(RetrievalHop {
                        hop: hops.len() + 1,
                        query: query.clone(),
                        candidate_ids: outcome.candidates.iter().map(|c| c.chunk.id.clone()).collect(),
                        sufficient: false,
                        coverage: 0.0,
                        strong_evidence: 0,
                        reformulated: None,
                        reformulation_source: None,
                        provenance: outcome.provenance.clone(),
                    });
                    merged.absorb(outcome, top_k);
                    state = LoopState::Analyze;
                }
                LoopState::Analyze => {
                    check_cancelled(cancel, "corag_analyze")?;
                    evidence = stages
                        .extractor
                        .extract(understanding, &merged.candidates, &merged.sentences);
                    let (coverage, missing) = reasoner::coverage(understanding, &evidence);
                    let strong = evidence.strong().count();
                    let sufficient = stages.reasoner.is_sufficient(strong, coverage);
                    gaps = missing;

                    if let Some(hop) = hops.last_mut() {
                        hop.sufficient = sufficient;
                        hop.coverage = coverage;
                        hop.strong_evidence = strong;
                    }
                    debug!(hop = hops.len(), coverage, strong, sufficient, "Analyzed retrieval hop");

                    state = if sufficient {
                        stop_reason = StopReason::Sufficient;
                        LoopState::Finalize
                    } else if hops.len() >= max_hops {
                        stop_reason = StopReason::MaxHops;
                        LoopState::Finalize
                    } else if deadline_passed(deadline) {
                        merged.mark_timed_out();
                        stop_reason = StopReason::Deadline;
                        LoopState::Finalize
                    } else {
                        LoopState::Reformulate
                    };
                }
                LoopState::Reformulate => {
                    let Some(next) = within_deadline(
                        deadline,
                        self.reformulate(understanding, &query, &gaps, &evidence, &merged.candidates, cancel),
                    )
                    .await
                    else {
                        merged.mark_timed_out();
                        stop_reason = StopReason::Deadline;
                        state = LoopState::Finalize;
                        continue;
                    };
                    match next? {
                        Some((sub_query, source)) if asked.insert(normalize(&sub_query)) => {
                            if let Some(hop) = hops.last_mut() {
                                hop.reformulated = Some(sub_query.clone());
                                hop.reformulation_source = Some(source);
                            }
                            query = sub_query;
                            state = LoopState::Retrieve;
                        }
                        _ => {
                            stop_reason = StopReason::Exhausted;
                            state = LoopState::Finalize;
                        }
                    }
                }
                LoopState::Finalize => break,
            }
        }

        let potentially_incomplete = stop_reason != StopReason::Sufficient;
        info!(
            hops = hops.len(),
            stop_reason = ?stop_reason,
            potentially_incomplete,
            "Chain of retrieval finished"
        );

        Ok(ChainOutcome {
            outcome: merged.into_outcome(),
            chain: RetrievalChain {
                hops,
                potentially_incomplete,
                stop_reason,
            },
        })
    }

    /// Next sub-query, from the language model when it answers, else heuristically
    async fn reformulate(
        &self,
        understanding: &QueryUnderstanding,
        previous: &str,
        gaps: &[String],
        evidence: &EvidenceSet,
        retrieved: &[RetrievalCandidate],
        cancel: &CancellationToken,
    ) -> Result<Option<(String, ReformulationSource)>> {
        if let Some(llm) = &self.llm {
            let prompt = reformulation_prompt(understanding, previous, gaps);
            match self.llm_gate.call("reformulate", cancel, || llm.complete(&prompt)).await {
                Ok(text) => {
                    let first_line = text
                        .lines()
                        .map(|l| l.trim().trim_matches('"'))
                        .find(|l| !l.is_empty())
                        .unwrap_or_default();
                    if !first_line.is_empty() {
                        return Ok(Some((first_line.to_string(), ReformulationSource::LanguageModel)));
                    }
                    debug!("Language model returned an empty reformulation");
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e, "Reformulation failed, using heuristic"),
            }
        }

        Ok(heuristic_reformulation(understanding, gaps, evidence, retrieved)
            .map(|q| (q, ReformulationSource::Heuristic)))
    }
}

fn reformulation_prompt(understanding: &QueryUnderstanding, previous: &str, gaps: &[String]) -> String {
    let missing = if gaps.is_empty() {
        "none identified".to_string()
    } else {
        gaps.join(", ")
    };
    format!(
        "Rewrite the search query to find information that is still missing.\n\
         Original question: {}\n\
         Previous query: {}\n\
         Missing terms: {}\n\
         Respond with a single search query on one line.",
        understanding.original_query, previous, missing
    )
}

/// Sub-query from uncovered terms, uncovered entities and unexplored references
pub fn heuristic_reformulation(
    understanding: &QueryUnderstanding,
    gaps: &[String],
    evidence: &EvidenceSet,
    retrieved: &[RetrievalCandidate],
) -> Option<String> {
    let mut parts: Vec<String> = gaps.to_vec();

    let evidence_text: String = evidence
        .items
        .iter()
        .map(|e| e.text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    for entity in &understanding.entities {
        let lower = entity.text.to_lowercase();
        if !evidence_text.contains(&lower) {
            parts.push(entity.text.clone());
        }
    }

    let retrieved_paths: HashSet<&str> = retrieved.iter().map(|c| c.chunk.path.as_str()).collect();
    let mut reference_terms = 0;
    for reference in evidence.items.iter().flat_map(|e| e.references.iter()) {
        if reference_terms >= MAX_REFERENCE_TERMS {
            break;
        }
        let explored = retrieved_paths
            .iter()
            .any(|p| p.ends_with(&reference.target) || reference.target.ends_with(p));
        if !explored && !parts.contains(&reference.target) {
            parts.push(reference.target.clone());
            reference_terms += 1;
        }
    }

    let mut seen = HashSet::new();
    parts.retain(|p| seen.insert(p.to_lowercase()));
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Running union of candidates across hops
#[derive(Default)]
struct Merged {
    candidates: Vec<RetrievalCandidate>,
    sentences: Vec<RetrievedSentence>,
    provenance: Option<RetrievalProvenance>,
}

impl Merged {
    fn absorb(&mut self, outcome: RetrievalOutcome, top_k: usize) {
        let mut by_id: HashMap<ChunkId, RetrievalCandidate> = self
            .candidates
            .drain(..)
            .map(|c| (c.chunk.id.clone(), c))
            .collect();
        for candidate in outcome.candidates {
            match by_id.get(&candidate.chunk.id) {
                Some(existing) if existing.relevance >= candidate.relevance => {}
                _ => {
                    by_id.insert(candidate.chunk.id.clone(), candidate);
                }
            }
        }

        let mut candidates: Vec<RetrievalCandidate> = by_id.into_values().collect();
        candidates.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        candidates.truncate(top_k.max(1));
        for (idx, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = idx + 1;
        }
        self.candidates = candidates;

        let mut seen: HashSet<(ChunkId, usize, usize)> = self
            .sentences
            .iter()
            .map(|s| (s.chunk_id.clone(), s.start, s.end))
            .collect();
        for sentence in outcome.sentences {
            if seen.insert((sentence.chunk_id.clone(), sentence.start, sentence.end)) {
                self.sentences.push(sentence);
            }
        }

        self.provenance = Some(match self.provenance.take() {
            None => outcome.provenance,
            Some(mut merged) => {
                let next = outcome.provenance;
                merged.stages.extend(next.stages);
                merged.reranking_skipped |= next.reranking_skipped;
                merged.late_interaction_skipped |= next.late_interaction_skipped;
                merged.expansion_skipped |= next.expansion_skipped;
                merged.hybrid_degraded |= next.hybrid_degraded;
                merged.timed_out |= next.timed_out;
                merged.expanded_count += next.expanded_count;
                merged
            }
        });
    }

    fn mark_timed_out(&mut self) {
        self.provenance.get_or_insert_with(RetrievalProvenance::default).timed_out = true;
    }

    fn into_outcome(self) -> RetrievalOutcome {
        let mut provenance = self.provenance.unwrap_or_default();
        if !self.candidates.is_empty() {
            provenance.empty_level = None;
        }
        RetrievalOutcome {
            candidates: self.candidates,
            sentences: self.sentences,
            provenance,
        }
    }
}

fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
