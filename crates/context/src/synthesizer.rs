//! Response synthesis
//!
//! Provides:
//! - Language model prose over the reasoning chain's evidence, when a model
//!   is configured and answers
//! - Deterministic template assembly otherwise
//! - Citations for every (file, line range) a reasoning step relied on
//! - Overall confidence with penalties for contradictions, timeouts and
//!   incomplete retrieval chains

use crate::corag::RetrievalChain;
use crate::evidence::{ClaimShape, Evidence, EvidenceSet};
use crate::query_parser::{QueryIntent, QueryUnderstanding};
use crate::reasoner::{ReasoningChain, StepKind};
use lodestar_common::config::SynthesisConfig;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::models::{ChunkId, LineRange};
use lodestar_common::providers::LanguageModel;
use lodestar_common::resilience::{deadline_passed, within_deadline, ProviderGate};
use lodestar_search::retrieval::StageStatus;
use lodestar_search::{RetrievalOutcome, RetrievalProvenance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest evidence excerpt in a templated answer line
const POINT_CHARS: usize = 240;

const NO_INFORMATION: &str = "No relevant information was found in the indexed sources for this question.";

/// Source location cited by the answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub file: String,

    pub lines: LineRange,

    /// Evidence units at this location
    pub evidence_ids: Vec<String>,
}

/// Retrieved chunk in final rank order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: ChunkId,
    pub file: String,
    pub lines: LineRange,
    pub rank: usize,
    pub relevance: f32,
    pub hop_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    LanguageModel,
    Template,
}

/// Flags, degradations and provenance reported with every answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub intent: QueryIntent,

    pub intent_confidence: f32,

    /// Query after conversational context was applied, when it changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconstructed_query: Option<String>,

    pub index_version: u64,

    pub has_contradictions: bool,

    pub reranking_skipped: bool,

    pub timed_out: bool,

    pub potentially_incomplete: bool,

    pub synthesis_mode: SynthesisMode,

    /// Language model synthesis failed and the template was used
    pub synthesis_fallback: bool,

    /// Query terms without supporting evidence
    pub gaps: Vec<String>,

    /// Human-readable list of skipped or degraded stages
    pub degradations: Vec<String>,

    pub retrieval_hops: usize,

    pub duration_ms: u64,

    pub provenance: RetrievalProvenance,
}

/// Final answer with its full reasoning trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedResponse {
    pub answer: String,

    /// Ordered by file, then start line
    pub citations: Vec<Citation>,

    /// Confidence (0.0 - 1.0)
    pub confidence: f32,

    pub reasoning: ReasoningChain,

    pub evidence: Vec<Evidence>,

    pub sources: Vec<SourceRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_chain: Option<RetrievalChain>,

    pub metadata: ResponseMetadata,
}

/// Everything the synthesizer needs for one query
pub struct SynthesisInput<'a> {
    pub understanding: &'a QueryUnderstanding,
    /// Set when conversation context changed the query
    pub reconstructed_query: Option<String>,
    pub evidence: EvidenceSet,
    pub reasoning: ReasoningChain,
    pub retrieval: RetrievalOutcome,
    pub retrieval_chain: Option<RetrievalChain>,
    /// Past this instant the language model is not waited on
    pub deadline: Option<Instant>,
}

pub struct ResponseSynthesizer {
    config: SynthesisConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    llm_gate: ProviderGate,
}

impl ResponseSynthesizer {
    pub fn new(config: SynthesisConfig, llm: Option<Arc<dyn LanguageModel>>, llm_gate: ProviderGate) -> Self {
        Self { config, llm, llm_gate }
    }

    /// Assemble the response; only cancellation is returned as an error
    pub async fn synthesize(&self, input: SynthesisInput<'_>, cancel: &CancellationToken) -> Result<SynthesizedResponse> {
        let SynthesisInput {
            understanding,
            reconstructed_query,
            evidence,
            reasoning,
            retrieval,
            retrieval_chain,
            deadline,
        } = input;

        let provenance = retrieval.provenance;
        let mut degradations: Vec<String> = provenance
            .stages
            .iter()
            .filter(|r| r.status != StageStatus::Completed)
            .map(|r| {
                let status = if r.status == StageStatus::Skipped { "skipped" } else { "degraded" };
                match &r.detail {
                    Some(detail) => format!("{}: {} ({})", r.stage.as_str(), status, detail),
                    None => format!("{}: {}", r.stage.as_str(), status),
                }
            })
            .collect();

        let points = supporting_points(&reasoning, &evidence, self.config.max_supporting_points);
        let mut synthesis_mode = SynthesisMode::Template;
        let mut synthesis_fallback = false;
        let mut timed_out = provenance.timed_out;
        let mut answer = None;

        if let Some(llm) = self.llm.as_ref().filter(|_| self.config.use_llm && !points.is_empty()) {
            let generated = if deadline_passed(deadline) {
                None
            } else {
                within_deadline(deadline, self.generate(llm, understanding, &reasoning, &points, cancel)).await
            };
            match generated {
                Some(Ok(text)) => {
                    answer = Some(text);
                    synthesis_mode = SynthesisMode::LanguageModel;
                }
                Some(Err(e)) if e.is_cancelled() => return Err(e),
                Some(Err(e)) => {
                    warn!(error = %e, "Synthesis failed, using template");
                    timed_out |= matches!(e, AppError::RetrievalTimeout { .. });
                    degradations.push("synthesis: template fallback".to_string());
                    synthesis_fallback = true;
                }
                None => {
                    warn!("Request deadline reached before synthesis, using template");
                    timed_out = true;
                    degradations.push("synthesis: template fallback".to_string());
                    synthesis_fallback = true;
                }
            }
        }
        let answer = answer.unwrap_or_else(|| template_answer(&reasoning, &evidence, &points));

        let citations = citations(&reasoning, &evidence);
        let has_contradictions = evidence.has_contradictions();
        let potentially_incomplete = retrieval_chain.as_ref().is_some_and(|c| c.potentially_incomplete);

        let mut confidence = reasoning.terminal().confidence;
        if has_contradictions {
            confidence *= self.config.contradiction_penalty;
        }
        if timed_out {
            confidence *= self.config.timeout_penalty;
        }
        if potentially_incomplete {
            confidence *= self.config.incomplete_penalty;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let sources = retrieval
            .candidates
            .iter()
            .map(|c| SourceRef {
                chunk_id: c.chunk.id.clone(),
                file: c.chunk.path.clone(),
                lines: c.chunk.lines,
                rank: c.rank,
                relevance: c.relevance,
                hop_depth: c.hop_depth,
            })
            .collect();

        debug!(
            citations = citations.len(),
            confidence,
            mode = ?synthesis_mode,
            "Synthesized response"
        );

        Ok(SynthesizedResponse {
            answer,
            citations,
            confidence,
            metadata: ResponseMetadata {
                intent: understanding.intent,
                intent_confidence: understanding.intent_confidence,
                reconstructed_query,
                index_version: provenance.index_version,
                has_contradictions,
                reranking_skipped: provenance.reranking_skipped,
                timed_out,
                potentially_incomplete,
                synthesis_mode,
                synthesis_fallback,
                gaps: reasoning.gaps.clone(),
                degradations,
                retrieval_hops: retrieval_chain.as_ref().map_or(1, |c| c.hops.len()),
                duration_ms: 0,
                provenance,
            },
            reasoning,
            evidence: evidence.items,
            sources,
            retrieval_chain,
        })
    }

    async fn generate(
        &self,
        llm: &Arc<dyn LanguageModel>,
        understanding: &QueryUnderstanding,
        reasoning: &ReasoningChain,
        points: &[&Evidence],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prompt = synthesis_prompt(understanding, reasoning, points);
        let text = self
            .llm_gate
            .call("synthesize", cancel, || llm.complete(&prompt))
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::SynthesisFailure {
                message: "language model returned an empty answer".to_string(),
            });
        }
        Ok(text.to_string())
    }
}

fn synthesis_prompt(understanding: &QueryUnderstanding, reasoning: &ReasoningChain, points: &[&Evidence]) -> String {
    let mut prompt = format!(
        "Answer the question using ONLY the evidence below. Cite sources inline as [file:lines]. \
         If the evidence does not answer the question, say so.\n\n\
         Question: {}\n\n\
         Evidence:\n",
        understanding.original_query
    );
    for point in points {
        prompt.push_str(&format!("- {} [{}:{}]\n", flatten(&point.text), point.file, point.lines));
    }
    let terminal = reasoning.terminal();
    prompt.push_str(&format!("\nAssessment: {}\n\nAnswer:", terminal.description));
    prompt
}

/// Evidence behind the terminal step, best first, falling back to all used evidence
fn supporting_points<'a>(reasoning: &ReasoningChain, evidence: &'a EvidenceSet, limit: usize) -> Vec<&'a Evidence> {
    let terminal: HashSet<&str> = reasoning.terminal().evidence_ids.iter().map(String::as_str).collect();
    let used = reasoning.used_evidence_ids();
    let preferred: Vec<&Evidence> = evidence.items.iter().filter(|e| terminal.contains(e.id.as_str())).collect();
    let pool = if preferred.is_empty() {
        evidence.items.iter().filter(|e| used.contains(e.id.as_str())).collect()
    } else {
        preferred
    };
    pool.into_iter().take(limit.max(1)).collect()
}

fn template_answer(reasoning: &ReasoningChain, evidence: &EvidenceSet, points: &[&Evidence]) -> String {
    if points.is_empty() {
        return NO_INFORMATION.to_string();
    }

    let terminal = reasoning.terminal();
    let mut answer = if terminal.kind == StepKind::Conclusion {
        "Based on the indexed sources:\n".to_string()
    } else {
        format!(
            "The indexed sources do not fully answer this question. {}.\n\nRelated findings:\n",
            terminal.description
        )
    };

    for point in points {
        let text = match point.shape {
            ClaimShape::CodeBlock => format!("`{}`", flatten(&point.text)),
            _ => flatten(&point.text),
        };
        answer.push_str(&format!("\n- {} [{}:{}]", text, point.file, point.lines));
    }

    if evidence.has_contradictions() {
        answer.push_str("\n\nNote: some sources disagree; conflicting statements are flagged in the evidence.");
    }
    answer
}

/// Deduplicated (file, line range) pairs of evidence used by any step
fn citations(reasoning: &ReasoningChain, evidence: &EvidenceSet) -> Vec<Citation> {
    let used = reasoning.used_evidence_ids();
    let mut grouped: BTreeMap<(String, usize, usize), Vec<String>> = BTreeMap::new();
    for item in evidence.items.iter().filter(|e| used.contains(e.id.as_str())) {
        grouped
            .entry((item.file.clone(), item.lines.start, item.lines.end))
            .or_default()
            .push(item.id.clone());
    }
    grouped
        .into_iter()
        .map(|((file, start, end), evidence_ids)| Citation {
            file,
            lines: LineRange::new(start, end),
            evidence_ids,
        })
        .collect()
}

fn flatten(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= POINT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(POINT_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceStrength, EvidenceType};
    use crate::query_parser::{QueryParser, QueryParserConfig};
    use crate::reasoner::ReasoningEngine;
    use async_trait::async_trait;
    use lodestar_common::config::ReasoningConfig;
    use lodestar_common::models::DocumentId;
    use lodestar_common::resilience::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedLlm {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().ok_or_else(|| AppError::LanguageModelUnavailable {
                message: "scripted outage".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn ev(id: &str, file: &str, lines: (usize, usize), confidence: f32, terms: &[&str]) -> Evidence {
        Evidence {
            id: id.to_string(),
            chunk_id: ChunkId(format!("{}-chunk", file)),
            document_id: DocumentId::new(file),
            file: file.to_string(),
            lines: LineRange::new(lines.0, lines.1),
            evidence_type: EvidenceType::Definition,
            shape: ClaimShape::Sentence,
            strength: if confidence >= 0.75 {
                EvidenceStrength::Strong
            } else {
                EvidenceStrength::Moderate
            },
            confidence,
            text: format!("Evidence {} about the grid architecture.", id),
            matched_terms: terms.iter().map(|t| t.to_string()).collect(),
            retrieval_score: 0.8,
            references: Vec::new(),
            contradiction_group: None,
        }
    }

    fn understanding() -> QueryUnderstanding {
        QueryParser::new(QueryParserConfig::default())
            .parse("What is the GRID architecture?")
            .unwrap()
    }

    fn evidence() -> EvidenceSet {
        EvidenceSet {
            items: vec![
                ev("ev-1", "README.md", (3, 3), 0.95, &["grid", "architecture"]),
                ev("ev-2", "ARCHITECTURE.md", (3, 4), 0.9, &["grid", "architecture"]),
                ev("ev-3", "ARCHITECTURE.md", (3, 4), 0.85, &["grid"]),
                ev("ev-4", "ARCHITECTURE.md", (1, 1), 0.8, &["architecture"]),
            ],
            contradiction_groups: 0,
            claims_considered: 4,
        }
    }

    fn synthesizer(llm: Option<Arc<dyn LanguageModel>>) -> ResponseSynthesizer {
        let gate = ProviderGate::new("llm", 2, Duration::from_secs(1), RetryPolicy::none());
        ResponseSynthesizer::new(SynthesisConfig::default(), llm, gate)
    }

    fn input<'a>(understanding: &'a QueryUnderstanding, evidence: EvidenceSet) -> SynthesisInput<'a> {
        let reasoning = ReasoningEngine::new(ReasoningConfig::default()).reason(understanding, &evidence);
        SynthesisInput {
            understanding,
            reconstructed_query: None,
            evidence,
            reasoning,
            retrieval: RetrievalOutcome::default(),
            retrieval_chain: None,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_template_answer_and_sorted_citations() {
        let understanding = understanding();
        let response = synthesizer(None)
            .synthesize(input(&understanding, evidence()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.metadata.synthesis_mode, SynthesisMode::Template);
        assert!(!response.metadata.synthesis_fallback);
        assert!(response.answer.starts_with("Based on the indexed sources:"));
        assert!(response.answer.contains("[README.md:L3]"));

        let cited: Vec<(&str, usize, usize)> = response
            .citations
            .iter()
            .map(|c| (c.file.as_str(), c.lines.start, c.lines.end))
            .collect();
        assert_eq!(
            cited,
            vec![("ARCHITECTURE.md", 1, 1), ("ARCHITECTURE.md", 3, 4), ("README.md", 3, 3)]
        );
        assert_eq!(response.citations[1].evidence_ids, vec!["ev-2", "ev-3"]);

        let used = response.reasoning.used_evidence_ids();
        for citation in &response.citations {
            assert!(citation.evidence_ids.iter().all(|id| used.contains(id.as_str())));
        }
        assert!((response.confidence - response.reasoning.terminal().confidence).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_language_model_answer_is_used() {
        let llm = Arc::new(ScriptedLlm {
            reply: Some("  GRID has a layered architecture [ARCHITECTURE.md:L3-L4].  ".to_string()),
            calls: AtomicUsize::new(0),
        });
        let understanding = understanding();
        let response = synthesizer(Some(llm.clone()))
            .synthesize(input(&understanding, evidence()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.metadata.synthesis_mode, SynthesisMode::LanguageModel);
        assert_eq!(response.answer, "GRID has a layered architecture [ARCHITECTURE.md:L3-L4].");
    }

    #[tokio::test]
    async fn test_language_model_failure_falls_back_to_template() {
        let llm = Arc::new(ScriptedLlm {
            reply: None,
            calls: AtomicUsize::new(0),
        });
        let understanding = understanding();
        let response = synthesizer(Some(llm))
            .synthesize(input(&understanding, evidence()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.metadata.synthesis_mode, SynthesisMode::Template);
        assert!(response.metadata.synthesis_fallback);
        assert!(response
            .metadata
            .degradations
            .contains(&"synthesis: template fallback".to_string()));
        assert!(response.answer.starts_with("Based on the indexed sources:"));
    }

    #[tokio::test]
    async fn test_empty_evidence_reports_no_information() {
        let llm = Arc::new(ScriptedLlm {
            reply: Some("unused".to_string()),
            calls: AtomicUsize::new(0),
        });
        let understanding = understanding();
        let response = synthesizer(Some(llm.clone()))
            .synthesize(input(&understanding, EvidenceSet::default()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.answer, NO_INFORMATION);
        assert!(response.citations.is_empty());
        assert_eq!(response.confidence, 0.0);
        assert_eq!(response.reasoning.terminal().kind, StepKind::Uncertainty);
    }

    #[tokio::test]
    async fn test_penalties_compound() {
        let understanding = understanding();
        let mut items = evidence();
        items.items[0].contradiction_group = Some(1);
        items.items[1].contradiction_group = Some(1);
        items.contradiction_groups = 1;
        let mut input = input(&understanding, items);
        input.retrieval.provenance.timed_out = true;
        let terminal = input.reasoning.terminal().confidence;

        let response = synthesizer(None)
            .synthesize(input, &CancellationToken::new())
            .await
            .unwrap();

        assert!(response.metadata.has_contradictions);
        assert!(response.metadata.timed_out);
        assert!((response.confidence - terminal * 0.85 * 0.8).abs() < 1e-5);
        assert!(response.answer.contains("some sources disagree"));
    }

    #[tokio::test]
    async fn test_passed_deadline_skips_the_language_model() {
        let llm = Arc::new(ScriptedLlm {
            reply: Some("GRID has three layers.".to_string()),
            calls: AtomicUsize::new(0),
        });
        let understanding = understanding();
        let mut input = input(&understanding, evidence());
        input.deadline = Some(Instant::now());
        let terminal = input.reasoning.terminal().confidence;

        let response = synthesizer(Some(llm.clone()))
            .synthesize(input, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.metadata.synthesis_mode, SynthesisMode::Template);
        assert!(response.metadata.synthesis_fallback);
        assert!(response.metadata.timed_out);
        assert!(!response.citations.is_empty());
        assert!((response.confidence - terminal * 0.8).abs() < 1e-5);
    }
}
