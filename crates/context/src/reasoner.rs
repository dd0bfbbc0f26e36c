//! Multi-step reasoning over extracted evidence
//!
//! Builds an explicit chain:
//! observation -> validation (contradictions only) -> inference per strong
//! cluster -> synthesis (two or more sources) -> conclusion or uncertainty.
//! Every step carries the evidence ids it relies on and a confidence equal
//! to the confidence-weighted mean of that evidence.

use crate::evidence::{Evidence, EvidenceSet, EvidenceStrength};
use crate::query_parser::QueryUnderstanding;
use lodestar_common::config::ReasoningConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Longest evidence excerpt quoted in a step description
const EXCERPT_CHARS: usize = 120;

/// Closed set of step kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Observation,
    Validation,
    Inference,
    Synthesis,
    Uncertainty,
    Conclusion,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Observation => "observation",
            StepKind::Validation => "validation",
            StepKind::Inference => "inference",
            StepKind::Synthesis => "synthesis",
            StepKind::Uncertainty => "uncertainty",
            StepKind::Conclusion => "conclusion",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepKind::Conclusion | StepKind::Uncertainty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based position in the chain
    pub index: usize,

    pub kind: StepKind,

    pub description: String,

    /// Confidence (0.0 - 1.0)
    pub confidence: f32,

    /// Supporting evidence, a subset of the query's evidence set
    pub evidence_ids: Vec<String>,
}

/// Ordered reasoning steps ending in exactly one terminal step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub steps: Vec<ReasoningStep>,

    /// Confidence-weighted share of query terms backed by evidence
    pub coverage: f32,

    pub strong_evidence: usize,

    /// Query terms no evidence speaks to
    pub gaps: Vec<String>,

    pub contradiction_groups: usize,
}

impl ReasoningChain {
    /// The closing conclusion or uncertainty step
    pub fn terminal(&self) -> &ReasoningStep {
        // Chains are built with a terminal step; `reason` never returns an empty chain
        &self.steps[self.steps.len() - 1]
    }

    pub fn is_conclusive(&self) -> bool {
        self.terminal().kind == StepKind::Conclusion
    }

    /// Evidence ids referenced by at least one step
    pub fn used_evidence_ids(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.evidence_ids.iter().map(String::as_str))
            .collect()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(|s| s.kind).collect()
    }
}

/// Query-term coverage of an evidence set
///
/// Mean over query terms of the best confidence among evidence matching the
/// term. Shared with the retrieval loop's sufficiency check.
pub fn coverage(understanding: &QueryUnderstanding, evidence: &EvidenceSet) -> (f32, Vec<String>) {
    if understanding.key_terms.is_empty() {
        return (0.0, Vec::new());
    }

    let mut total = 0.0;
    let mut gaps = Vec::new();
    for term in &understanding.key_terms {
        let best = evidence
            .items
            .iter()
            .filter(|e| e.matched_terms.iter().any(|m| m == term))
            .map(|e| e.confidence)
            .fold(0.0f32, f32::max);
        if best == 0.0 {
            gaps.push(term.clone());
        }
        total += best;
    }
    (total / understanding.key_terms.len() as f32, gaps)
}

/// Confidence-weighted mean: sum(c^2) / sum(c), 0.0 when empty
pub fn weighted_confidence<'a>(items: impl IntoIterator<Item = &'a Evidence>) -> f32 {
    let (num, den) = items
        .into_iter()
        .fold((0.0f32, 0.0f32), |(n, d), e| (n + e.confidence * e.confidence, d + e.confidence));
    if den > 0.0 {
        (num / den).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub struct ReasoningEngine {
    config: ReasoningConfig,
}

impl ReasoningEngine {
    pub fn new(config: ReasoningConfig) -> Self {
        Self { config }
    }

    /// Whether evidence suffices for a conclusion
    pub fn is_sufficient(&self, strong_evidence: usize, coverage: f32) -> bool {
        strong_evidence >= self.config.strong_evidence_threshold || coverage >= self.config.coverage_threshold
    }

    pub fn reason(&self, understanding: &QueryUnderstanding, evidence: &EvidenceSet) -> ReasoningChain {
        let mut steps = Vec::new();
        let (coverage, gaps) = coverage(understanding, evidence);
        let strong: Vec<&Evidence> = evidence.strong().collect();

        steps.push(self.observation(understanding, evidence));

        if evidence.has_contradictions() {
            steps.push(self.validation(evidence));
        }

        for cluster in clusters(&strong).into_iter().take(self.config.max_inference_steps) {
            steps.push(inference(&cluster));
        }

        let supported: Vec<&Evidence> = evidence
            .items
            .iter()
            .filter(|e| e.strength >= EvidenceStrength::Moderate)
            .collect();
        let supported_files: BTreeSet<&str> = supported.iter().map(|e| e.file.as_str()).collect();
        if supported_files.len() >= 2 {
            steps.push(ReasoningStep {
                index: 0,
                kind: StepKind::Synthesis,
                description: format!(
                    "Combined {} evidence units across {} sources: {}",
                    supported.len(),
                    supported_files.len(),
                    supported_files.iter().copied().collect::<Vec<_>>().join(", ")
                ),
                confidence: weighted_confidence(supported.iter().copied()),
                evidence_ids: ids(&supported),
            });
        }

        if self.is_sufficient(strong.len(), coverage) {
            let support: Vec<&Evidence> = if strong.is_empty() {
                evidence.items.iter().filter(|e| !e.matched_terms.is_empty()).collect()
            } else {
                strong.clone()
            };
            steps.push(ReasoningStep {
                index: 0,
                kind: StepKind::Conclusion,
                description: format!(
                    "Answer supported by {} evidence units (coverage {:.2})",
                    support.len(),
                    coverage
                ),
                confidence: weighted_confidence(support.iter().copied()),
                evidence_ids: ids(&support),
            });
        } else {
            let partial: Vec<&Evidence> = evidence.items.iter().filter(|e| !e.matched_terms.is_empty()).collect();
            let description = if gaps.is_empty() {
                format!("Evidence is too weak to answer confidently (coverage {:.2})", coverage)
            } else {
                format!("Insufficient evidence for: {}", gaps.join(", "))
            };
            steps.push(ReasoningStep {
                index: 0,
                kind: StepKind::Uncertainty,
                description,
                confidence: (coverage * weighted_confidence(evidence.items.iter())).clamp(0.0, 1.0),
                evidence_ids: ids(&partial),
            });
        }

        for (idx, step) in steps.iter_mut().enumerate() {
            step.index = idx + 1;
        }

        debug!(
            steps = steps.len(),
            coverage,
            strong = strong.len(),
            gaps = gaps.len(),
            "Built reasoning chain"
        );

        ReasoningChain {
            steps,
            coverage,
            strong_evidence: strong.len(),
            gaps,
            contradiction_groups: evidence.contradiction_groups,
        }
    }

    fn observation(&self, understanding: &QueryUnderstanding, evidence: &EvidenceSet) -> ReasoningStep {
        let description = if evidence.is_empty() {
            format!("No evidence found for {} query", understanding.intent.as_str())
        } else {
            format!(
                "Collected {} evidence units from {} files for {} query",
                evidence.len(),
                evidence.files().len(),
                understanding.intent.as_str()
            )
        };
        ReasoningStep {
            index: 0,
            kind: StepKind::Observation,
            description,
            confidence: weighted_confidence(evidence.items.iter()),
            evidence_ids: evidence.items.iter().map(|e| e.id.clone()).collect(),
        }
    }

    fn validation(&self, evidence: &EvidenceSet) -> ReasoningStep {
        let conflicting: Vec<&Evidence> = evidence
            .items
            .iter()
            .filter(|e| e.contradiction_group.is_some())
            .collect();
        ReasoningStep {
            index: 0,
            kind: StepKind::Validation,
            description: format!(
                "Found {} conflicting statement groups across {} evidence units",
                evidence.contradiction_groups,
                conflicting.len()
            ),
            confidence: weighted_confidence(conflicting.iter().copied()),
            evidence_ids: ids(&conflicting),
        }
    }
}

fn inference(cluster: &[&Evidence]) -> ReasoningStep {
    let files: BTreeSet<&str> = cluster.iter().map(|e| e.file.as_str()).collect();
    let lead = cluster.first().map(|e| excerpt(&e.text)).unwrap_or_default();
    ReasoningStep {
        index: 0,
        kind: StepKind::Inference,
        description: format!(
            "{} strong evidence units from {} agree: {}",
            cluster.len(),
            files.into_iter().collect::<Vec<_>>().join(", "),
            lead
        ),
        confidence: weighted_confidence(cluster.iter().copied()),
        evidence_ids: ids(cluster),
    }
}

/// Connected components of strong evidence
///
/// Two units are linked when they share a matched query term, come from the
/// same chunk, or one references the other's file.
fn clusters<'a>(strong: &[&'a Evidence]) -> Vec<Vec<&'a Evidence>> {
    let mut assigned = vec![false; strong.len()];
    let mut out = Vec::new();

    for seed in 0..strong.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut members = vec![seed];
        let mut cursor = 0;
        while cursor < members.len() {
            let current = strong[members[cursor]];
            for other in 0..strong.len() {
                if !assigned[other] && linked(current, strong[other]) {
                    assigned[other] = true;
                    members.push(other);
                }
            }
            cursor += 1;
        }
        members.sort_unstable();
        out.push(members.into_iter().map(|idx| strong[idx]).collect());
    }
    out
}

fn linked(a: &Evidence, b: &Evidence) -> bool {
    if a.chunk_id == b.chunk_id {
        return true;
    }
    let terms: HashSet<&str> = a.matched_terms.iter().map(String::as_str).collect();
    if b.matched_terms.iter().any(|t| terms.contains(t.as_str())) {
        return true;
    }
    references_file(a, &b.file) || references_file(b, &a.file)
}

fn references_file(evidence: &Evidence, file: &str) -> bool {
    evidence
        .references
        .iter()
        .any(|r| !r.target.is_empty() && (file.ends_with(&r.target) || r.target.ends_with(file)))
}

fn ids(items: &[&Evidence]) -> Vec<String> {
    items.iter().map(|e| e.id.clone()).collect()
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{ClaimShape, EvidenceType};
    use crate::query_parser::{QueryParser, QueryParserConfig};
    use lodestar_common::models::{ChunkId, DocumentId, LineRange};

    fn ev(id: &str, file: &str, confidence: f32, terms: &[&str]) -> Evidence {
        let strength = if confidence >= 0.75 {
            EvidenceStrength::Strong
        } else if confidence >= 0.5 {
            EvidenceStrength::Moderate
        } else {
            EvidenceStrength::Weak
        };
        Evidence {
            id: id.to_string(),
            chunk_id: ChunkId(format!("{}-{}", file, id)),
            document_id: DocumentId::new(file),
            file: file.to_string(),
            lines: LineRange::new(1, 2),
            evidence_type: EvidenceType::Definition,
            shape: ClaimShape::Sentence,
            strength,
            confidence,
            text: format!("Statement {} about grid", id),
            matched_terms: terms.iter().map(|t| t.to_string()).collect(),
            retrieval_score: 0.8,
            references: Vec::new(),
            contradiction_group: None,
        }
    }

    fn understand(query: &str) -> QueryUnderstanding {
        QueryParser::new(QueryParserConfig::default()).parse(query).unwrap()
    }

    fn set(items: Vec<Evidence>) -> EvidenceSet {
        let contradiction_groups = items
            .iter()
            .filter_map(|e| e.contradiction_group)
            .collect::<BTreeSet<_>>()
            .len();
        EvidenceSet {
            items,
            contradiction_groups,
            claims_considered: 0,
        }
    }

    #[test]
    fn test_full_chain_ends_in_conclusion() {
        let understanding = understand("What is the GRID architecture?");
        let evidence = set(vec![
            ev("ev-1", "ARCHITECTURE.md", 0.95, &["architecture", "grid"]),
            ev("ev-2", "README.md", 0.85, &["grid"]),
            ev("ev-3", "engine.py", 0.8, &["architecture", "grid"]),
            ev("ev-4", "ARCHITECTURE.md", 0.55, &[]),
        ]);

        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &evidence);

        assert_eq!(
            chain.kinds(),
            vec![
                StepKind::Observation,
                StepKind::Inference,
                StepKind::Synthesis,
                StepKind::Conclusion
            ]
        );
        assert_eq!(chain.steps.iter().map(|s| s.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(chain.is_conclusive());
        assert_eq!(chain.strong_evidence, 3);
        assert!((chain.coverage - 0.95).abs() < 1e-6);

        let expected = (0.95f32 * 0.95 + 0.85 * 0.85 + 0.8 * 0.8) / (0.95 + 0.85 + 0.8);
        assert!((chain.terminal().confidence - expected).abs() < 1e-5);
    }

    #[test]
    fn test_step_evidence_is_subset_and_confidence_bounded() {
        let understanding = understand("What is the GRID architecture?");
        let evidence = set(vec![
            ev("ev-1", "a.md", 0.9, &["grid"]),
            ev("ev-2", "b.md", 0.4, &["architecture"]),
        ]);

        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &evidence);

        let known: BTreeSet<&str> = evidence.items.iter().map(|e| e.id.as_str()).collect();
        assert!(chain.used_evidence_ids().is_subset(&known));
        for step in &chain.steps {
            assert!((0.0..=1.0).contains(&step.confidence));
        }
    }

    #[test]
    fn test_no_evidence_yields_uncertainty() {
        let understanding = understand("quantum flux capacitor");
        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &EvidenceSet::default());

        assert_eq!(chain.kinds(), vec![StepKind::Observation, StepKind::Uncertainty]);
        assert_eq!(chain.terminal().confidence, 0.0);
        assert_eq!(chain.gaps, vec!["quantum", "flux", "capacitor"]);
        assert!(chain.terminal().description.contains("quantum, flux, capacitor"));
    }

    #[test]
    fn test_weak_partial_evidence_names_gap() {
        let understanding = understand("grid retry policy");
        let evidence = set(vec![ev("ev-1", "a.md", 0.6, &["grid"])]);

        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &evidence);

        assert_eq!(chain.terminal().kind, StepKind::Uncertainty);
        assert_eq!(chain.gaps, vec!["retry", "policy"]);
        assert_eq!(chain.terminal().evidence_ids, vec!["ev-1"]);
        // coverage 0.2 times weighted mean 0.6
        assert!((chain.terminal().confidence - 0.12).abs() < 1e-5);
    }

    #[test]
    fn test_contradictions_add_validation_step() {
        let understanding = understand("grid retries");
        let mut a = ev("ev-1", "a.md", 0.8, &["grid", "retry"]);
        let mut b = ev("ev-2", "b.md", 0.78, &["grid", "retry"]);
        a.contradiction_group = Some(1);
        b.contradiction_group = Some(1);
        let evidence = set(vec![a, b]);

        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &evidence);

        assert_eq!(chain.steps[1].kind, StepKind::Validation);
        assert_eq!(chain.steps[1].evidence_ids, vec!["ev-1", "ev-2"]);
        assert_eq!(chain.contradiction_groups, 1);
    }

    #[test]
    fn test_disjoint_strong_evidence_forms_separate_inferences() {
        let understanding = understand("grid scheduler worker pool");
        let evidence = set(vec![
            ev("ev-1", "a.md", 0.9, &["grid"]),
            ev("ev-2", "b.md", 0.88, &["scheduler"]),
            ev("ev-3", "c.md", 0.86, &["worker"]),
            ev("ev-4", "d.md", 0.84, &["pool"]),
        ]);

        let chain = ReasoningEngine::new(ReasoningConfig::default()).reason(&understanding, &evidence);

        let inferences = chain.steps.iter().filter(|s| s.kind == StepKind::Inference).count();
        assert_eq!(inferences, 3);
        assert!(chain.is_conclusive());
    }
}
