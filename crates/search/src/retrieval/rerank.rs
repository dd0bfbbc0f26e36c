//! Reranking stages
//!
//! The cross-encoder rescores the top-M candidates pointwise; late
//! interaction then rescores the reranker's top-K with MaxSim over term
//! embeddings. Both only reorder their own prefix and leave the tail as it
//! was. Candidates are only touched when the provider call succeeds, so a
//! failure leaves the previous ordering intact.

use super::RetrievalCandidate;
use lodestar_common::embeddings::Embedder;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::providers::Reranker;
use lodestar_common::resilience::ProviderGate;
use lodestar_common::text;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Key terms per chunk embedded for late interaction
const MAX_CHUNK_TERMS: usize = 32;

/// Rescore the first `top_m` candidates with the cross-encoder
///
/// Returns `Ok(false)` when there was nothing to rerank.
pub async fn apply_cross_encoder(
    candidates: &mut [RetrievalCandidate],
    query: &str,
    reranker: &dyn Reranker,
    gate: &ProviderGate,
    top_m: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let m = top_m.min(candidates.len());
    if m == 0 {
        return Ok(false);
    }

    let texts: Vec<String> = candidates[..m].iter().map(|c| c.chunk.text.clone()).collect();
    let scores = gate
        .call("rerank", cancel, || reranker.score_batch(query, &texts))
        .await?;

    if scores.len() != m {
        return Err(AppError::RerankerUnavailable {
            message: format!("expected {} scores, got {}", m, scores.len()),
        });
    }

    for (candidate, score) in candidates[..m].iter_mut().zip(scores) {
        candidate.scores.reranked = Some(score);
    }
    // Stable: equal scores keep their fused order
    candidates[..m].sort_by(|a, b| {
        let (a, b) = (a.scores.reranked.unwrap_or(0.0), b.scores.reranked.unwrap_or(0.0));
        b.total_cmp(&a)
    });

    debug!(reranker = reranker.name(), reranked = m, "Cross-encoder rerank applied");
    Ok(true)
}

/// Rescore the first `top_k` candidates with MaxSim late interaction
///
/// Each query term is matched to its most similar chunk term; the chunk
/// score is the mean of those maxima. All terms go out in one batch.
pub async fn apply_late_interaction(
    candidates: &mut [RetrievalCandidate],
    query: &str,
    embedder: &dyn Embedder,
    gate: &ProviderGate,
    top_k: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let k = top_k.min(candidates.len());
    let query_terms = text::key_terms(query);
    if k == 0 || query_terms.is_empty() {
        return Ok(false);
    }

    let chunk_terms: Vec<Vec<String>> = candidates[..k]
        .iter()
        .map(|c| {
            let mut terms = text::key_terms(&c.chunk.text);
            terms.truncate(MAX_CHUNK_TERMS);
            terms
        })
        .collect();

    let mut batch: Vec<String> = query_terms.clone();
    for terms in &chunk_terms {
        batch.extend(terms.iter().cloned());
    }

    let vectors = gate
        .call("late_interaction", cancel, || embedder.embed_batch(&batch))
        .await?;
    if vectors.len() != batch.len() {
        return Err(AppError::EmbeddingUnavailable {
            message: format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
        });
    }

    let (query_vectors, mut rest) = vectors.split_at(query_terms.len());
    for (candidate, terms) in candidates[..k].iter_mut().zip(&chunk_terms) {
        let (own, tail) = rest.split_at(terms.len());
        rest = tail;
        candidate.scores.late_interaction = Some(max_sim(query_vectors, own));
    }

    candidates[..k].sort_by(|a, b| {
        let (a, b) = (
            a.scores.late_interaction.unwrap_or(0.0),
            b.scores.late_interaction.unwrap_or(0.0),
        );
        b.total_cmp(&a)
    });

    debug!(rescored = k, "Late-interaction rerank applied");
    Ok(true)
}

/// Mean over query vectors of the best cosine against any document vector
fn max_sim(query: &[Vec<f32>], document: &[Vec<f32>]) -> f32 {
    if query.is_empty() || document.is_empty() {
        return 0.0;
    }
    let total: f32 = query
        .iter()
        .map(|q| {
            document
                .iter()
                .map(|d| text::cosine_similarity(q, d))
                .fold(0.0f32, f32::max)
        })
        .sum();
    (total / query.len() as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::{chunk, DIM};
    use crate::retrieval::StageScores;
    use async_trait::async_trait;
    use lodestar_common::embeddings::HashingEmbedder;
    use lodestar_common::models::ContentType;
    use lodestar_common::providers::LexicalReranker;
    use lodestar_common::resilience::RetryPolicy;
    use std::time::Duration;

    struct DownReranker;

    #[async_trait]
    impl Reranker for DownReranker {
        async fn score(&self, _query: &str, _chunk_text: &str) -> Result<f32> {
            Err(AppError::RerankerUnavailable { message: "503".into() })
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    fn candidates(texts: &[&str]) -> Vec<RetrievalCandidate> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| RetrievalCandidate {
                chunk: chunk("doc", "notes.md", 0, i * 100, t, ContentType::Prose),
                index: i,
                scores: StageScores {
                    fused: 1.0 / (61.0 + i as f32),
                    ..StageScores::default()
                },
                dense_rank: Some(i + 1),
                sparse_rank: None,
                hop_depth: 0,
                rank: 0,
                relevance: 0.0,
            })
            .collect()
    }

    fn gate() -> ProviderGate {
        ProviderGate::new("reranker", 2, Duration::from_millis(500), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_cross_encoder_reorders_prefix_only() {
        let mut list = candidates(&[
            "Unrelated text about gardening.",
            "The scheduler assigns jobs to workers.",
            "Tail entry about the scheduler and jobs.",
        ]);
        let applied = apply_cross_encoder(
            &mut list,
            "how does the scheduler assign jobs",
            &LexicalReranker::new(),
            &gate(),
            2,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(applied);
        assert!(list[0].chunk.text.starts_with("The scheduler"));
        assert!(list[1].chunk.text.starts_with("Unrelated"));
        assert!(list[2].scores.reranked.is_none());
    }

    #[tokio::test]
    async fn test_failure_leaves_order_untouched() {
        let mut list = candidates(&["first", "second"]);
        let before: Vec<String> = list.iter().map(|c| c.chunk.text.clone()).collect();
        let result = apply_cross_encoder(&mut list, "query", &DownReranker, &gate(), 5, &CancellationToken::new()).await;

        assert!(matches!(result, Err(AppError::RerankerUnavailable { .. })));
        let after: Vec<String> = list.iter().map(|c| c.chunk.text.clone()).collect();
        assert_eq!(before, after);
        assert!(list.iter().all(|c| c.scores.reranked.is_none()));
    }

    #[tokio::test]
    async fn test_late_interaction_scores_term_matches() {
        let mut list = candidates(&["Bananas and flour make bread.", "Workers pick jobs from the scheduler queue."]);
        let embedder = HashingEmbedder::new(DIM);
        let applied = apply_late_interaction(
            &mut list,
            "scheduler jobs",
            &embedder,
            &gate(),
            10,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(applied);
        assert!(list[0].chunk.text.starts_with("Workers"));
        assert!((list[0].scores.late_interaction.unwrap() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_max_sim_bounds() {
        assert_eq!(max_sim(&[], &[vec![1.0]]), 0.0);
        assert_eq!(max_sim(&[vec![1.0, 0.0]], &[]), 0.0);
        let score = max_sim(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[vec![1.0, 0.0]]);
        assert!((score - 0.5).abs() < 1e-6);
    }
}
