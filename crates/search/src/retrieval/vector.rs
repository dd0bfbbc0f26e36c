//! Dense ranking through the vector store
//!
//! The store is queried for the nearest neighbours of the query embedding
//! and the result is intersected with the hierarchical candidate pool. If
//! the store fails or times out, cosine similarity is computed from the
//! snapshot's own chunk embeddings instead and the stage is marked degraded.

use crate::index::{HierarchicalIndex, QueryProbe};
use lodestar_common::errors::{AppError, Result};
use lodestar_common::resilience::ProviderGate;
use lodestar_common::models::ChunkId;
use lodestar_common::vector_store::VectorStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum neighbours requested from the store
const MIN_FETCH: usize = 64;

/// Over-fetch factor relative to the pool size
const FETCH_FACTOR: usize = 4;

#[derive(Debug, Default)]
pub struct DenseRanking {
    /// Pool members with a positive similarity, best first
    pub ranked: Vec<(ChunkId, f32)>,
    /// Provider error that forced the local fallback
    pub fallback_reason: Option<AppError>,
}

pub struct DenseRetriever {
    store: Arc<dyn VectorStore>,
    gate: ProviderGate,
}

impl DenseRetriever {
    pub fn new(store: Arc<dyn VectorStore>, gate: ProviderGate) -> Self {
        Self { store, gate }
    }

    /// Rank the pool by cosine similarity to the probe embedding
    ///
    /// Only `Cancelled` is returned as an error.
    pub async fn rank(
        &self,
        index: &HierarchicalIndex,
        pool: &[usize],
        probe: &QueryProbe,
        cancel: &CancellationToken,
    ) -> Result<DenseRanking> {
        if probe.embedding.is_empty() || pool.is_empty() {
            return Ok(DenseRanking::default());
        }

        let fetch = (pool.len() * FETCH_FACTOR).max(MIN_FETCH);
        let members: HashSet<&ChunkId> = pool.iter().map(|&c| &index.chunk(c).chunk.id).collect();

        let result = self
            .gate
            .call("vector_query", cancel, || self.store.query(&probe.embedding, fetch))
            .await;

        match result {
            Ok(matches) => {
                let mut ranked: Vec<(ChunkId, f32)> = matches
                    .into_iter()
                    .filter(|m| m.score > 0.0 && members.contains(&m.chunk_id))
                    .map(|m| (m.chunk_id, m.score))
                    .collect();
                sort_ranked(&mut ranked);
                debug!(fetched = fetch, ranked = ranked.len(), "Dense ranking from vector store");
                Ok(DenseRanking {
                    ranked,
                    fallback_reason: None,
                })
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => Ok(DenseRanking {
                ranked: local_ranking(index, pool, probe),
                fallback_reason: Some(e),
            }),
        }
    }
}

/// Cosine ranking from the snapshot's embeddings
fn local_ranking(index: &HierarchicalIndex, pool: &[usize], probe: &QueryProbe) -> Vec<(ChunkId, f32)> {
    let mut ranked: Vec<(ChunkId, f32)> = pool
        .iter()
        .map(|&c| (index.chunk(c).chunk.id.clone(), index.chunk_similarity(c, probe)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    sort_ranked(&mut ranked);
    ranked
}

fn sort_ranked(ranked: &mut [(ChunkId, f32)]) {
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::{corpus, dense_probe};
    use async_trait::async_trait;
    use lodestar_common::resilience::RetryPolicy;
    use lodestar_common::vector_store::{InMemoryVectorStore, VectorMatch};
    use std::time::Duration;

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        async fn query(&self, _vector: &[f32], _top_k: usize) -> Result<Vec<VectorMatch>> {
            Err(AppError::VectorStore { message: "offline".into() })
        }
        async fn upsert(&self, _chunk_id: &ChunkId, _vector: Vec<f32>) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _chunk_id: &ChunkId) -> Result<()> {
            Ok(())
        }
        async fn count(&self) -> usize {
            0
        }
    }

    fn gate() -> ProviderGate {
        ProviderGate::new("vector_store", 2, Duration::from_millis(500), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_store_ranking_is_restricted_to_pool() {
        let index = corpus();
        let store = Arc::new(InMemoryVectorStore::new());
        for c in 0..index.chunk_count() {
            let chunk = &index.chunk(c).chunk;
            store.upsert(&chunk.id, chunk.embedding.clone()).await.unwrap();
        }
        let retriever = DenseRetriever::new(store, gate());
        let probe = dense_probe("Banana bread needs ripe bananas and flour.");
        let recipes = (0..index.chunk_count())
            .find(|&c| index.chunk(c).chunk.path == "recipes.md")
            .unwrap();

        let ranking = retriever.rank(&index, &[recipes], &probe, &CancellationToken::new()).await.unwrap();
        assert!(ranking.fallback_reason.is_none());
        assert_eq!(ranking.ranked.len(), 1);
        assert!((ranking.ranked[0].1 - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_snapshot() {
        let index = corpus();
        let retriever = DenseRetriever::new(Arc::new(BrokenStore), gate());
        let pool: Vec<usize> = (0..index.chunk_count()).collect();
        let probe = dense_probe("Banana bread needs ripe bananas and flour.");

        let ranking = retriever.rank(&index, &pool, &probe, &CancellationToken::new()).await.unwrap();
        assert!(matches!(ranking.fallback_reason, Some(AppError::VectorStore { .. })));
        let top = index.chunk_index(&ranking.ranked[0].0).unwrap();
        assert_eq!(index.chunk(top).chunk.path, "recipes.md");
    }

    #[tokio::test]
    async fn test_missing_embedding_skips() {
        let index = corpus();
        let retriever = DenseRetriever::new(Arc::new(BrokenStore), gate());
        let probe = QueryProbe::new("grid", &[], Vec::new());
        let ranking = retriever.rank(&index, &[0, 1], &probe, &CancellationToken::new()).await.unwrap();
        assert!(ranking.ranked.is_empty());
        assert!(ranking.fallback_reason.is_none());
    }
}
