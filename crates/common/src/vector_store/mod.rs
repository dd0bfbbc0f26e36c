//! Vector store abstraction
//!
//! The storage engine belongs to an external collaborator; the core only
//! queries, upserts and deletes vectors by chunk id.

use crate::errors::{AppError, Result};
use crate::models::ChunkId;
use crate::text::cosine_similarity;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: ChunkId,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest neighbours by cosine similarity, best first
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>>;

    async fn upsert(&self, chunk_id: &ChunkId, vector: Vec<f32>) -> Result<()>;

    async fn delete(&self, chunk_id: &ChunkId) -> Result<()>;

    async fn upsert_batch(&self, items: Vec<(ChunkId, Vec<f32>)>) -> Result<()> {
        for (id, vector) in items {
            self.upsert(&id, vector).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, chunk_ids: &[ChunkId]) -> Result<()> {
        for id in chunk_ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    async fn count(&self) -> usize;
}

/// Brute-force cosine store held in memory
#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: RwLock<HashMap<ChunkId, Vec<f32>>>,
    dimension: Option<usize>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects vectors of any other dimension
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            dimension: Some(dimension),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let vectors = self.vectors.read().await;
        let mut matches: Vec<VectorMatch> = vectors
            .iter()
            .map(|(id, v)| VectorMatch {
                chunk_id: id.clone(),
                score: cosine_similarity(vector, v),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn upsert(&self, chunk_id: &ChunkId, vector: Vec<f32>) -> Result<()> {
        if let Some(dim) = self.dimension {
            if vector.len() != dim {
                return Err(AppError::VectorStore {
                    message: format!(
                        "Dimension mismatch for {}: expected {}, got {}",
                        chunk_id,
                        dim,
                        vector.len()
                    ),
                });
            }
        }
        self.vectors.write().await.insert(chunk_id.clone(), vector);
        Ok(())
    }

    async fn delete(&self, chunk_id: &ChunkId) -> Result<()> {
        self.vectors.write().await.remove(chunk_id);
        Ok(())
    }

    async fn count(&self) -> usize {
        self.vectors.read().await.len()
    }
}
