//! Cross-encoder reranking providers

use crate::config::RerankerConfig;
use crate::errors::{AppError, Result};
use crate::text;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Pointwise relevance scorer for (query, chunk) pairs
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Relevance of `chunk_text` to `query`; higher is better
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f32>;

    /// Score many chunks against one query, preserving input order
    async fn score_batch(&self, query: &str, chunk_texts: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(chunk_texts.len());
        for text in chunk_texts {
            scores.push(self.score(query, text).await?);
        }
        Ok(scores)
    }

    fn name(&self) -> &str;
}

/// Client for a hosted cross-encoder (Cohere/Jina/TEI style `/rerank`)
pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| AppError::Configuration {
            message: "providers.reranker.endpoint is required for the http reranker".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f32> {
        let scores = self.score_batch(query, &[chunk_text.to_string()]).await?;
        scores
            .into_iter()
            .next()
            .ok_or_else(|| AppError::RerankerUnavailable {
                message: "Empty response".to_string(),
            })
    }

    async fn score_batch(&self, query: &str, chunk_texts: &[String]) -> Result<Vec<f32>> {
        if chunk_texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            query,
            documents: chunk_texts,
            model: self.model.as_deref(),
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::RerankerUnavailable {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::RerankerUnavailable {
                message: format!("API error {}: {}", status, body),
            });
        }

        let parsed: RerankResponse =
            response
                .json()
                .await
                .map_err(|e| AppError::RerankerUnavailable {
                    message: format!("Failed to parse response: {}", e),
                })?;

        // Results may come back sorted by score; restore input order
        let mut scores = vec![None; chunk_texts.len()];
        for result in parsed.results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = Some(result.relevance_score);
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| AppError::RerankerUnavailable {
                    message: format!("No score returned for document {}", i),
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Deterministic term-overlap cross-scorer
///
/// Scores query-term coverage of the chunk, plus a bonus when consecutive
/// query terms appear as a phrase. Output is in [0, 1].
#[derive(Debug, Default, Clone)]
pub struct LexicalReranker;

impl LexicalReranker {
    pub fn new() -> Self {
        Self
    }

    pub fn score_sync(&self, query: &str, chunk_text: &str) -> f32 {
        let query_terms = text::key_terms(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let chunk_terms: Vec<String> = text::key_terms(chunk_text);
        let chunk_set: HashSet<String> = chunk_terms.iter().cloned().collect();
        let coverage = text::term_coverage(&query_terms, &chunk_set);

        let phrase_bonus = if query_terms.len() > 1 {
            let pairs = query_terms.windows(2).count() as f32;
            let hits = query_terms
                .windows(2)
                .filter(|pair| {
                    chunk_terms
                        .windows(2)
                        .any(|c| c[0] == pair[0] && c[1] == pair[1])
                })
                .count() as f32;
            hits / pairs
        } else {
            coverage
        };

        (0.75 * coverage + 0.25 * phrase_bonus).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f32> {
        Ok(self.score_sync(query, chunk_text))
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

/// Create a reranker from configuration; `None` disables the stage
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider.as_str() {
        "http" => Ok(Some(Arc::new(HttpReranker::new(config)?))),
        "lexical" => Ok(Some(Arc::new(LexicalReranker::new()))),
        "none" | "" => Ok(None),
        other => Err(AppError::Configuration {
            message: format!("Unknown reranker provider: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lexical_prefers_phrase_matches() {
        let reranker = LexicalReranker::new();
        let exact = reranker
            .score("grid architecture", "The GRID architecture has three layers.")
            .await
            .unwrap();
        let scattered = reranker
            .score("grid architecture", "Architecture notes. The grid is small.")
            .await
            .unwrap();
        let none = reranker.score("grid architecture", "Unrelated text.").await.unwrap();
        assert!(exact > scattered);
        assert!(scattered > none);
        assert_eq!(none, 0.0);
        assert!(exact <= 1.0);
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let reranker = LexicalReranker::new();
        let texts = vec!["nothing here".to_string(), "grid".to_string()];
        let scores = reranker.score_batch("grid", &texts).await.unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn test_factory() {
        let mut config = RerankerConfig::default();
        assert!(create_reranker(&config).unwrap().is_some());
        config.provider = "none".into();
        assert!(create_reranker(&config).unwrap().is_none());
        config.provider = "http".into();
        assert!(create_reranker(&config).is_err());
    }
}
