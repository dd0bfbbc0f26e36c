//! Guarded access to external providers
//!
//! Every call into an embedding provider, vector store, reranker or language
//! model goes through a [`ProviderGate`], which applies:
//! - a bounded-concurrency semaphore shared by all queries
//! - a per-stage timeout covering the permit wait and all retries
//! - bounded exponential backoff for transient failures
//! - cancellation through the query's [`CancellationToken`]

use crate::config::ResilienceConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded exponential backoff settings
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
        }
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Concurrency, timeout, retry and cancellation wrapper for one provider
#[derive(Clone)]
pub struct ProviderGate {
    provider: &'static str,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl ProviderGate {
    pub fn new(provider: &'static str, concurrency: usize, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            provider,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
            policy,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` under the gate
    ///
    /// Transient errors (see [`AppError::is_transient`]) are retried until
    /// the retry budget is spent; anything else returns immediately.
    /// Exceeding the stage timeout yields `RetrievalTimeout`, and a
    /// cancelled token yields `Cancelled`.
    pub async fn call<T, F, Fut>(&self, stage: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        check_cancelled(cancel, stage)?;
        let started = Instant::now();

        let work = async {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| AppError::ServiceUnavailable {
                    message: format!("{} gate closed", self.provider),
                })?;

            let attempts = AtomicU32::new(0);
            let max_retries = self.policy.max_retries;
            let backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(self.policy.initial_backoff)
                .with_max_interval(self.policy.max_backoff.max(self.policy.initial_backoff))
                .with_max_elapsed_time(None)
                .build();

            backoff::future::retry(backoff, || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                let fut = op();
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(e) if e.is_transient() && attempt < max_retries => {
                            warn!(
                                provider = self.provider,
                                stage = stage,
                                attempt = attempt + 1,
                                max_retries = max_retries,
                                error = %e,
                                "Transient provider failure, retrying"
                            );
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            })
            .await
        };

        let guarded = async {
            match tokio::time::timeout(self.timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(AppError::RetrievalTimeout {
                    stage: stage.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled { stage: stage.to_string() }),
            result = guarded => result,
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(AppError::RetrievalTimeout { .. }) => "timeout",
            Err(AppError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };
        metrics::record_provider_call(self.provider, stage, outcome, started.elapsed().as_secs_f64());
        debug!(provider = self.provider, stage = stage, outcome = outcome, "Provider call finished");

        result
    }
}

/// One gate per external provider
#[derive(Clone)]
pub struct ProviderGates {
    pub embedding: ProviderGate,
    pub vector_store: ProviderGate,
    pub reranker: ProviderGate,
    pub llm: ProviderGate,
}

impl ProviderGates {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        let policy = RetryPolicy::from(config);
        let permits = config.provider_concurrency;
        Self {
            embedding: ProviderGate::new(
                "embedding",
                permits,
                Duration::from_millis(config.embed_timeout_ms),
                policy,
            ),
            vector_store: ProviderGate::new(
                "vector_store",
                permits,
                Duration::from_millis(config.vector_store_timeout_ms),
                policy,
            ),
            reranker: ProviderGate::new(
                "reranker",
                permits,
                Duration::from_millis(config.rerank_timeout_ms),
                policy,
            ),
            llm: ProviderGate::new(
                "llm",
                permits,
                Duration::from_millis(config.llm_timeout_ms),
                policy,
            ),
        }
    }
}

/// Fail with `Cancelled` if the token has fired
pub fn check_cancelled(cancel: &CancellationToken, stage: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled {
            stage: stage.to_string(),
        });
    }
    Ok(())
}

/// Run `fut` until `deadline`, yielding `None` if the deadline passes first
pub async fn within_deadline<F: Future>(deadline: Option<tokio::time::Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Whether `deadline` has already passed
pub fn deadline_passed(deadline: Option<tokio::time::Instant>) -> bool {
    deadline.is_some_and(|d| tokio::time::Instant::now() >= d)
}
