//! Metrics and observability utilities
//!
//! Prometheus metrics via the `metrics` facade with a shared prefix.
//! The exporter itself is installed by the server binary.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Lodestar metrics
pub const METRICS_PREFIX: &str = "lodestar";

/// Histogram buckets for end-to-end query latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00, 30.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total answered queries by terminal step"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end query latency in seconds"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Pipeline stage latency in seconds"
    );

    describe_counter!(
        format!("{}_stage_degraded_total", METRICS_PREFIX),
        Unit::Count,
        "Pipeline stages skipped or degraded"
    );

    describe_gauge!(
        format!("{}_evidence_count", METRICS_PREFIX),
        Unit::Count,
        "Evidence units extracted for the last query"
    );

    describe_counter!(
        format!("{}_provider_calls_total", METRICS_PREFIX),
        Unit::Count,
        "External provider calls by outcome"
    );

    describe_histogram!(
        format!("{}_provider_call_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "External provider call latency in seconds"
    );

    describe_counter!(
        format!("{}_chunks_indexed_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks accepted into the index"
    );

    describe_counter!(
        format!("{}_chunks_rejected_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks dropped by the quality threshold"
    );

    describe_gauge!(
        format!("{}_index_version", METRICS_PREFIX),
        Unit::Count,
        "Version of the live index snapshot"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a finished query
pub fn record_query(duration_secs: f64, terminal: &str, evidence_count: usize) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "terminal" => terminal.to_string()
    )
    .increment(1);

    histogram!(format!("{}_query_duration_seconds", METRICS_PREFIX)).record(duration_secs);

    gauge!(format!("{}_evidence_count", METRICS_PREFIX)).set(evidence_count as f64);
}

/// Record one pipeline stage
pub fn record_stage(stage: &str, duration_secs: f64) {
    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

/// Record a skipped or degraded stage
pub fn record_degradation(stage: &str, reason: &str) {
    counter!(
        format!("{}_stage_degraded_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an external provider call
pub fn record_provider_call(provider: &str, stage: &str, outcome: &str, duration_secs: f64) {
    counter!(
        format!("{}_provider_calls_total", METRICS_PREFIX),
        "provider" => provider.to_string(),
        "stage" => stage.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_provider_call_duration_seconds", METRICS_PREFIX),
        "provider" => provider.to_string()
    )
    .record(duration_secs);
}

/// Record an index build
pub fn record_indexing(accepted: usize, rejected: usize, version: u64) {
    counter!(format!("{}_chunks_indexed_total", METRICS_PREFIX)).increment(accepted as u64);
    counter!(format!("{}_chunks_rejected_total", METRICS_PREFIX)).increment(rejected as u64);
    gauge!(format!("{}_index_version", METRICS_PREFIX)).set(version as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls are no-ops
        let metrics = RequestMetrics::start("POST", "/v1/answer");
        metrics.finish(200);
        record_query(0.01, "conclusion", 5);
        record_stage("hybrid", 0.002);
        record_degradation("rerank", "unavailable");
        record_provider_call("embedding", "embed_query", "success", 0.001);
        record_indexing(10, 2, 1);
    }
}
