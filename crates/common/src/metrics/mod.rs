//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use crate::errors::Stage;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all MedAssist metrics
pub const METRICS_PREFIX: &str = "medassist";

/// Histogram buckets for answer latency (in seconds)
/// Cache hits land in the first buckets; full pipeline runs in the upper ones.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s - P50 target for uncached answers
    5.000,  // 5s - P99 target
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_answers_total", METRICS_PREFIX),
        Unit::Count,
        "Total answer requests by outcome"
    );

    describe_histogram!(
        format!("{}_answer_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end answer latency in seconds"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Pipeline stage latency in seconds"
    );

    describe_counter!(
        format!("{}_stage_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total pipeline stage failures"
    );

    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total answer cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total answer cache misses"
    );

    describe_counter!(
        format!("{}_cache_coalesced_total", METRICS_PREFIX),
        Unit::Count,
        "Requests that joined an in-flight pipeline execution"
    );

    describe_gauge!(
        format!("{}_pipelines_in_flight", METRICS_PREFIX),
        Unit::Count,
        "Pipeline executions currently running"
    );

    describe_counter!(
        format!("{}_emergencies_total", METRICS_PREFIX),
        Unit::Count,
        "Answers flagged as potential emergencies"
    );

    tracing::info!("Metrics registered");
}

/// How a cache lookup was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Coalesced,
}

/// Helper to record cache metrics
pub fn record_cache(lookup: CacheLookup) {
    let name = match lookup {
        CacheLookup::Hit => "cache_hits_total",
        CacheLookup::Miss => "cache_misses_total",
        CacheLookup::Coalesced => "cache_coalesced_total",
    };
    counter!(format!("{}_{}", METRICS_PREFIX, name)).increment(1);
}

/// Helper to record one pipeline stage
pub fn record_stage(stage: Stage, duration_secs: f64, success: bool) {
    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.as_str()
    )
    .record(duration_secs);

    if !success {
        counter!(
            format!("{}_stage_errors_total", METRICS_PREFIX),
            "stage" => stage.as_str()
        )
        .increment(1);
    }
}

/// Helper to record a finished answer request
pub fn record_answer(duration_secs: f64, outcome: &str, emergency: bool) {
    counter!(
        format!("{}_answers_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_answer_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);

    if emergency {
        counter!(format!("{}_emergencies_total", METRICS_PREFIX)).increment(1);
    }
}

/// Helper to publish the number of running pipelines
pub fn set_in_flight(count: usize) {
    gauge!(format!("{}_pipelines_in_flight", METRICS_PREFIX)).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
        assert!(LATENCY_BUCKETS.contains(&2.000));
        assert!(LATENCY_BUCKETS.contains(&5.000));
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every helper must be a no-op
        record_cache(CacheLookup::Hit);
        record_stage(Stage::Search, 0.01, false);
        record_answer(0.02, "ok", true);
        set_in_flight(2);
    }
}
