//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for query orchestration with
//! standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics prefix for all HAL metrics
pub const METRICS_PREFIX: &str = "hal";

/// Histogram buckets for time-to-first-fragment (in seconds)
pub const TTFB_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
];

/// Buckets for whole-query latency (generation dominates)
pub const QUERY_BUCKETS: &[f64] = &[
    0.250, 0.500, 1.000, 2.000, 5.000, 10.00, 20.00, 30.00, 60.00,
];

/// Install the Prometheus exporter and register descriptions
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(format!("{}_ttfb_seconds", METRICS_PREFIX)),
            TTFB_BUCKETS,
        )?
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(format!(
                "{}_query_duration_seconds",
                METRICS_PREFIX
            )),
            QUERY_BUCKETS,
        )?
        .install()?;

    register_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Queries retired, labelled by outcome"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Total generation duration per query"
    );

    describe_histogram!(
        format!("{}_ttfb_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time to first answer fragment"
    );

    describe_counter!(
        format!("{}_fragments_total", METRICS_PREFIX),
        Unit::Count,
        "Answer fragments relayed to clients"
    );

    describe_histogram!(
        format!("{}_provider_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Context provider latency"
    );

    describe_counter!(
        format!("{}_provider_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Context provider failures and timeouts"
    );

    describe_counter!(
        format!("{}_busy_rejections_total", METRICS_PREFIX),
        Unit::Count,
        "Queries rejected because one was already in flight"
    );

    describe_counter!(
        format!("{}_logins_total", METRICS_PREFIX),
        Unit::Count,
        "Login attempts, labelled by outcome"
    );

    describe_gauge!(
        format!("{}_active_sessions", METRICS_PREFIX),
        Unit::Count,
        "Sessions currently held by the session store"
    );

    describe_gauge!(
        format!("{}_open_spans", METRICS_PREFIX),
        Unit::Count,
        "Trace spans currently open in the correlator"
    );

    tracing::info!("Metrics registered");
}

/// Record a retired query
pub fn record_query(outcome: &str, generation_secs: f64, ttfb_secs: Option<f64>, fragments: u64) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(format!("{}_query_duration_seconds", METRICS_PREFIX)).record(generation_secs);

    if let Some(ttfb) = ttfb_secs {
        histogram!(format!("{}_ttfb_seconds", METRICS_PREFIX)).record(ttfb);
    }

    counter!(format!("{}_fragments_total", METRICS_PREFIX)).increment(fragments);
}

/// Record a context provider call
pub fn record_provider(provider: &str, duration_secs: f64, failure: Option<&str>) {
    histogram!(
        format!("{}_provider_duration_seconds", METRICS_PREFIX),
        "provider" => provider.to_string()
    )
    .record(duration_secs);

    if let Some(kind) = failure {
        counter!(
            format!("{}_provider_failures_total", METRICS_PREFIX),
            "provider" => provider.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }
}

pub fn record_busy_rejection() {
    counter!(format!("{}_busy_rejections_total", METRICS_PREFIX)).increment(1);
}

pub fn record_login(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        format!("{}_logins_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(format!("{}_active_sessions", METRICS_PREFIX)).set(count as f64);
}

pub fn set_open_spans(count: usize) {
    gauge!(format!("{}_open_spans", METRICS_PREFIX)).set(count as f64);
}
