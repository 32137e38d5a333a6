//! Logging and distributed tracing bootstrap
//!
//! Installs the `tracing` subscriber (JSON or human readable) and, when an
//! OTLP endpoint is configured, a batch span exporter bridged into `tracing`.
//! The W3C trace-context propagator is always installed.

use crate::config::ObservabilityConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator, runtime, trace::TracerProvider, Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the span exporter alive; flushes on drop
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are exported to a collector
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush trace exporter: {e}");
            }
        }
    }
}

/// Initialize logging and tracing for a service
pub fn init(config: &ObservabilityConfig, version: &str) -> anyhow::Result<TelemetryGuard> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let fmt_layer = if config.json_logging {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .json()
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let provider = match config.otel_endpoint.as_deref() {
        Some(endpoint) => Some(build_provider(endpoint, &config.service_name, version)?),
        None => None,
    };

    let otel_layer = provider.as_ref().map(|provider| {
        let tracer = provider.tracer(config.service_name.clone());
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(provider) = provider.as_ref() {
        global::set_tracer_provider(provider.clone());
        tracing::info!(
            endpoint = config.otel_endpoint.as_deref().unwrap_or_default(),
            "OTLP span export enabled"
        );
    }

    Ok(TelemetryGuard { provider })
}

fn build_provider(
    endpoint: &str,
    service_name: &str,
    version: &str,
) -> anyhow::Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", version.to_string()),
    ]);

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}
