//! Tracing and OpenTelemetry setup for worker processes
//!
//! Every worker initializes structured logging via `tracing`; when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is configured, spans are additionally
//! exported over OTLP so a scan can be followed across the orchestrator,
//! the file workers and the LLM worker.

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use opentelemetry_semantic_conventions as semconv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Configuration
// ============================================================================

/// Telemetry configuration for one worker process.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Worker name, e.g. "document-worker".
    pub service_name: String,
    pub service_version: String,
    /// OTLP endpoint; None disables span export and keeps stdout logging only.
    pub otlp_endpoint: Option<String>,
    /// Sampling rate (0.0 to 1.0).
    pub sampling_rate: f64,
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn for_worker(service_name: &str, otlp_endpoint: Option<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint,
            sampling_rate: 1.0,
            log_level: "info".to_string(),
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize logging and, if configured, OTLP trace export.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.otlp_endpoint.clone() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true),
            )
            .init();
        return Ok(());
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_rate))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(build_resource(&config)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("Failed to install OTLP tracer")?;

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        endpoint = %endpoint,
        "Telemetry initialized"
    );

    Ok(())
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    Resource::new(vec![
        KeyValue::new(semconv::resource::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(
            semconv::resource::SERVICE_VERSION,
            config.service_version.clone(),
        ),
    ])
}

/// Flush and shut down the OTLP exporter.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_defaults() {
        let config = TelemetryConfig::for_worker("document-worker", None);
        assert_eq!(config.service_name, "document-worker");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_rate, 1.0);
    }
}
