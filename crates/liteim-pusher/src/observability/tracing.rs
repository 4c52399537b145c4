//! Tracing Setup
//!
//! Console logging (text or JSON) filtered by `RUST_LOG`, defaulting to INFO,
//! plus OTLP span export when a collector endpoint is configured.
//!
//! Environment variables:
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - OTLP endpoint (e.g., `http://tempo.infra.svc.cluster.local:4317`)
//! - `OTEL_SERVICE_NAME` - Service name (default: `liteim-pusher`)
//! - `LOG_FORMAT` - Set to `json` for JSON output (default: `text`)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SERVICE_NAME: &str = "liteim-pusher";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// OTLP endpoint for span export (None = disabled)
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            json: false,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|s| !s.is_empty()),
            service_name: var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            json: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(endpoint) = &config.otlp_endpoint else {
        if config.json {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().json())
                .try_init()?;
        } else {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer())
                .try_init()?;
        }
        tracing::debug!("Tracing initialized (no OTLP export)");
        return Ok(());
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    let _ = TRACER_PROVIDER.set(provider);
    let otel_layer = OpenTelemetryLayer::new(tracer);

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(otel_layer)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(otel_layer)
            .with(fmt::layer())
            .try_init()?;
    }

    tracing::info!(
        endpoint = %endpoint,
        service_name = %config.service_name,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Flush pending spans. Safe to call when export was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Error shutting down tracer provider");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_defaults() {
        let config = TracingConfig::from_vars(|_| None);
        assert_eq!(config, TracingConfig::default());
        assert_eq!(config.service_name, "liteim-pusher");
        assert!(!config.json);
    }

    #[test]
    fn test_tracing_config_from_vars() {
        let config = TracingConfig::from_vars(|key| match key {
            "OTEL_EXPORTER_OTLP_ENDPOINT" => Some("http://tempo:4317".to_string()),
            "LOG_FORMAT" => Some("JSON".to_string()),
            _ => None,
        });
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://tempo:4317"));
        assert!(config.json);
    }
}
