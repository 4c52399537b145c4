//! Observability Module
//!
//! - `tracing`: log subscriber setup with optional OTLP trace export
//! - `metrics`: Prometheus metrics for registration, discovery and pushes
//! - `events`: structured lifecycle and membership events with consistent fields

pub mod events;
pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};
