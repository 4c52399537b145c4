//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `liteim_pusher_registered` - 1 while this node holds a live registration
//! - `liteim_pusher_registration_renewals_total` - keep-alive rounds by result
//! - `liteim_pusher_registration_restored_total` - re-publishes after a lost lease
//! - `liteim_pusher_gateway_peers` - gauge of known gateway peers
//! - `liteim_pusher_membership_events_total` - applied discovery events by kind
//! - `liteim_pusher_discovery_resyncs_total` - full listings taken after the first
//! - `liteim_pusher_push_requests_total` - push requests by outcome
//! - `liteim_pusher_component_exit_duration_seconds` - shutdown time per component

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Handle used to render the `/metrics` endpoint
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

impl MetricsState {
    /// A handle backed by a recorder that is not installed globally.
    /// Renders an empty page; used when the global recorder is taken.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            prometheus_handle: recorder.handle(),
        }
    }

    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Install the global Prometheus recorder and describe every metric.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    // Registration
    describe_gauge!(
        "liteim_pusher_registered",
        "Whether this node currently holds a live registration"
    );
    describe_counter!(
        "liteim_pusher_registration_renewals_total",
        "Lease keep-alive rounds by result"
    );
    describe_counter!(
        "liteim_pusher_registration_restored_total",
        "Registrations published again after the lease was lost"
    );

    // Discovery
    describe_gauge!("liteim_pusher_gateway_peers", "Number of known gateway peers");
    describe_counter!(
        "liteim_pusher_membership_events_total",
        "Membership events applied to the peer set"
    );
    describe_counter!(
        "liteim_pusher_discovery_resyncs_total",
        "Full listings taken after a dropped watch"
    );

    // RPC and lifecycle
    describe_counter!(
        "liteim_pusher_push_requests_total",
        "Push requests handled by outcome"
    );
    describe_histogram!(
        "liteim_pusher_component_exit_duration_seconds",
        "Time each component took to exit during shutdown"
    );
}

pub fn set_registered(registered: bool) {
    gauge!("liteim_pusher_registered").set(if registered { 1.0 } else { 0.0 });
}

pub fn record_renewal(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("liteim_pusher_registration_renewals_total", "result" => result).increment(1);
}

pub fn record_registration_restored() {
    counter!("liteim_pusher_registration_restored_total").increment(1);
}

pub fn set_gateway_peers(count: usize) {
    gauge!("liteim_pusher_gateway_peers").set(count as f64);
}

pub fn record_membership_event(kind: &'static str) {
    counter!("liteim_pusher_membership_events_total", "kind" => kind).increment(1);
}

pub fn record_resync() {
    counter!("liteim_pusher_discovery_resyncs_total").increment(1);
}

pub fn record_push(outcome: &'static str) {
    counter!("liteim_pusher_push_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_component_exit(component: &'static str, duration: Duration) {
    histogram!(
        "liteim_pusher_component_exit_duration_seconds",
        "component" => component
    )
    .record(duration.as_secs_f64());
}
