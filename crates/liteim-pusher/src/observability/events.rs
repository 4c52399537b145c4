//! Structured Events
//!
//! One function per event type so field names stay consistent across the
//! codebase. Every event carries an `event_type` field.

use liteim_core::{NodeAddress, ServiceRole};
use std::time::Duration;
use tracing::{info, warn};

pub fn node_registered(role: &ServiceRole, address: &NodeAddress, lease_id: i64) {
    info!(
        event_type = "node_registered",
        role = %role,
        address = %address,
        lease_id = lease_id,
        "Node registered"
    );
}

pub fn registration_restored(role: &ServiceRole, address: &NodeAddress, lease_id: i64) {
    warn!(
        event_type = "registration_restored",
        role = %role,
        address = %address,
        lease_id = lease_id,
        "Lease was lost, registration published again"
    );
}

pub fn node_deregistered(role: &ServiceRole, address: &NodeAddress) {
    info!(
        event_type = "node_deregistered",
        role = %role,
        address = %address,
        "Node deregistered"
    );
}

pub fn peer_joined(role: &ServiceRole, address: &NodeAddress, peer_count: usize) {
    info!(
        event_type = "peer_joined",
        role = %role,
        address = %address,
        peer_count = peer_count,
        "Peer joined"
    );
}

pub fn peer_departed(role: &ServiceRole, address: &NodeAddress, peer_count: usize) {
    warn!(
        event_type = "peer_departed",
        role = %role,
        address = %address,
        peer_count = peer_count,
        "Peer departed"
    );
}

pub fn peers_resynced(role: &ServiceRole, previous_count: usize, peer_count: usize, revision: i64) {
    info!(
        event_type = "peers_resynced",
        role = %role,
        previous_count = previous_count,
        peer_count = peer_count,
        revision = revision,
        "Peer set resynchronized from full listing"
    );
}

pub fn lifecycle_transition(from: &str, to: &str) {
    info!(
        event_type = "lifecycle_transition",
        from = %from,
        to = %to,
        "Lifecycle state changed"
    );
}

pub fn component_exited(component: &str, elapsed: Duration) {
    info!(
        event_type = "component_exited",
        component = %component,
        elapsed_ms = elapsed.as_millis() as u64,
        "Component exited"
    );
}

pub fn component_exit_failed(component: &str, error: &str) {
    warn!(
        event_type = "component_exit_failed",
        component = %component,
        error = %error,
        "Component exit failed, continuing shutdown"
    );
}
