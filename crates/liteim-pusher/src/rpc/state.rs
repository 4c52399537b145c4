//! Application State
//!
//! Shared state passed to all RPC handlers.

use crate::discovery::PeerSet;
use crate::lifecycle::LifecycleState;
use crate::observability::MetricsState;
use liteim_core::{NodeAddress, ServiceRole};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: NodeAddress,
    pub instance_id: Uuid,
    pub gateway_role: ServiceRole,
    /// Gateways pushes are routed through
    pub gateways: PeerSet,
    pub lifecycle: watch::Receiver<LifecycleState>,
    pub registered: Arc<AtomicBool>,
    pub metrics_state: Option<MetricsState>,
}

/// Readiness breakdown returned by `/ready`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub lifecycle: LifecycleState,
    pub registered: bool,
    pub peers_synced: bool,
}

impl AppState {
    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Ready once running, registered and seeded with a full peer listing
    pub fn readiness(&self) -> Readiness {
        let lifecycle = self.lifecycle_state();
        let registered = self.registered.load(Ordering::SeqCst);
        let peers_synced = self.gateways.is_synced();
        Readiness {
            ready: lifecycle == LifecycleState::Running && registered && peers_synced,
            lifecycle,
            registered,
            peers_synced,
        }
    }
}
