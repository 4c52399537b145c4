//! Peer and build information endpoints

use super::state::AppState;
use crate::version;
use axum::{extract::State, response::Json};
use liteim_core::NodeAddress;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub node: NodeAddress,
    pub instance_id: Uuid,
    pub role: String,
    pub synced: bool,
    pub peers: Vec<NodeAddress>,
}

/// GET /peers - current view of the gateway tier
pub async fn get_peers(State(state): State<AppState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        node: state.node,
        instance_id: state.instance_id,
        role: state.gateway_role.to_string(),
        synced: state.gateways.is_synced(),
        peers: state.gateways.snapshot(),
    })
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub git_branch: &'static str,
    pub rustc: &'static str,
    pub built: &'static str,
}

/// GET /version
pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: version::VERSION,
        git_sha: version::GIT_SHA,
        git_branch: version::GIT_BRANCH,
        rustc: version::RUSTC_VERSION,
        built: version::BUILD_TIMESTAMP,
    })
}
