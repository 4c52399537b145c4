//! Push Endpoint
//!
//! Accepts a push for a recipient and picks the gateway it will be routed
//! through. The gateway is chosen by rendezvous hashing on the recipient, so
//! pushes for one recipient go through one gateway while membership is
//! stable. Forwarding the payload is not done here.
//!
//! Pushes are accepted for as long as the listener is open, including while
//! the node deregisters during shutdown. Only `/ready` reports the drain.

use super::state::AppState;
use crate::observability::metrics;
use axum::{extract::State, http::StatusCode, response::Json};
use liteim_core::NodeAddress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushRequest {
    pub recipient: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PushAck {
    pub accepted: bool,
    pub gateway: NodeAddress,
    pub pusher: NodeAddress,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PushError {
    pub accepted: bool,
    pub error: String,
}

fn rejected(
    status: StatusCode,
    outcome: &'static str,
    error: impl Into<String>,
) -> (StatusCode, Json<PushError>) {
    metrics::record_push(outcome);
    (
        status,
        Json(PushError {
            accepted: false,
            error: error.into(),
        }),
    )
}

/// POST /push
#[tracing::instrument(skip_all)]
pub async fn push(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushAck>, (StatusCode, Json<PushError>)> {
    if request.recipient.trim().is_empty() {
        return Err(rejected(
            StatusCode::BAD_REQUEST,
            "invalid",
            "recipient must not be empty",
        ));
    }

    let Some(gateway) = state.gateways.pick(&request.recipient) else {
        tracing::warn!("No gateway known, rejecting push");
        return Err(rejected(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_gateway",
            "no gateway available",
        ));
    };

    tracing::debug!(recipient = %request.recipient, gateway = %gateway, "Push accepted");
    metrics::record_push("accepted");
    Ok(Json(PushAck {
        accepted: true,
        gateway,
        pusher: state.node,
    }))
}
