//! RPC Service
//!
//! HTTP/JSON surface of the pusher node, served with axum:
//! - `POST /push`: accept a push and pick the gateway it is routed through
//! - `GET /health`, `GET /ready`: Kubernetes probes
//! - `GET /peers`: the current gateway view
//! - `GET /metrics`: Prometheus metrics
//! - `GET /version`: build information
//!
//! `start()` binds the listener, failing the process if the port is taken.
//! `exit()` stops accepting connections and lets in-flight requests drain
//! for at most `rpc_drain_timeout` before the serve task is aborted.

mod health;
mod metrics;
mod peers;
mod push;
mod state;

pub use push::{PushAck, PushError, PushRequest};
pub use state::{AppState, Readiness};

use crate::config::PusherConfig;
use crate::lifecycle::Component;
use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to bind RPC listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("RPC service already started")]
    AlreadyStarted,
    #[error("in-flight requests did not drain within {0:?}")]
    DrainTimeout(Duration),
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Push delivery
        .route("/push", post(push::push))
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Observability
        .route("/peers", get(peers::get_peers))
        .route("/metrics", get(metrics::get_metrics))
        .route("/version", get(peers::get_version))
        .with_state(state)
}

/// The node's RPC server
pub struct RpcService {
    bind_addr: SocketAddr,
    state: AppState,
    drain_timeout: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    exited: AtomicBool,
}

impl RpcService {
    /// Serve on all interfaces at the configured RPC port
    pub fn new(config: &PusherConfig, state: AppState) -> Self {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.rpc_port));
        Self::with_bind_addr(bind_addr, config.rpc_drain_timeout, state)
    }

    pub fn with_bind_addr(
        bind_addr: SocketAddr,
        drain_timeout: Duration,
        state: AppState,
    ) -> Self {
        Self {
            bind_addr,
            state,
            drain_timeout,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the listener and spawn the serve loop.
    pub async fn start(&self) -> Result<SocketAddr, RpcError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| RpcError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RpcError::Bind {
            addr: self.bind_addr,
            source,
        })?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        let router = create_router(self.state.clone());
        let shutdown = self.cancel.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await;
            match served {
                Ok(()) => debug!("RPC serve loop finished"),
                Err(e) => error!(error = %e, "RPC server failed"),
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(addr = %local_addr, "RPC service listening");
        Ok(local_addr)
    }

    /// Stop accepting, drain in-flight requests, release the listener.
    pub async fn exit(&self) -> Result<(), RpcError> {
        if self.exited.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut task) = task else {
            return Ok(());
        };

        if tokio::time::timeout(self.drain_timeout, &mut task).await.is_err() {
            warn!(timeout = ?self.drain_timeout, "RPC drain timed out, aborting serve loop");
            task.abort();
            return Err(RpcError::DrainTimeout(self.drain_timeout));
        }
        info!("RPC service stopped");
        Ok(())
    }
}

#[async_trait]
impl Component for RpcService {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn exit_timeout(&self) -> Duration {
        self.drain_timeout
    }

    async fn exit(&self) -> anyhow::Result<()> {
        RpcService::exit(self).await.map_err(Into::into)
    }
}
