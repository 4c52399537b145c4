//! Lifecycle Controller
//!
//! `Pusher` owns the three components of a node and the order they start
//! and stop in:
//!
//! ```text
//! Initializing ──start()──> Running ──signal──> ShuttingDown ──> Stopped
//! ```
//!
//! Startup resolves the node identity, then launches registration,
//! discovery and the RPC service concurrently. Any of them failing aborts
//! startup and tears down whatever already started.
//!
//! Shutdown runs once, in a fixed order: registration (peers stop routing
//! here), discovery, then the RPC service (accepted requests drain last).
//! Each exit is bounded; failures are reported, never escalated.

use crate::config::PusherConfig;
use crate::discovery::{DiscoveryClient, DiscoveryError, PeerSet};
use crate::identity::{IdentityError, IdentityResolver, InterfaceSource};
use crate::observability::{events, metrics, MetricsState};
use crate::registration::{RegistrationClient, RegistrationError};
use crate::registry::Registry;
use crate::rpc::{AppState, RpcError, RpcService};
use crate::version;
use async_trait::async_trait;
use liteim_core::{NodeAddress, RegistrationRecord};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Added on top of a component's own exit bound before it is abandoned
const EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A long-running part of the node that can be stopped
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound on how long `exit` may take
    fn exit_timeout(&self) -> Duration;

    /// Stop the component. Must be idempotent.
    async fn exit(&self) -> anyhow::Result<()>;
}

/// Fatal-at-start conditions
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("identity resolution failed: {0}")]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("node cannot start from state {0}")]
    InvalidState(LifecycleState),
}

/// Outcome of one component's exit
#[derive(Debug, Clone)]
pub struct ComponentExit {
    pub component: &'static str,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Outcome of the ordered shutdown, in exit order
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub exits: Vec<ComponentExit>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.exits.iter().all(|exit| exit.error.is_none())
    }

    pub fn order(&self) -> Vec<&'static str> {
        self.exits.iter().map(|exit| exit.component).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ComponentExit> {
        self.exits.iter().filter(|exit| exit.error.is_some())
    }
}

/// A pusher node
pub struct Pusher {
    address: NodeAddress,
    registration: Arc<RegistrationClient>,
    discovery: Arc<DiscoveryClient>,
    rpc: Arc<RpcService>,
    state: watch::Sender<LifecycleState>,
    shutdown_started: AtomicBool,
}

impl Pusher {
    /// Resolve identity and construct every component. Nothing runs yet.
    pub fn build(
        config: &PusherConfig,
        registry: Arc<dyn Registry>,
        interfaces: &dyn InterfaceSource,
        metrics_state: Option<MetricsState>,
    ) -> Result<Self, StartupError> {
        let address = IdentityResolver::new(interfaces)
            .with_advertise_ip(config.advertise_ip)
            .with_stable_order(config.stable_identity)
            .resolve(config.rpc_port)?;

        let record = RegistrationRecord::new(
            config.push_service_name.clone(),
            address,
            version::full_version(),
        );
        let instance_id = record.instance_id;

        let registration = Arc::new(RegistrationClient::new(registry.clone(), record, config));
        let discovery = Arc::new(DiscoveryClient::new(
            registry,
            config.gateway_service_name.clone(),
            PeerSet::new(),
            config,
        ));

        let (state, lifecycle) = watch::channel(LifecycleState::Initializing);
        let app_state = AppState {
            node: address,
            instance_id,
            gateway_role: config.gateway_service_name.clone(),
            gateways: discovery.peers(),
            lifecycle,
            registered: registration.registered_flag(),
            metrics_state,
        };
        let rpc = Arc::new(RpcService::new(config, app_state));

        Ok(Self {
            address,
            registration,
            discovery,
            rpc,
            state,
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// The advertised address of this node
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Gateways known to this node
    pub fn gateways(&self) -> PeerSet {
        self.discovery.peers()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    /// Address the RPC listener is bound to, once started
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc.local_addr()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            events::lifecycle_transition(&previous.to_string(), &next.to_string());
        }
    }

    /// Launch all three components concurrently.
    pub async fn start(&self) -> Result<(), StartupError> {
        let current = self.state();
        if current != LifecycleState::Initializing {
            return Err(StartupError::InvalidState(current));
        }

        info!(address = %self.address, "Starting pusher node");

        let launched = tokio::try_join!(
            async { self.registration.start().await.map_err(StartupError::from) },
            async { self.discovery.watch().await.map_err(StartupError::from) },
            async { self.rpc.start().await.map_err(StartupError::from) },
        );

        if let Err(e) = launched {
            warn!(error = %e, "Startup failed, stopping components that already started");
            let report = self.shutdown().await;
            if !report.is_clean() {
                warn!(
                    failures = report.failures().count(),
                    "Cleanup after failed startup was incomplete"
                );
            }
            return Err(e);
        }

        self.transition(LifecycleState::Running);
        Ok(())
    }

    /// Run the ordered shutdown. Only the first call does anything.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress");
            return ShutdownReport::default();
        }

        self.transition(LifecycleState::ShuttingDown);

        let components: [&dyn Component; 3] = [
            self.registration.as_ref(),
            self.discovery.as_ref(),
            self.rpc.as_ref(),
        ];
        let report = shutdown_in_order(&components).await;

        self.transition(LifecycleState::Stopped);
        report
    }

    /// Start, wait for `stop` to resolve, then shut down.
    pub async fn run_until(
        &self,
        stop: impl Future<Output = ()>,
    ) -> Result<ShutdownReport, StartupError> {
        self.start().await?;
        stop.await;
        Ok(self.shutdown().await)
    }

    /// Start, wait for SIGINT or SIGTERM, then shut down.
    ///
    /// Handlers are installed before startup, a signal that arrives while
    /// the components start is acted on once `start` returns.
    pub async fn run(&self) -> Result<ShutdownReport, StartupError> {
        let signals = ShutdownSignal::install();
        self.run_until(async move {
            match signals {
                Ok(mut signals) => {
                    let signal = signals.recv().await;
                    info!(signal = signal, "Received termination signal");
                }
                Err(e) => warn!(error = %e, "Signal handling unavailable, shutting down"),
            }
        })
        .await
    }
}

/// Exit each component in order. The next exit is not issued before the
/// previous one returns or times out.
pub async fn shutdown_in_order(components: &[&dyn Component]) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for component in components {
        let name = component.name();
        let bound = component.exit_timeout() + EXIT_GRACE;
        let started = Instant::now();

        let error = match tokio::time::timeout(bound, component.exit()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!("timed out after {bound:?}")),
        };

        let elapsed = started.elapsed();
        metrics::record_component_exit(name, elapsed);
        match &error {
            None => events::component_exited(name, elapsed),
            Some(e) => events::component_exit_failed(name, e),
        }
        report.exits.push(ComponentExit {
            component: name,
            elapsed,
            error,
        });
    }

    report
}

/// Termination signal handlers. Signals delivered after `install` are
/// buffered until `recv` is awaited; once installed, the handlers stay in
/// place and later signals have no further effect.
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
}

impl ShutdownSignal {
    /// Install the SIGTERM and SIGINT handlers now.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sigint: signal(SignalKind::interrupt())?,
            })
        }

        #[cfg(windows)]
        {
            Ok(Self {
                ctrl_c: tokio::signal::windows::ctrl_c()?,
            })
        }
    }

    /// Resolve on the first signal, naming it.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => "SIGTERM",
                _ = self.sigint.recv() => "SIGINT",
            }
        }

        #[cfg(windows)]
        {
            self.ctrl_c.recv().await;
            "ctrl-c"
        }
    }
}
