//! Peer Discovery
//!
//! Keeps a `PeerSet` of the watched role (the gateways) eventually
//! consistent with the registry. A single loop owns all writes:
//!
//! ```text
//! Listing ──> Watching ──(watch dropped)──> Resyncing ──> Listing ...
//! ```
//!
//! Every (re)connect starts with a full listing applied as one
//! `FullResync`, then watches from the listing's revision + 1 so no change
//! between the two is lost. Events missed while the watch was down are
//! covered by the next listing. Failures are retried with exponential
//! backoff and never end the loop; only `exit()` does.

mod peer_set;
mod rendezvous;

pub use peer_set::PeerSet;

use crate::config::PusherConfig;
use crate::lifecycle::Component;
use crate::observability::{events, metrics};
use crate::registry::{Registry, RegistryError};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use liteim_core::{MembershipEvent, ServiceRole};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery client already started")]
    AlreadyStarted,
    #[error("discovery loop did not stop within {0:?}")]
    Timeout(Duration),
}

/// Discovery loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started yet
    Idle,
    /// Taking the initial full listing
    Listing,
    /// Steady-state: applying incremental events
    Watching,
    /// Watch dropped, waiting to take a fresh listing
    Resyncing,
    /// Loop exited
    Stopped,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoveryState::Idle => "idle",
            DiscoveryState::Listing => "listing",
            DiscoveryState::Watching => "watching",
            DiscoveryState::Resyncing => "resyncing",
            DiscoveryState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Watches one role and maintains its `PeerSet`
pub struct DiscoveryClient {
    registry: Arc<dyn Registry>,
    role: ServiceRole,
    peers: PeerSet,
    backoff: ExponentialBackoff,
    exit_timeout: Duration,
    state: Arc<watch::Sender<DiscoveryState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    exited: AtomicBool,
}

impl DiscoveryClient {
    pub fn new(
        registry: Arc<dyn Registry>,
        role: ServiceRole,
        peers: PeerSet,
        config: &PusherConfig,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        Self {
            registry,
            role,
            peers,
            backoff: config.retry_backoff(None),
            exit_timeout: config.exit_timeout,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> &ServiceRole {
        &self.role
    }

    /// Handle to the maintained peer set
    pub fn peers(&self) -> PeerSet {
        self.peers.clone()
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Spawn the discovery loop.
    ///
    /// Connectivity problems are handled inside the loop, the only error is
    /// starting twice.
    pub async fn watch(&self) -> Result<(), DiscoveryError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let discovery_loop = DiscoveryLoop {
            registry: self.registry.clone(),
            role: self.role.clone(),
            peers: self.peers.clone(),
            backoff: self.backoff.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(discovery_loop.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Cancel the watch and wait for the loop to stop.
    pub async fn exit(&self) -> Result<(), DiscoveryError> {
        if self.exited.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut task) = task else {
            self.state.send_replace(DiscoveryState::Stopped);
            return Ok(());
        };

        if tokio::time::timeout(self.exit_timeout, &mut task).await.is_err() {
            task.abort();
            self.state.send_replace(DiscoveryState::Stopped);
            return Err(DiscoveryError::Timeout(self.exit_timeout));
        }
        Ok(())
    }
}

#[async_trait]
impl Component for DiscoveryClient {
    fn name(&self) -> &'static str {
        "discovery"
    }

    fn exit_timeout(&self) -> Duration {
        self.exit_timeout
    }

    async fn exit(&self) -> anyhow::Result<()> {
        DiscoveryClient::exit(self).await.map_err(Into::into)
    }
}

/// The state owned by the spawned loop
struct DiscoveryLoop {
    registry: Arc<dyn Registry>,
    role: ServiceRole,
    peers: PeerSet,
    backoff: ExponentialBackoff,
    state: Arc<watch::Sender<DiscoveryState>>,
    cancel: CancellationToken,
}

impl DiscoveryLoop {
    fn set_state(&self, next: DiscoveryState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(role = %self.role, from = %previous, to = %next, "Discovery state changed");
        }
    }

    /// Sleep for the next backoff interval. Returns false when cancelled.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(mut self) {
        info!(role = %self.role, "Discovery loop started");
        self.backoff.reset();
        let mut first_listing = true;

        'outer: loop {
            self.set_state(if first_listing {
                DiscoveryState::Listing
            } else {
                DiscoveryState::Resyncing
            });

            let listing = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                result = self.registry.list(&self.role) => result,
            };
            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "Peer listing failed, retrying");
                    if !self.wait_backoff().await {
                        break 'outer;
                    }
                    continue;
                }
            };

            let previous_count = self.peers.len();
            let revision = listing.revision;
            self.peers
                .apply(&MembershipEvent::FullResync(listing.members));
            metrics::set_gateway_peers(self.peers.len());
            if !first_listing {
                metrics::record_resync();
            }
            events::peers_resynced(&self.role, previous_count, self.peers.len(), revision);
            first_listing = false;

            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                result = self.registry.watch(&self.role, revision + 1) => result,
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "Watch failed to open, retrying");
                    if !self.wait_backoff().await {
                        break 'outer;
                    }
                    continue;
                }
            };

            self.set_state(DiscoveryState::Watching);
            self.backoff.reset();

            let dropped: Option<RegistryError> = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    item = stream.next() => match item {
                        Some(Ok(event)) => self.apply(&event),
                        Some(Err(e)) => break Some(e),
                        None => break None,
                    }
                }
            };

            match dropped {
                Some(e) => warn!(role = %self.role, error = %e, "Watch dropped, resynchronizing"),
                None => warn!(role = %self.role, "Watch stream ended, resynchronizing"),
            }
            self.set_state(DiscoveryState::Resyncing);
            if !self.wait_backoff().await {
                break 'outer;
            }
        }

        self.set_state(DiscoveryState::Stopped);
        debug!(role = %self.role, "Discovery loop stopped");
    }

    fn apply(&self, event: &MembershipEvent) {
        if !self.peers.apply(event) {
            trace!(role = %self.role, event = ?event, "Membership event was a no-op");
            return;
        }

        let count = self.peers.len();
        metrics::set_gateway_peers(count);
        match event {
            MembershipEvent::Added(address) => {
                metrics::record_membership_event("added");
                events::peer_joined(&self.role, address, count);
            }
            MembershipEvent::Removed(address) => {
                metrics::record_membership_event("removed");
                events::peer_departed(&self.role, address, count);
            }
            MembershipEvent::FullResync(_) => {
                metrics::record_membership_event("resync");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use liteim_core::NodeAddress;

    fn gateways() -> ServiceRole {
        ServiceRole::new("gateway-service").unwrap()
    }

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn config() -> PusherConfig {
        PusherConfig {
            retry_backoff_initial: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(500),
            exit_timeout: Duration::from_secs(1),
            ..PusherConfig::default()
        }
    }

    fn client(registry: &InMemoryRegistry) -> DiscoveryClient {
        DiscoveryClient::new(
            Arc::new(registry.clone()),
            gateways(),
            PeerSet::new(),
            &config(),
        )
    }

    /// Poll until `cond` holds, bounded by virtual time
    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeds_from_listing_then_applies_events() {
        let registry = InMemoryRegistry::new();
        registry.put_member(&gateways(), addr("10.0.1.1:8000"));
        registry.put_member(&gateways(), addr("10.0.1.2:8000"));

        let client = client(&registry);
        let peers = client.peers();
        client.watch().await.unwrap();

        eventually(|| client.state() == DiscoveryState::Watching).await;
        assert!(peers.is_synced());
        assert_eq!(
            peers.snapshot(),
            vec![addr("10.0.1.1:8000"), addr("10.0.1.2:8000")]
        );

        registry.put_member(&gateways(), addr("10.0.1.3:8000"));
        registry.delete_member(&gateways(), &addr("10.0.1.1:8000"));
        // Duplicate add of a present member
        registry.put_member(&gateways(), addr("10.0.1.2:8000"));

        eventually(|| peers.contains(&addr("10.0.1.3:8000"))).await;
        eventually(|| !peers.contains(&addr("10.0.1.1:8000"))).await;
        assert_eq!(
            peers.snapshot(),
            vec![addr("10.0.1.2:8000"), addr("10.0.1.3:8000")]
        );

        client.exit().await.unwrap();
        assert_eq!(client.state(), DiscoveryState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_roles() {
        let registry = InMemoryRegistry::new();
        let client = client(&registry);
        let peers = client.peers();
        client.watch().await.unwrap();
        eventually(|| client.state() == DiscoveryState::Watching).await;

        let pushers = ServiceRole::new("push-service").unwrap();
        registry.put_member(&pushers, addr("10.0.0.5:9000"));
        registry.put_member(&gateways(), addr("10.0.1.1:8000"));

        eventually(|| peers.len() == 1).await;
        assert!(!peers.contains(&addr("10.0.0.5:9000")));
        client.exit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_after_dropped_watch() {
        let registry = InMemoryRegistry::new();
        registry.put_member(&gateways(), addr("10.0.1.1:8000"));
        registry.put_member(&gateways(), addr("10.0.1.2:8000"));

        let client = client(&registry);
        let peers = client.peers();
        client.watch().await.unwrap();
        eventually(|| client.state() == DiscoveryState::Watching).await;

        // Drop the watch and change membership while it is down
        registry.set_available(false);
        registry.delete_member(&gateways(), &addr("10.0.1.1:8000"));
        registry.put_member(&gateways(), addr("10.0.1.7:8000"));
        eventually(|| client.state() == DiscoveryState::Resyncing).await;

        // Stale view while partitioned
        assert!(peers.contains(&addr("10.0.1.1:8000")));

        tokio::time::sleep(Duration::from_secs(2)).await;
        registry.set_available(true);

        eventually(|| client.state() == DiscoveryState::Watching).await;
        assert_eq!(peers.snapshot(), registry.members(&gateways()));
        assert_eq!(
            peers.snapshot(),
            vec![addr("10.0.1.2:8000"), addr("10.0.1.7:8000")]
        );

        // Incremental updates resume after the resync
        registry.put_member(&gateways(), addr("10.0.1.8:8000"));
        eventually(|| peers.contains(&addr("10.0.1.8:8000"))).await;

        client.exit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_partition_resyncs() {
        let registry = InMemoryRegistry::new();
        let client = client(&registry);
        let peers = client.peers();
        let mut states = client.subscribe_state();
        client.watch().await.unwrap();
        eventually(|| client.state() == DiscoveryState::Watching).await;
        let _ = states.borrow_and_update();

        registry.disconnect_watchers();
        registry.put_member(&gateways(), addr("10.0.1.4:8000"));

        eventually(|| peers.contains(&addr("10.0.1.4:8000"))).await;
        eventually(|| client.state() == DiscoveryState::Watching).await;
        assert!(states.has_changed().unwrap());

        client.exit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_is_idempotent_and_safe_before_start() {
        let registry = InMemoryRegistry::new();
        let client = client(&registry);

        client.exit().await.unwrap();
        client.exit().await.unwrap();
        assert_eq!(client.state(), DiscoveryState::Stopped);

        let started = DiscoveryClient::new(
            Arc::new(registry.clone()),
            gateways(),
            PeerSet::new(),
            &config(),
        );
        started.watch().await.unwrap();
        assert!(matches!(
            started.watch().await,
            Err(DiscoveryError::AlreadyStarted)
        ));
        started.exit().await.unwrap();
        started.exit().await.unwrap();
    }
}
