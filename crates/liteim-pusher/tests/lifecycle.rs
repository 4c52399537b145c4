//! End-to-end lifecycle tests against the in-memory registry

use async_trait::async_trait;
use liteim_core::{NodeAddress, RegistrationRecord, ServiceRole};
use liteim_pusher::identity::StaticInterfaces;
use liteim_pusher::registry::{
    InMemoryRegistry, Lease, Listing, Registry, RegistryError, RegistryOp, WatchStream,
};
use liteim_pusher::{LifecycleState, Pusher, PusherConfig, RegistryBackend, StartupError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

fn push_role() -> ServiceRole {
    ServiceRole::new("push-service").unwrap()
}

fn gateway_role() -> ServiceRole {
    ServiceRole::new("gateway-service").unwrap()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(rpc_port: u16) -> PusherConfig {
    PusherConfig {
        rpc_port,
        registry_backend: RegistryBackend::Memory,
        lease_ttl: Duration::from_secs(3),
        keepalive_interval: Duration::from_secs(1),
        retry_backoff_initial: Duration::from_millis(50),
        retry_backoff_max: Duration::from_millis(200),
        connect_max_elapsed: Duration::from_millis(500),
        exit_timeout: Duration::from_secs(1),
        rpc_drain_timeout: Duration::from_secs(2),
        ..PusherConfig::default()
    }
}

fn host_a() -> StaticInterfaces {
    StaticInterfaces(vec![
        ("lo".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ("eth0".to_string(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
    ])
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn http_status(port: u16, path: &str) -> Option<u16> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = tokio::net::TcpStream::connect(addr).await.ok()?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.ok()?;
    response.split_whitespace().nth(1)?.parse().ok()
}

async fn http_push(port: u16, recipient: &str) -> Option<u16> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = tokio::net::TcpStream::connect(addr).await.ok()?;
    let body = format!(r#"{{"recipient":"{recipient}","payload":{{}}}}"#);
    let request = format!(
        "POST /push HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.ok()?;
    response.split_whitespace().nth(1)?.parse().ok()
}

/// What the RPC listener answered while registration was being withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeenAtWithdraw {
    push: Option<u16>,
    ready: Option<u16>,
}

/// Registry that queries the node's own RPC service before withdrawing
#[derive(Clone)]
struct WithdrawObserver {
    inner: InMemoryRegistry,
    port: u16,
    seen: Arc<Mutex<Option<SeenAtWithdraw>>>,
}

#[async_trait]
impl Registry for WithdrawObserver {
    async fn publish(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Lease, RegistryError> {
        self.inner.publish(record, ttl).await
    }

    async fn renew(&self, lease: &Lease) -> Result<(), RegistryError> {
        self.inner.renew(lease).await
    }

    async fn withdraw(
        &self,
        role: &ServiceRole,
        address: &NodeAddress,
        lease: Option<&Lease>,
    ) -> Result<(), RegistryError> {
        let seen = SeenAtWithdraw {
            push: http_push(self.port, "alice").await,
            ready: http_status(self.port, "/ready").await,
        };
        *self.seen.lock().unwrap() = Some(seen);
        self.inner.withdraw(role, address, lease).await
    }

    async fn list(&self, role: &ServiceRole) -> Result<Listing, RegistryError> {
        self.inner.list(role).await
    }

    async fn watch(
        &self,
        role: &ServiceRole,
        from_revision: i64,
    ) -> Result<WatchStream, RegistryError> {
        self.inner.watch(role, from_revision).await
    }
}

#[tokio::test]
async fn test_end_to_end_register_then_deregister() {
    let port = free_port();
    let registry = InMemoryRegistry::new();
    let gateway: NodeAddress = "10.0.1.1:8000".parse().unwrap();
    registry.put_member(&gateway_role(), gateway);

    let pusher = Arc::new(
        Pusher::build(&config(port), Arc::new(registry.clone()), &host_a(), None)
            .expect("build pusher"),
    );
    let expected = NodeAddress::new(Ipv4Addr::new(10, 0, 0, 5), port);
    assert_eq!(pusher.address(), expected);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn({
        let pusher = pusher.clone();
        async move {
            pusher
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    eventually("running", || pusher.state() == LifecycleState::Running).await;
    assert_eq!(registry.members(&push_role()), vec![expected]);

    eventually("gateway discovered", || pusher.gateways().contains(&gateway)).await;

    let mut ready = None;
    for _ in 0..100 {
        ready = http_status(port, "/ready").await;
        if ready == Some(200) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ready, Some(200));

    // Termination request
    stop_tx.send(()).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("shutdown is bounded")
        .expect("run task")
        .expect("startup succeeded");

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.order(), vec!["registration", "discovery", "rpc"]);
    assert!(registry.members(&push_role()).is_empty());
    assert_eq!(pusher.state(), LifecycleState::Stopped);
    assert_eq!(http_status(port, "/health").await, None);

    // A second termination request does nothing
    let again = pusher.shutdown().await;
    assert!(again.exits.is_empty());
}

#[tokio::test]
async fn test_rpc_serves_pushes_while_deregistering() {
    let port = free_port();
    let inner = InMemoryRegistry::new();
    let gateway: NodeAddress = "10.0.1.1:8000".parse().unwrap();
    inner.put_member(&gateway_role(), gateway);
    let registry = WithdrawObserver {
        inner: inner.clone(),
        port,
        seen: Arc::new(Mutex::new(None)),
    };

    let mut config = config(port);
    config.exit_timeout = Duration::from_secs(3);
    let pusher = Pusher::build(&config, Arc::new(registry.clone()), &host_a(), None)
        .expect("build pusher");
    pusher.start().await.expect("startup succeeded");
    eventually("gateway discovered", || pusher.gateways().contains(&gateway)).await;
    assert_eq!(http_push(port, "alice").await, Some(200));

    let report = pusher.shutdown().await;
    assert!(report.is_clean(), "{report:?}");

    // Deregistration ran first, with the listener still serving pushes and
    // readiness already withdrawn
    let seen = (*registry.seen.lock().unwrap()).expect("withdraw was called");
    assert_eq!(
        seen,
        SeenAtWithdraw {
            push: Some(200),
            ready: Some(503),
        }
    );
    assert!(matches!(
        inner.journal().last(),
        Some(RegistryOp::Withdraw { .. })
    ));
    assert!(inner.members(&push_role()).is_empty());
    assert_eq!(http_status(port, "/health").await, None);
}

#[tokio::test]
async fn test_no_interface_is_fatal_before_registration() {
    let registry = InMemoryRegistry::new();
    let loopback_only = StaticInterfaces(vec![(
        "lo".to_string(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )]);

    let result = Pusher::build(
        &config(free_port()),
        Arc::new(registry.clone()),
        &loopback_only,
        None,
    );

    assert!(matches!(result, Err(StartupError::Identity(_))));
    assert!(registry.journal().is_empty());
    assert!(registry.members(&push_role()).is_empty());
}

#[tokio::test]
async fn test_bind_failure_aborts_startup_and_withdraws() {
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let registry = InMemoryRegistry::new();

    let pusher = Pusher::build(&config(port), Arc::new(registry.clone()), &host_a(), None)
        .expect("build pusher");
    let result = pusher.start().await;

    assert!(matches!(result, Err(StartupError::Rpc(_))));
    assert_eq!(pusher.state(), LifecycleState::Stopped);
    assert!(registry.members(&push_role()).is_empty());

    let journal = registry.journal();
    let published = journal
        .iter()
        .any(|op| matches!(op, RegistryOp::Publish { .. }));
    let withdrawn = journal
        .iter()
        .any(|op| matches!(op, RegistryOp::Withdraw { .. }));
    assert_eq!(published, withdrawn);
}

#[tokio::test]
async fn test_unreachable_registry_is_fatal() {
    let registry = InMemoryRegistry::new();
    registry.set_available(false);

    let pusher = Pusher::build(
        &config(free_port()),
        Arc::new(registry.clone()),
        &host_a(),
        None,
    )
    .expect("build pusher");

    let result = pusher.start().await;
    assert!(matches!(result, Err(StartupError::Registration(_))));
    assert_eq!(pusher.state(), LifecycleState::Stopped);
}
