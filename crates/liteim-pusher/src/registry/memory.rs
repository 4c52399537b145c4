//! In-Memory Registry
//!
//! A complete in-process registry with the same observable semantics as the
//! etcd registry: leased members that expire when not renewed, a revision
//! counter, watches that can resume from a revision, and watches that drop.
//!
//! It also exposes the knobs needed to exercise failure handling:
//! - `set_available(false)` simulates a partition (every call fails and
//!   open watches drop)
//! - `disconnect_watchers()` drops open watches without losing availability
//! - `put_member` / `delete_member` change membership behind the caller's back
//! - `journal()` records the most recent calls made against the registry
//!
//! Both the journal and the change history are bounded. Watching from a
//! revision older than the retained history yields `Compacted`, which makes
//! the watcher resync from a fresh listing.

use super::{Lease, Listing, Registry, RegistryError, WatchStream};
use async_trait::async_trait;
use futures::StreamExt;
use liteim_core::{MembershipEvent, NodeAddress, RegistrationRecord, ServiceRole};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WATCH_BUFFER: usize = 1024;

/// Calls kept in the journal
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Membership changes kept for watch replay
pub const DEFAULT_HISTORY_RETENTION: usize = 4096;

/// A call made against the in-memory registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOp {
    Publish { role: ServiceRole, address: NodeAddress, lease_id: i64 },
    Renew { lease_id: i64 },
    Withdraw { role: ServiceRole, address: NodeAddress },
    List { role: ServiceRole },
    Watch { role: ServiceRole, from_revision: i64 },
}

#[derive(Debug, Clone)]
struct Change {
    revision: i64,
    role: ServiceRole,
    event: MembershipEvent,
}

#[derive(Debug)]
struct Member {
    lease_id: Option<i64>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug)]
struct State {
    revision: i64,
    next_lease_id: i64,
    members: BTreeMap<(ServiceRole, NodeAddress), Member>,
    leases: HashMap<i64, LeaseEntry>,
    history: VecDeque<Change>,
    history_retention: usize,
    /// Highest revision dropped from `history`
    compacted_revision: i64,
    available: bool,
    watch_epoch: CancellationToken,
    journal: VecDeque<RegistryOp>,
    journal_capacity: usize,
}

impl State {
    fn record(&mut self, changes: &broadcast::Sender<Change>, role: ServiceRole, event: MembershipEvent) {
        self.revision += 1;
        let change = Change {
            revision: self.revision,
            role,
            event,
        };
        self.history.push_back(change.clone());
        while self.history.len() > self.history_retention {
            if let Some(oldest) = self.history.pop_front() {
                self.compacted_revision = oldest.revision;
            }
        }
        // No receivers is fine
        let _ = changes.send(change);
    }

    fn log(&mut self, op: RegistryOp) {
        if self.journal_capacity == 0 {
            return;
        }
        if self.journal.len() == self.journal_capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(op);
    }

    fn remove_member(
        &mut self,
        changes: &broadcast::Sender<Change>,
        role: &ServiceRole,
        address: &NodeAddress,
    ) -> Option<Member> {
        let member = self.members.remove(&(role.clone(), *address))?;
        self.record(changes, role.clone(), MembershipEvent::Removed(*address));
        Some(member)
    }

    /// Drop leases past their deadline together with their members
    fn expire_leases(&mut self, changes: &broadcast::Sender<Change>, now: Instant) {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            self.leases.remove(&lease_id);
            let attached: Vec<(ServiceRole, NodeAddress)> = self
                .members
                .iter()
                .filter(|(_, member)| member.lease_id == Some(lease_id))
                .map(|(key, _)| key.clone())
                .collect();
            for (role, address) in attached {
                debug!(lease_id = lease_id, address = %address, "Lease expired, removing member");
                self.remove_member(changes, &role, &address);
            }
        }
    }

    fn drop_watchers(&mut self) {
        self.watch_epoch.cancel();
        self.watch_epoch = CancellationToken::new();
    }
}

/// In-process registry
#[derive(Clone)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_JOURNAL_CAPACITY, DEFAULT_HISTORY_RETENTION)
    }

    /// Keep at most `journal_capacity` calls (0 disables the journal) and
    /// `history_retention` changes for watch replay.
    pub fn with_retention(journal_capacity: usize, history_retention: usize) -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Arc::new(Mutex::new(State {
                revision: 0,
                next_lease_id: 1,
                members: BTreeMap::new(),
                leases: HashMap::new(),
                history: VecDeque::new(),
                history_retention: history_retention.max(1),
                compacted_revision: 0,
                available: true,
                watch_epoch: CancellationToken::new(),
                journal: VecDeque::new(),
                journal_capacity,
            })),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-operation
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock, expire leases and fail if the registry is unreachable
    fn lock_available(&self) -> Result<MutexGuard<'_, State>, RegistryError> {
        let mut state = self.lock();
        state.expire_leases(&self.changes, Instant::now());
        if !state.available {
            return Err(RegistryError::Unavailable(
                "in-memory registry partitioned".to_string(),
            ));
        }
        Ok(state)
    }

    /// Simulate losing or regaining connectivity to the registry.
    /// Going unavailable drops every open watch.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            state.drop_watchers();
        }
    }

    /// Drop every open watch stream
    pub fn disconnect_watchers(&self) {
        self.lock().drop_watchers();
    }

    /// Add a member without a lease, regardless of availability
    pub fn put_member(&self, role: &ServiceRole, address: NodeAddress) {
        let mut state = self.lock();
        state
            .members
            .insert((role.clone(), address), Member { lease_id: None });
        state.record(&self.changes, role.clone(), MembershipEvent::Added(address));
    }

    /// Remove a member regardless of availability
    pub fn delete_member(&self, role: &ServiceRole, address: &NodeAddress) {
        let mut state = self.lock();
        state.remove_member(&self.changes, role, address);
    }

    /// Current members of `role`, after expiring overdue leases
    pub fn members(&self, role: &ServiceRole) -> Vec<NodeAddress> {
        let mut state = self.lock();
        state.expire_leases(&self.changes, Instant::now());
        state
            .members
            .keys()
            .filter(|(r, _)| r == role)
            .map(|(_, address)| *address)
            .collect()
    }

    /// Expire overdue leases now instead of on the next call
    pub fn expire_leases(&self) {
        self.lock().expire_leases(&self.changes, Instant::now());
    }

    /// Periodically expire leases so watchers observe departures of
    /// members that stopped renewing, even when nobody calls the registry.
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.expire_leases();
            }
        })
    }

    /// The most recent calls, oldest first
    pub fn journal(&self) -> Vec<RegistryOp> {
        self.lock().journal.iter().cloned().collect()
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Highest revision no longer available for watch replay
    pub fn compacted_revision(&self) -> i64 {
        self.lock().compacted_revision
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn publish(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Lease, RegistryError> {
        let mut state = self.lock_available()?;

        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            lease_id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );

        state.members.insert(
            (record.role.clone(), record.address),
            Member {
                lease_id: Some(lease_id),
            },
        );
        state.record(
            &self.changes,
            record.role.clone(),
            MembershipEvent::Added(record.address),
        );
        state.log(RegistryOp::Publish {
            role: record.role.clone(),
            address: record.address,
            lease_id,
        });

        Ok(Lease { id: lease_id, ttl })
    }

    async fn renew(&self, lease: &Lease) -> Result<(), RegistryError> {
        let mut state = self.lock_available()?;
        state.log(RegistryOp::Renew { lease_id: lease.id });

        match state.leases.get_mut(&lease.id) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(RegistryError::LeaseNotFound(lease.id)),
        }
    }

    async fn withdraw(
        &self,
        role: &ServiceRole,
        address: &NodeAddress,
        lease: Option<&Lease>,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock_available()?;
        state.log(RegistryOp::Withdraw {
            role: role.clone(),
            address: *address,
        });

        state.remove_member(&self.changes, role, address);
        if let Some(lease) = lease {
            state.leases.remove(&lease.id);
        }
        Ok(())
    }

    async fn list(&self, role: &ServiceRole) -> Result<Listing, RegistryError> {
        let mut state = self.lock_available()?;
        state.log(RegistryOp::List { role: role.clone() });

        let members = state
            .members
            .keys()
            .filter(|(r, _)| r == role)
            .map(|(_, address)| *address)
            .collect();
        Ok(Listing {
            members,
            revision: state.revision,
        })
    }

    async fn watch(
        &self,
        role: &ServiceRole,
        from_revision: i64,
    ) -> Result<WatchStream, RegistryError> {
        let mut state = self.lock_available()?;
        state.log(RegistryOp::Watch {
            role: role.clone(),
            from_revision,
        });

        if from_revision <= state.compacted_revision {
            debug!(from_revision, compacted = state.compacted_revision, "Watch below compaction");
            let compacted = RegistryError::Compacted(state.compacted_revision);
            return Ok(futures::stream::iter([Err(compacted)]).boxed());
        }

        // Replay and subscribe under the same lock so no change is missed
        // or delivered twice.
        let replay: Vec<Result<MembershipEvent, RegistryError>> = state
            .history
            .iter()
            .filter(|change| change.revision >= from_revision && &change.role == role)
            .map(|change| Ok(change.event.clone()))
            .collect();
        let live = BroadcastStream::new(self.changes.subscribe());
        let dropped = state.watch_epoch.clone().cancelled_owned();
        drop(state);

        let role = role.clone();
        let live = live.filter_map(move |item| {
            let item = match item {
                Ok(change) if change.role == role => Some(Ok(change.event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    Some(Err(RegistryError::Lagged(skipped)))
                }
            };
            futures::future::ready(item)
        });

        Ok(futures::stream::iter(replay)
            .chain(live)
            .take_until(dropped)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str) -> ServiceRole {
        ServiceRole::new(name).unwrap()
    }

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn record(role_name: &str, address: &str) -> RegistrationRecord {
        RegistrationRecord::new(role(role_name), addr(address), "test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_list_withdraw() {
        let registry = InMemoryRegistry::new();
        let lease = registry
            .publish(&record("push-service", "10.0.0.1:9000"), Duration::from_secs(10))
            .await
            .unwrap();

        let listing = registry.list(&role("push-service")).await.unwrap();
        assert_eq!(listing.members, vec![addr("10.0.0.1:9000")]);
        assert_eq!(listing.revision, 1);
        assert!(registry.list(&role("gateway-service")).await.unwrap().members.is_empty());

        registry
            .withdraw(&role("push-service"), &addr("10.0.0.1:9000"), Some(&lease))
            .await
            .unwrap();
        assert!(registry.members(&role("push-service")).is_empty());
        assert!(matches!(
            registry.renew(&lease).await,
            Err(RegistryError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let registry = InMemoryRegistry::new();
        let lease = registry
            .publish(&record("push-service", "10.0.0.1:9000"), Duration::from_secs(3))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        registry.renew(&lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.members(&role("push-service")).len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(registry.members(&role("push-service")).is_empty());
        assert!(registry.renew(&lease).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_rejects_calls() {
        let registry = InMemoryRegistry::new();
        registry.set_available(false);

        let result = registry
            .publish(&record("push-service", "10.0.0.1:9000"), Duration::from_secs(3))
            .await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
        assert!(registry.list(&role("push-service")).await.is_err());

        registry.set_available(true);
        assert!(registry.list(&role("push-service")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_resumes_from_revision() {
        let registry = InMemoryRegistry::new();
        let gateways = role("gateway-service");

        registry.put_member(&gateways, addr("10.0.1.1:8000"));
        let listing = registry.list(&gateways).await.unwrap();

        // Changes between listing and watch are replayed
        registry.put_member(&gateways, addr("10.0.1.2:8000"));
        registry.put_member(&role("push-service"), addr("10.0.0.1:9000"));

        let mut stream = registry.watch(&gateways, listing.revision + 1).await.unwrap();
        registry.delete_member(&gateways, &addr("10.0.1.1:8000"));

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            MembershipEvent::Added(addr("10.0.1.2:8000"))
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            MembershipEvent::Removed(addr("10.0.1.1:8000"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_watch_streams() {
        let registry = InMemoryRegistry::new();
        let gateways = role("gateway-service");

        let mut stream = registry.watch(&gateways, 1).await.unwrap();
        registry.disconnect_watchers();
        assert!(stream.next().await.is_none());

        // New watches work again
        let mut stream = registry.watch(&gateways, 1).await.unwrap();
        registry.put_member(&gateways, addr("10.0.1.1:8000"));
        assert!(stream.next().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_records_calls() {
        let registry = InMemoryRegistry::new();
        let lease = registry
            .publish(&record("push-service", "10.0.0.1:9000"), Duration::from_secs(3))
            .await
            .unwrap();
        registry.renew(&lease).await.unwrap();

        let journal = registry.journal();
        assert_eq!(journal.len(), 2);
        assert!(matches!(journal[0], RegistryOp::Publish { .. }));
        assert_eq!(journal[1], RegistryOp::Renew { lease_id: lease.id });
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_keeps_most_recent_calls() {
        let registry = InMemoryRegistry::with_retention(4, DEFAULT_HISTORY_RETENTION);
        let lease = registry
            .publish(&record("push-service", "10.0.0.1:9000"), Duration::from_secs(15))
            .await
            .unwrap();
        // A day of keep-alives at 5s
        for _ in 0..17_280 {
            registry.renew(&lease).await.unwrap();
        }

        let journal = registry.journal();
        assert_eq!(journal.len(), 4);
        assert!(journal
            .iter()
            .all(|op| *op == RegistryOp::Renew { lease_id: lease.id }));

        let silent = InMemoryRegistry::with_retention(0, DEFAULT_HISTORY_RETENTION);
        silent.list(&role("push-service")).await.unwrap();
        assert!(silent.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_below_compaction_forces_resync() {
        let registry = InMemoryRegistry::with_retention(DEFAULT_JOURNAL_CAPACITY, 2);
        let gateways = role("gateway-service");
        for i in 1..=5 {
            registry.put_member(&gateways, addr(&format!("10.0.1.{i}:8000")));
        }
        assert_eq!(registry.revision(), 5);
        assert_eq!(registry.compacted_revision(), 3);

        let mut stream = registry.watch(&gateways, 2).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(RegistryError::Compacted(3)))
        ));
        assert!(stream.next().await.is_none());

        // Resuming inside the retained window replays normally
        let mut stream = registry.watch(&gateways, 4).await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            MembershipEvent::Added(addr("10.0.1.4:8000"))
        );

        // A fresh listing always lands inside the window
        let listing = registry.list(&gateways).await.unwrap();
        assert_eq!(listing.members.len(), 5);
        let mut stream = registry.watch(&gateways, listing.revision + 1).await.unwrap();
        registry.delete_member(&gateways, &addr("10.0.1.1:8000"));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            MembershipEvent::Removed(addr("10.0.1.1:8000"))
        );
    }
}
