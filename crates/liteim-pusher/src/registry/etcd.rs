//! Etcd Registry
//!
//! Registry backed by etcd. Each member is a key under its role prefix,
//! attached to a lease the owning node keeps alive:
//!
//! ```text
//! /liteim/services/push-service/10.0.0.5:9000 -> RegistrationRecord (JSON)
//! ```

use super::{Lease, Listing, Registry, RegistryError, WatchStream};
use crate::config::PusherConfig;
use async_trait::async_trait;
use backoff::future::retry;
use etcd_client::{
    Client, EventType, GetOptions, KeyValue, PutOptions, WatchOptions, WatchResponse,
};
use futures::StreamExt;
use liteim_core::{keys, MembershipEvent, NodeAddress, RegistrationRecord, ServiceRole};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Etcd-backed registry
#[derive(Clone)]
pub struct EtcdRegistry {
    client: Client,
}

impl EtcdRegistry {
    /// Connect to etcd with exponential backoff.
    ///
    /// Gives up after `connect_max_elapsed`; a node that cannot reach the
    /// registry at startup cannot register and must not start.
    pub async fn connect(config: &PusherConfig) -> Result<Self, RegistryError> {
        let endpoints = config.etcd_endpoints.clone();
        let backoff = config.retry_backoff(Some(config.connect_max_elapsed));

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

fn member_from_key(prefix: &str, key: &str) -> Result<NodeAddress, RegistryError> {
    keys::address_from_key(prefix, key).ok_or_else(|| RegistryError::Codec {
        key: key.to_string(),
        reason: "key does not end in host:port".to_string(),
    })
}

fn member_from_kv(prefix: &str, kv: &KeyValue) -> Result<NodeAddress, RegistryError> {
    member_from_key(prefix, kv.key_str()?)
}

/// A watch response that ends the watch. Compaction is checked first,
/// etcd cancels compacted watches and reports both.
fn watch_status(canceled: bool, reason: &str, compact_revision: i64) -> Result<(), RegistryError> {
    if compact_revision > 0 {
        return Err(RegistryError::Compacted(compact_revision));
    }
    if canceled {
        return Err(RegistryError::WatchCanceled(reason.to_string()));
    }
    Ok(())
}

/// Membership change for one key event, `None` for keys outside the layout.
fn membership_event(prefix: &str, event_type: EventType, key: &str) -> Option<MembershipEvent> {
    let address = match member_from_key(prefix, key) {
        Ok(address) => address,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed member key");
            return None;
        }
    };
    Some(match event_type {
        EventType::Put => MembershipEvent::Added(address),
        EventType::Delete => MembershipEvent::Removed(address),
    })
}

/// Translate one watch response into membership events.
fn events_from_response(
    prefix: &str,
    resp: &WatchResponse,
) -> Result<Vec<MembershipEvent>, RegistryError> {
    watch_status(resp.canceled(), resp.cancel_reason(), resp.compact_revision())?;

    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else { continue };
        let key = kv.key_str()?;
        events.extend(membership_event(prefix, event.event_type(), key));
    }
    Ok(events)
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn publish(
        &self,
        record: &RegistrationRecord,
        ttl: Duration,
    ) -> Result<Lease, RegistryError> {
        let mut client = self.client();

        // etcd leases have whole-second granularity
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let lease_id = client.lease_grant(ttl_secs, None).await?.id();
        debug!(lease_id = lease_id, ttl = ttl_secs, "Lease granted");

        let key = keys::member_key(&record.role, &record.address);
        let value = serde_json::to_string(record).map_err(|e| RegistryError::Codec {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let put_options = PutOptions::new().with_lease(lease_id);
        client.put(key.clone(), value, Some(put_options)).await?;
        debug!(key = %key, lease_id = lease_id, "Member published");

        Ok(Lease {
            id: lease_id,
            ttl: Duration::from_secs(ttl_secs as u64),
        })
    }

    async fn renew(&self, lease: &Lease) -> Result<(), RegistryError> {
        let mut client = self.client();

        // Opening the keep-alive stream sends the first keep-alive request
        let (_keeper, mut stream) = client.lease_keep_alive(lease.id).await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                trace!(lease_id = lease.id, ttl = resp.ttl(), "Keep-alive OK");
                Ok(())
            }
            Some(_) => Err(RegistryError::LeaseNotFound(lease.id)),
            None => Err(RegistryError::Unavailable(
                "keep-alive stream closed".to_string(),
            )),
        }
    }

    async fn withdraw(
        &self,
        role: &ServiceRole,
        address: &NodeAddress,
        lease: Option<&Lease>,
    ) -> Result<(), RegistryError> {
        let mut client = self.client();
        let key = keys::member_key(role, address);

        client.delete(key.clone(), None).await?;
        debug!(key = %key, "Member key deleted");

        if let Some(lease) = lease {
            if let Err(e) = client.lease_revoke(lease.id).await {
                // The key is already gone, an expired lease is not a failure
                debug!(lease_id = lease.id, error = %e, "Lease revoke failed");
            }
        }
        Ok(())
    }

    async fn list(&self, role: &ServiceRole) -> Result<Listing, RegistryError> {
        let mut client = self.client();
        let prefix = keys::role_prefix(role);

        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut members = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match member_from_kv(&prefix, kv) {
                Ok(address) => members.push(address),
                Err(e) => warn!(error = %e, "Ignoring malformed member key"),
            }
        }

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(Listing { members, revision })
    }

    async fn watch(
        &self,
        role: &ServiceRole,
        from_revision: i64,
    ) -> Result<WatchStream, RegistryError> {
        let mut client = self.client();
        let prefix = keys::role_prefix(role);

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, stream) = client.watch(prefix.clone(), Some(options)).await?;
        debug!(prefix = %prefix, from_revision = from_revision, "Watch stream established");

        // The watcher is carried along so the server-side watch lives as
        // long as the stream does.
        let state = (watcher, stream, prefix, VecDeque::new(), false);
        let events = futures::stream::unfold(
            state,
            |(watcher, mut stream, prefix, mut pending, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (watcher, stream, prefix, pending, false)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) => match events_from_response(&prefix, &resp) {
                            Ok(events) => pending.extend(events),
                            Err(e) => return Some((Err(e), (watcher, stream, prefix, pending, true))),
                        },
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((Err(e.into()), (watcher, stream, prefix, pending, true)))
                        }
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}
