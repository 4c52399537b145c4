//! Service Registry
//!
//! The registry is the external store nodes advertise themselves in and
//! watch for peers. Two implementations are provided:
//! - `etcd`: production registry backed by an etcd cluster (leases + watches)
//! - `memory`: in-process registry with the same semantics, used for
//!   single-node development runs and tests

mod etcd;
mod memory;

pub use etcd::EtcdRegistry;
pub use memory::{InMemoryRegistry, RegistryOp};

use async_trait::async_trait;
use futures::stream::BoxStream;
use liteim_core::{MembershipEvent, NodeAddress, RegistrationRecord, ServiceRole};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("lease {0} not found or expired")]
    LeaseNotFound(i64),
    #[error("watch canceled by registry: {0}")]
    WatchCanceled(String),
    #[error("requested revision compacted, oldest retained is {0}")]
    Compacted(i64),
    #[error("watch fell behind, {0} events skipped")]
    Lagged(u64),
    #[error("invalid registry entry at {key}: {reason}")]
    Codec { key: String, reason: String },
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl RegistryError {
    /// The lease backing a registration is gone, the registration must be
    /// published again rather than renewed.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, RegistryError::LeaseNotFound(_))
    }
}

/// A granted liveness lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub ttl: Duration,
}

/// Result of a full listing: members plus the registry revision the
/// listing reflects. Watching from `revision + 1` misses no change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub members: Vec<NodeAddress>,
    pub revision: i64,
}

/// Incremental membership changes. The stream ending, or yielding an
/// error, means the watch dropped and the view must be resynchronized.
pub type WatchStream = BoxStream<'static, Result<MembershipEvent, RegistryError>>;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Grant a lease of `ttl` and publish `record` under it.
    async fn publish(&self, record: &RegistrationRecord, ttl: Duration)
        -> Result<Lease, RegistryError>;

    /// One keep-alive round for `lease`.
    async fn renew(&self, lease: &Lease) -> Result<(), RegistryError>;

    /// Remove the member key and revoke its lease.
    async fn withdraw(
        &self,
        role: &ServiceRole,
        address: &NodeAddress,
        lease: Option<&Lease>,
    ) -> Result<(), RegistryError>;

    /// Current members of `role`.
    async fn list(&self, role: &ServiceRole) -> Result<Listing, RegistryError>;

    /// Membership changes of `role` starting at `from_revision`.
    async fn watch(&self, role: &ServiceRole, from_revision: i64)
        -> Result<WatchStream, RegistryError>;
}
