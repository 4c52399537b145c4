//! Peer Set
//!
//! The locally cached view of one role's members. Written only by the
//! discovery loop, read concurrently by request handlers. Every event is
//! applied under the write lock, so readers never observe half of one.

use super::rendezvous;
use liteim_core::{MembershipEvent, NodeAddress};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cloneable handle to a shared set of peer addresses
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    members: Arc<RwLock<BTreeSet<NodeAddress>>>,
    synced: Arc<AtomicBool>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<NodeAddress>> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<NodeAddress>> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one membership event. Returns whether the set changed.
    ///
    /// Adding a present member and removing an absent one are no-ops.
    pub fn apply(&self, event: &MembershipEvent) -> bool {
        match event {
            MembershipEvent::Added(address) => self.write().insert(*address),
            MembershipEvent::Removed(address) => self.write().remove(address),
            MembershipEvent::FullResync(members) => {
                let next: BTreeSet<NodeAddress> = members.iter().copied().collect();
                let changed = {
                    let mut current = self.write();
                    let changed = *current != next;
                    *current = next;
                    changed
                };
                self.synced.store(true, Ordering::SeqCst);
                changed
            }
        }
    }

    /// Sorted copy of the current members
    pub fn snapshot(&self) -> Vec<NodeAddress> {
        self.read().iter().copied().collect()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.read().contains(address)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether a full listing has been applied at least once
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Deterministically choose the peer responsible for `key`
    pub fn pick(&self, key: &str) -> Option<NodeAddress> {
        rendezvous::pick(key, self.read().iter())
    }
}
