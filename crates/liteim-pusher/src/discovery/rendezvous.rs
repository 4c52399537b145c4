//! Rendezvous Hashing (Highest Random Weight)
//!
//! Picks which gateway a push for a given key is routed through.
//!
//! Properties:
//! - Even distribution regardless of peer count
//! - Minimal disruption: only keys owned by an added/removed peer move
//! - Deterministic: same key always maps to same peer given same membership

use liteim_core::NodeAddress;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Returns the peer with the highest `hash(key, peer)` score.
pub fn pick<'a>(key: &str, peers: impl IntoIterator<Item = &'a NodeAddress>) -> Option<NodeAddress> {
    peers.into_iter().max_by_key(|peer| score(key, peer)).copied()
}

/// Higher score wins ownership.
fn score(key: &str, peer: &NodeAddress) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    peer.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peers(count: u8) -> Vec<NodeAddress> {
        (1..=count)
            .map(|i| NodeAddress::new(Ipv4Addr::new(10, 0, 1, i), 8000))
            .collect()
    }

    #[test]
    fn test_empty_returns_none() {
        assert!(pick("any-key", &Vec::<NodeAddress>::new()).is_none());
    }

    #[test]
    fn test_single_peer_owns_all() {
        let peers = peers(1);
        for i in 0..100 {
            assert_eq!(pick(&format!("user-{i}"), &peers), Some(peers[0]));
        }
    }

    #[test]
    fn test_order_independent() {
        let peers = peers(5);
        let mut reversed = peers.clone();
        reversed.reverse();

        for i in 0..100 {
            let key = format!("user-{i}");
            assert_eq!(pick(&key, &peers), pick(&key, &reversed));
        }
    }

    #[test]
    fn test_even_distribution() {
        let peers = peers(4);
        let mut counts = [0usize; 4];
        let num_keys = 10000;

        for i in 0..num_keys {
            if let Some(owner) = pick(&format!("user-{i}"), &peers) {
                if let Some(idx) = peers.iter().position(|p| *p == owner) {
                    counts[idx] += 1;
                }
            }
        }

        // Each peer should get ~25% (allow 10% deviation)
        let expected = num_keys / 4;
        let tolerance = expected / 10;
        for (i, &count) in counts.iter().enumerate() {
            let diff = (count as i64 - expected as i64).unsigned_abs() as usize;
            assert!(
                diff < tolerance,
                "Peer {i}: got {count}, expected ~{expected} (±{tolerance})"
            );
        }
    }

    #[test]
    fn test_minimal_disruption() {
        let peers = peers(4);
        let remaining = &peers[1..];

        let mut moved = 0;
        for i in 0..1000 {
            let key = format!("user-{i}");
            let before = pick(&key, &peers);
            let after = pick(&key, remaining);
            if before != after {
                // Only keys owned by the removed peer may move
                assert_eq!(before, Some(peers[0]));
                moved += 1;
            }
        }

        let move_pct = (moved as f64 / 1000.0) * 100.0;
        assert!(move_pct < 35.0, "Too many keys moved: {move_pct:.1}% (expected ~25%)");
    }
}
