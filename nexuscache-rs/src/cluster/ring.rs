//! Provides the consistent hash ring which assigns each key to its owning peer.
//!
//! Every peer contributes a number of *virtual points* (50 by default) to the ring so that
//! the keyspace splits evenly even for small clusters. A point is derived by md5-hex'ing
//! `i ++ peer` (with `i` being the virtual node index) and hashing the hex string with a
//! 64 bit FNV-1a - the same derivation every node performs, so all nodes agree on
//! ownership without talking to each other.
//!
//! Looking up a key walks clockwise: the owner is the peer behind the first point at or
//! after the key's hash, wrapping around at the end of the point array. Removing a peer
//! only moves the keys it owned to their clockwise successors - everything else stays put,
//! which is the whole reason for consistent hashing.
use std::sync::Mutex;

use fnv::{FnvHashMap, FnvHasher};
use std::hash::Hasher;

/// Contains the number of virtual points each peer contributes to the ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// The 64 bit hash used to place points and keys on the ring.
///
/// FNV-1a is the default - fast, dependency-light and uniform enough once the md5-hex
/// pre-mixing of the point derivation is in place.
pub type RingHash = fn(&[u8]) -> u64;

/// Hashes the given bytes with 64 bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}

struct RingState {
    points: Vec<u64>,
    owners: FnvHashMap<u64, String>,
}

/// A consistent hash ring mapping keys to peer names.
///
/// [HashRing::get] is a pure function of the peer set, the replica count and the hash -
/// identical inputs yield identical owners on every node.
pub struct HashRing {
    replicas: usize,
    hash: RingHash,
    state: Mutex<RingState>,
}

impl HashRing {
    /// Creates a new ring with the given number of virtual points per peer.
    ///
    /// If no hash function is provided, 64 bit FNV-1a is used.
    pub fn new(replicas: usize, hash: Option<RingHash>) -> Self {
        HashRing {
            replicas,
            hash: hash.unwrap_or(fnv1a),
            state: Mutex::new(RingState {
                points: Vec::new(),
                owners: FnvHashMap::default(),
            }),
        }
    }

    /// Computes the ring point of the i-th virtual node of the given peer.
    fn point(&self, index: usize, peer: &str) -> u64 {
        let digest = md5::compute(format!("{}{}", index, peer));
        (self.hash)(format!("{:x}", digest).as_bytes())
    }

    /// Adds the given peers to the ring.
    ///
    /// Each peer contributes its full set of virtual points; the point array is re-sorted
    /// once afterwards.
    pub fn add<S: AsRef<str>>(&self, peers: &[S]) {
        let mut state = self.state.lock().unwrap();
        for peer in peers {
            for index in 0..self.replicas {
                let point = self.point(index, peer.as_ref());
                state.points.push(point);
                let _ = state.owners.insert(point, peer.as_ref().to_owned());
            }
        }
        state.points.sort_unstable();
    }

    /// Returns the peer owning the given key, or **None** if the ring is empty.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.points.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());

        // Lower bound: the first point at or after the key's hash. Ties break towards the
        // lower index; a hash beyond the last point wraps to the first one.
        let index = state.points.partition_point(|&point| point < hash);
        let point = state.points[index % state.points.len()];

        state.owners.get(&point).cloned()
    }

    /// Removes the given peer from the ring.
    ///
    /// This recomputes the peer's virtual points and removes one occurrence of each.
    pub fn remove(&self, peer: &str) {
        let mut state = self.state.lock().unwrap();
        for index in 0..self.replicas {
            let point = self.point(index, peer);
            if let Ok(position) = state.points.binary_search(&point) {
                let _ = state.points.remove(position);
            }
            let _ = state.owners.remove(&point);
        }
    }

    /// Determines if no peers are present.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().points.is_empty()
    }

    /// Returns the names of all peers currently on the ring.
    pub fn peers(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut peers: Vec<String> = state.owners.values().cloned().collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::ring::{HashRing, DEFAULT_REPLICAS};

    #[test]
    fn an_empty_ring_owns_nothing() {
        let ring = HashRing::new(DEFAULT_REPLICAS, None);
        assert_eq!(ring.get("Tom"), None);
        assert_eq!(ring.is_empty(), true);
    }

    #[test]
    fn ownership_is_deterministic_across_instances() {
        let first = HashRing::new(DEFAULT_REPLICAS, None);
        first.add(&["node-a", "node-b", "node-c"]);

        // A second ring built from the same peer set agrees on every key...
        let second = HashRing::new(DEFAULT_REPLICAS, None);
        second.add(&["node-b"]);
        second.add(&["node-c", "node-a"]);

        for i in 0..1000 {
            let key = format!("key-{}", i);
            assert_eq!(first.get(&key), second.get(&key));
        }

        // ...including these well-known fixtures.
        assert_eq!(first.get("Tom").unwrap(), "node-b");
        assert_eq!(first.get("Jack").unwrap(), "node-a");
        assert_eq!(first.get("Sam").unwrap(), "node-c");
    }

    #[test]
    fn removal_reroutes_to_the_remaining_peers() {
        let ring = HashRing::new(DEFAULT_REPLICAS, None);
        ring.add(&["node-a", "node-b"]);
        assert_eq!(ring.get("Tom").unwrap(), "node-b");

        ring.remove("node-b");
        assert_eq!(ring.get("Tom").unwrap(), "node-a");
        assert_eq!(ring.peers(), vec!["node-a".to_owned()]);

        ring.remove("node-a");
        assert_eq!(ring.get("Tom"), None);
        assert_eq!(ring.is_empty(), true);
    }

    #[test]
    fn removal_leaves_unrelated_ownership_untouched() {
        let ring = HashRing::new(DEFAULT_REPLICAS, None);
        ring.add(&["node-a", "node-b", "node-c"]);

        let before: Vec<Option<String>> = (0..1000)
            .map(|i| ring.get(&format!("key-{}", i)))
            .collect();

        ring.remove("node-b");

        // Keys which node-b didn't own keep their owner...
        for (i, owner) in before.iter().enumerate() {
            if owner.as_deref() != Some("node-b") {
                assert_eq!(&ring.get(&format!("key-{}", i)), owner);
            }
        }
    }

    #[test]
    fn the_keyspace_splits_evenly() {
        let ring = HashRing::new(DEFAULT_REPLICAS, None);
        ring.add(&["node-a", "node-b", "node-c"]);

        let mut counts = std::collections::HashMap::new();
        for i in 0..10_000 {
            let owner = ring.get(&format!("key-{}", i)).unwrap();
            *counts.entry(owner).or_insert(0usize) += 1;
        }

        // Each of the three peers has to own its share of the keyspace within ±30%...
        for (peer, count) in counts {
            assert_eq!(
                (2_333..=4_333).contains(&count),
                true,
                "peer {} owns {} of 10000 keys",
                peer,
                count
            );
        }
    }

    #[test]
    fn the_hash_is_pluggable() {
        // A degenerate hash which maps everything to its length sends every key to the
        // same owner - which proves the ring consults the provided function.
        fn by_length(data: &[u8]) -> u64 {
            data.len() as u64
        }

        let ring = HashRing::new(2, Some(by_length));
        ring.add(&["left", "right"]);

        let first = ring.get("a").unwrap();
        assert_eq!(ring.get("b").unwrap(), first);
        assert_eq!(ring.get("c").unwrap(), first);
    }
}
