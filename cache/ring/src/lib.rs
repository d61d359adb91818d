//! Consistent-hash ring mapping string keys to peer identifiers.
//!
//! Each peer contributes a fixed number of virtual nodes to the ring so that
//! adding or removing one peer only remaps that peer's share of the key
//! space. Lookup walks clockwise: a key hashes to a position and the owning
//! peer is the one holding the first virtual node at or after that position,
//! wrapping to the start of the ring if none exists.

use std::collections::HashMap;

/// Pluggable position hash. Defaults to CRC32-IEEE.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// A consistent-hash ring of peer identifiers.
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    /// Virtual node positions, sorted ascending.
    positions: Vec<u32>,
    /// Position to owning peer.
    peers: HashMap<u32, String>,
}

impl HashRing {
    /// Create a ring with `replicas` virtual nodes per peer and the default
    /// CRC32-IEEE hash.
    pub fn new(replicas: usize) -> Self {
        Self::with_hasher(replicas, Box::new(crc32fast::hash))
    }

    /// Create a ring with a caller-supplied position hash.
    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        Self {
            hash,
            replicas,
            positions: Vec::new(),
            peers: HashMap::new(),
        }
    }

    /// Add peers to the ring.
    ///
    /// Each peer contributes `replicas` positions computed from the replica
    /// index concatenated with the peer id. Positions are re-sorted after
    /// every add, so lookup results are independent of insertion order.
    pub fn add<I, S>(&mut self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for peer in peers {
            let peer = peer.as_ref();
            for i in 0..self.replicas {
                let position = (self.hash)(format!("{i}{peer}").as_bytes());
                self.positions.push(position);
                self.peers.insert(position, peer.to_string());
            }
        }
        self.positions.sort_unstable();
    }

    /// Return the peer owning `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let h = (self.hash)(key.as_bytes());
        // First position at or after the key's hash, wrapping past the end.
        let idx = self.positions.partition_point(|&p| p < h);
        let position = self.positions[idx % self.positions.len()];
        self.peers.get(&position).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("positions", &self.positions.len())
            .finish_non_exhaustive()
    }
}
