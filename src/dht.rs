//! # Routing Table, Local Store and Lookup State
//!
//! The node keeps two tables:
//!
//! - [`RoutingTable`]: node name → UDP address of every peer it has heard of.
//!   Entries are created by `H` replies, `O` replies and node-keyed `W`
//!   requests, and are never expired. A dead peer is only discovered when a
//!   query to it times out.
//! - [`LocalStore`]: key → value for the slice of the key space held here,
//!   with compare-and-swap.
//!
//! [`Lookup`] holds the work queue of an iterative search; the network side of
//! the search lives in [`crate::node`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::identity::{distance_cmp, HashId, NodeName};

/// Number of peers returned by a nearest-nodes query.
pub const DEFAULT_NEAREST_COUNT: usize = 3;

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug, Default)]
pub struct RoutingTable {
    peers: HashMap<NodeName, SocketAddr>,
}

impl RoutingTable {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns `true` when the peer was new.
    pub fn observe(&mut self, name: NodeName, addr: SocketAddr) -> bool {
        match self.peers.insert(name, addr) {
            None => true,
            Some(previous) => {
                if previous != addr {
                    trace!(old = %previous, new = %addr, "peer address changed");
                }
                false
            }
        }
    }

    pub fn get(&self, name: &NodeName) -> Option<SocketAddr> {
        self.peers.get(name).copied()
    }

    /// Look up a peer by its raw wire name.
    pub fn get_str(&self, name: &str) -> Option<(NodeName, SocketAddr)> {
        let name = NodeName::parse(name).ok()?;
        let addr = self.get(&name)?;
        Some((name, addr))
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.peers.contains_key(name)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn names(&self) -> Vec<NodeName> {
        self.peers.keys().cloned().collect()
    }

    /// The `n` known peers nearest to `target`, nearest first.
    ///
    /// Ties on distance are broken by name so replies are deterministic.
    pub fn closest(&self, target: &HashId, n: usize) -> Vec<(NodeName, SocketAddr)> {
        if n == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<(HashId, &NodeName, SocketAddr)> = self
            .peers
            .iter()
            .map(|(name, addr)| (name.hash_id(), name, *addr))
            .collect();
        ranked.sort_by(|a, b| distance_cmp(target, &a.0, &b.0).then_with(|| a.1.cmp(b.1)));

        ranked
            .into_iter()
            .take(n)
            .map(|(_, name, addr)| (name.clone(), addr))
            .collect()
    }
}

// ============================================================================
// Local Store
// ============================================================================

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Key was absent; the new value was inserted.
    Inserted,
    /// Current value matched; it was replaced.
    Swapped,
    /// Current value differed; nothing changed.
    Mismatch,
}

impl CasOutcome {
    pub fn succeeded(self) -> bool {
        !matches!(self, CasOutcome::Mismatch)
    }
}

#[derive(Debug, Default)]
pub struct LocalStore {
    entries: HashMap<String, String>,
}

impl LocalStore {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Upsert. Returns `true` when an existing value was replaced.
    pub fn put(&mut self, key: &str, value: &str) -> bool {
        self.entries
            .insert(key.to_string(), value.to_string())
            .is_some()
    }

    /// Replace `key` with `new` if it currently holds `expected`.
    ///
    /// An absent key counts as a match: the value is created.
    pub fn compare_and_swap(&mut self, key: &str, expected: &str, new: &str) -> CasOutcome {
        match self.entries.get_mut(key) {
            None => {
                self.entries.insert(key.to_string(), new.to_string());
                CasOutcome::Inserted
            }
            Some(current) if current == expected => {
                *current = new.to_string();
                CasOutcome::Swapped
            }
            Some(_) => CasOutcome::Mismatch,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Routing table and store, the state the dispatcher mutates.
#[derive(Debug, Default)]
pub struct Tables {
    pub routing: RoutingTable,
    pub store: LocalStore,
}

// ============================================================================
// Iterative Lookup State
// ============================================================================

/// Work queue and visited set of one iterative lookup.
///
/// Peers are queried in discovery order. A peer is queried at most once, and
/// a queued peer that has since vanished from the routing table is skipped.
#[derive(Debug)]
pub struct Lookup {
    target: HashId,
    self_name: Option<NodeName>,
    queue: VecDeque<NodeName>,
    visited: HashSet<NodeName>,
}

impl Lookup {
    pub fn new(target: HashId, self_name: Option<NodeName>, seeds: Vec<NodeName>) -> Self {
        let mut lookup = Self {
            target,
            self_name,
            queue: VecDeque::new(),
            visited: HashSet::new(),
        };
        for seed in seeds {
            lookup.enqueue(seed);
        }
        lookup
    }

    pub fn target(&self) -> &HashId {
        &self.target
    }

    fn enqueue(&mut self, name: NodeName) {
        if self.self_name.as_ref() == Some(&name) {
            return;
        }
        if !self.visited.contains(&name) && !self.queue.contains(&name) {
            self.queue.push_back(name);
        }
    }

    /// Pop the next peer to query, marking it visited.
    pub fn next_peer(&mut self, routing: &RoutingTable) -> Option<(NodeName, SocketAddr)> {
        while let Some(name) = self.queue.pop_front() {
            if self.visited.contains(&name) {
                continue;
            }
            let Some(addr) = routing.get(&name) else {
                trace!(peer = %name, "skipping peer no longer in routing table");
                continue;
            };
            self.visited.insert(name.clone());
            return Some((name, addr));
        }
        None
    }

    /// Fold an `O` reply into the routing table and the queue.
    ///
    /// Returns the number of peers newly queued.
    pub fn absorb(&mut self, pairs: &[(&str, &str)], routing: &mut RoutingTable) -> usize {
        let mut queued = 0;
        for (raw_name, raw_addr) in pairs {
            let Ok(name) = NodeName::parse(raw_name) else {
                debug!(name = %raw_name, "ignoring nearest-node entry with invalid name");
                continue;
            };
            let Ok(addr) = raw_addr.parse::<SocketAddr>() else {
                debug!(peer = %name, addr = %raw_addr, "ignoring nearest-node entry with invalid address");
                continue;
            };
            if self.self_name.as_ref() == Some(&name) {
                continue;
            }
            routing.observe(name.clone(), addr);
            let before = self.queue.len();
            self.enqueue(name);
            queued += self.queue.len() - before;
        }
        queued
    }

    pub fn visited(&self) -> usize {
        self.visited.len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
