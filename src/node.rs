//! # High-Level Node API
//!
//! A [`Node`] owns one UDP endpoint, a routing table, a local store, a relay
//! chain and the protocol dispatcher, and exposes the key-value operations.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut node = Node::new(NodeConfig::default());
//! node.set_node_name("N:alice")?;
//! node.open_port(20110).await?;
//!
//! node.greet("10.0.0.7:20112".parse()?).await?;
//! node.handle_incoming_messages(Duration::from_millis(500)).await?;
//!
//! node.write("greeting", "hello world")?;
//! let value = node.read("some other key").await?;
//! ```
//!
//! ## Execution Model
//!
//! There is no background receiver. Incoming datagrams are only handled while
//! a method pumps the socket: [`Node::handle_incoming_messages`] and the
//! network-backed lookups in [`Node::exists`] and [`Node::read`]. Every method
//! takes `&mut self`, so only one operation runs at a time.
//!
//! ## Lookup
//!
//! A key missing from the local store is searched for iteratively. Each known
//! peer is asked directly for the key, then asked for the peers it knows
//! nearest to the key's hash; newly learned peers join the end of the queue.
//! The search ends at the first positive answer or when the queue is empty.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::dht::{Lookup, Tables, DEFAULT_NEAREST_COUNT};
use crate::identity::{is_node_key, HashId, NameError, NodeName};
use crate::messages::{self, TxId};
use crate::relay::RelayChain;
use crate::rpc::{Dispatcher, DEFAULT_TRANSACTION_CACHE_CAPACITY};
use crate::transport::UdpTransport;

/// Ports a node may listen on unless configured otherwise.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 20110..=20130;

/// Rendezvous peer used when a lookup starts with an empty routing table.
pub const DEFAULT_BOOTSTRAP_NAME: &str = "N:azure";
pub const DEFAULT_BOOTSTRAP_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 216, 34, 197)), 20114);

/// How long a lookup waits for each reply from a queried peer.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Longest single wait on the socket while pumping.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Configuration
// ============================================================================

/// A named peer at a fixed address, written `N:name@host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub name: NodeName,
    pub addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NodeError::InvalidBootstrap(s.to_string());
        let (name, addr) = s.rsplit_once('@').ok_or_else(invalid)?;
        let name = NodeName::parse(name).map_err(|_| invalid())?;
        let addr = addr.parse().map_err(|_| invalid())?;
        Ok(Self { name, addr })
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Ports accepted by [`Node::open_port`].
    pub port_range: RangeInclusive<u16>,
    /// Local address the endpoint binds to.
    pub bind_ip: IpAddr,
    /// Peer seeded into an empty routing table when a lookup starts.
    pub bootstrap: Option<BootstrapPeer>,
    /// Wait per queried peer, per sub-query.
    pub query_timeout: Duration,
    /// Receive slice used by the pump.
    pub poll_interval: Duration,
    /// Probability of discarding a received datagram before handling it.
    pub drop_rate: f64,
    /// Peers returned in answer to a nearest-nodes request.
    pub nearest_count: usize,
    /// Transaction ids remembered for deduplication.
    pub transaction_cache_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bootstrap: NodeName::parse(DEFAULT_BOOTSTRAP_NAME)
                .ok()
                .map(|name| BootstrapPeer {
                    name,
                    addr: DEFAULT_BOOTSTRAP_ADDR,
                }),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drop_rate: 0.0,
            nearest_count: DEFAULT_NEAREST_COUNT,
            transaction_cache_capacity: DEFAULT_TRANSACTION_CACHE_CAPACITY,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum NodeError {
    InvalidName(NameError),
    NameAlreadySet(NodeName),
    PortOutOfRange { port: u16, range: RangeInclusive<u16> },
    PortAlreadyOpen(SocketAddr),
    PortNotOpen,
    Bind { port: u16, source: io::Error },
    InvalidKey,
    InvalidValue,
    InvalidBootstrap(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidName(e) => write!(f, "{}", e),
            NodeError::NameAlreadySet(name) => write!(f, "node name already set to {}", name),
            NodeError::PortOutOfRange { port, range } => write!(
                f,
                "port {} outside allowed range {}-{}",
                port,
                range.start(),
                range.end()
            ),
            NodeError::PortAlreadyOpen(addr) => write!(f, "port already open on {}", addr),
            NodeError::PortNotOpen => write!(f, "no port open"),
            NodeError::Bind { port, source } => write!(f, "failed to bind port {}: {}", port, source),
            NodeError::InvalidKey => write!(f, "key must not be empty"),
            NodeError::InvalidValue => write!(f, "value must not be empty"),
            NodeError::InvalidBootstrap(s) => {
                write!(f, "invalid bootstrap peer {:?}: expected N:name@host:port", s)
            }
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::InvalidName(e) => Some(e),
            NodeError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<NameError> for NodeError {
    fn from(e: NameError) -> Self {
        NodeError::InvalidName(e)
    }
}

fn require_key(key: &str) -> Result<(), NodeError> {
    if key.trim().is_empty() {
        return Err(NodeError::InvalidKey);
    }
    Ok(())
}

fn require_value(value: &str) -> Result<(), NodeError> {
    if value.trim().is_empty() {
        return Err(NodeError::InvalidValue);
    }
    Ok(())
}

// ============================================================================
// Node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupMode {
    Exists,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LookupOutcome {
    Value(String),
    Present,
    Missing,
}

pub struct Node {
    config: NodeConfig,
    transport: Option<UdpTransport>,
    tables: Tables,
    dispatcher: Dispatcher,
    relays: RelayChain,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let dispatcher = Dispatcher::new(
            config.transaction_cache_capacity,
            config.drop_rate,
            config.nearest_count,
        );
        Self {
            config,
            transport: None,
            tables: Tables::default(),
            dispatcher,
            relays: RelayChain::new(),
        }
    }

    /// Set this node's name. May only be done once.
    pub fn set_node_name(&mut self, name: &str) -> Result<(), NodeError> {
        if let Some(existing) = self.dispatcher.name() {
            return Err(NodeError::NameAlreadySet(existing.clone()));
        }
        let name = NodeName::parse(name)?;
        info!(name = %name, "node name set");
        self.dispatcher.set_name(name);
        Ok(())
    }

    /// Bind the UDP endpoint. Returns the bound address.
    pub async fn open_port(&mut self, port: u16) -> Result<SocketAddr, NodeError> {
        if let Some(addr) = self.local_addr() {
            return Err(NodeError::PortAlreadyOpen(addr));
        }
        if !self.config.port_range.contains(&port) {
            return Err(NodeError::PortOutOfRange {
                port,
                range: self.config.port_range.clone(),
            });
        }
        let transport = UdpTransport::bind(self.config.bind_ip, port)
            .await
            .map_err(|source| NodeError::Bind { port, source })?;
        let addr = transport
            .local_addr()
            .map_err(|source| NodeError::Bind { port, source })?;
        info!(addr = %addr, "endpoint open");
        self.transport = Some(transport);
        Ok(addr)
    }

    /// Handle incoming datagrams for `delay`, or forever when `delay` is zero.
    pub async fn handle_incoming_messages(&mut self, delay: Duration) -> Result<(), NodeError> {
        let deadline = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        self.pump(deadline, |_| false).await?;
        Ok(())
    }

    /// Receive and dispatch until `done` holds or `deadline` passes.
    ///
    /// Returns whether `done` held.
    async fn pump(
        &mut self,
        deadline: Option<Instant>,
        mut done: impl FnMut(&Dispatcher) -> bool,
    ) -> Result<bool, NodeError> {
        let transport = self.transport.as_mut().ok_or(NodeError::PortNotOpen)?;
        loop {
            if done(&self.dispatcher) {
                return Ok(true);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    remaining.min(self.config.poll_interval)
                }
                None => self.config.poll_interval,
            };

            let Some((text, from)) = transport.recv_timeout(slice).await else {
                continue;
            };
            let replies = self.dispatcher.handle_datagram(&text, from, &mut self.tables);
            for reply in replies {
                transport.send_to(&reply.text, reply.to).await;
            }
        }
    }

    async fn pump_for(
        &mut self,
        budget: Duration,
        done: impl FnMut(&Dispatcher) -> bool,
    ) -> Result<bool, NodeError> {
        self.pump(Some(Instant::now() + budget), done).await
    }

    /// Ask whoever listens on `addr` for its name. The `H` reply adds it to
    /// the routing table the next time messages are handled.
    pub async fn greet(&mut self, addr: SocketAddr) -> Result<(), NodeError> {
        let transport = self.transport.as_ref().ok_or(NodeError::PortNotOpen)?;
        let tx = self.dispatcher.fresh_tx();
        debug!(tx = %tx, to = %addr, "greeting");
        transport.send_to(&messages::name_request(tx), addr).await;
        Ok(())
    }

    /// Whether `name` is in the routing table. No network probe is made.
    pub fn is_active(&self, name: &str) -> bool {
        NodeName::parse(name)
            .map(|name| self.tables.routing.contains(&name))
            .unwrap_or(false)
    }

    /// Address recorded for a known peer.
    pub fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        let (_, addr) = self.tables.routing.get_str(name)?;
        Some(addr)
    }

    pub fn push_relay(&mut self, name: &str) -> Result<(), NodeError> {
        let name = NodeName::parse(name)?;
        debug!(relay = %name, depth = self.relays.len() + 1, "relay pushed");
        self.relays.push(name);
        Ok(())
    }

    /// Remove the most recently pushed relay. No effect when there is none.
    pub fn pop_relay(&mut self) -> Option<NodeName> {
        let popped = self.relays.pop();
        match &popped {
            Some(name) => debug!(relay = %name, depth = self.relays.len(), "relay popped"),
            None => debug!("relay chain already empty"),
        }
        popped
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool, NodeError> {
        require_key(key)?;
        let outcome = self.lookup(key, LookupMode::Exists).await?;
        Ok(outcome != LookupOutcome::Missing)
    }

    pub async fn read(&mut self, key: &str) -> Result<Option<String>, NodeError> {
        require_key(key)?;
        match self.lookup(key, LookupMode::Read).await? {
            LookupOutcome::Value(value) => Ok(Some(value)),
            LookupOutcome::Present | LookupOutcome::Missing => Ok(None),
        }
    }

    /// Store `value` under `key` locally.
    ///
    /// A node-name key whose value is a socket address also updates the
    /// routing table, the same as a received write request.
    pub fn write(&mut self, key: &str, value: &str) -> Result<bool, NodeError> {
        require_key(key)?;
        require_value(value)?;
        let replaced = self.tables.store.put(key, value);
        trace!(key = %key, replaced, "local write");
        if is_node_key(key) {
            if let (Ok(name), Ok(addr)) = (NodeName::parse(key), value.parse::<SocketAddr>()) {
                self.tables.routing.observe(name, addr);
            }
        }
        Ok(true)
    }

    /// Replace `key` with `new` if it holds `expected`, or create it if absent.
    pub fn cas(&mut self, key: &str, expected: &str, new: &str) -> Result<bool, NodeError> {
        require_key(key)?;
        require_value(expected)?;
        require_value(new)?;
        let outcome = self.tables.store.compare_and_swap(key, expected, new);
        trace!(key = %key, outcome = ?outcome, "local compare-and-swap");
        Ok(outcome.succeeded())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    async fn lookup(&mut self, key: &str, mode: LookupMode) -> Result<LookupOutcome, NodeError> {
        if let Some(value) = self.tables.store.get(key) {
            return Ok(LookupOutcome::Value(value.to_string()));
        }
        if self.transport.is_none() {
            return Err(NodeError::PortNotOpen);
        }

        let target = HashId::of(key);
        let mut seeds = self.tables.routing.names();
        if seeds.is_empty() {
            if let Some(bootstrap) = &self.config.bootstrap {
                debug!(peer = %bootstrap, "seeding lookup from bootstrap peer");
                self.tables
                    .routing
                    .observe(bootstrap.name.clone(), bootstrap.addr);
                seeds.push(bootstrap.name.clone());
            }
        }
        seeds.sort();

        let mut lookup = Lookup::new(target, self.dispatcher.name().cloned(), seeds);
        debug!(key = %key, mode = ?mode, seeds = lookup.pending(), "lookup started");

        while let Some((peer, addr)) = lookup.next_peer(&self.tables.routing) {
            self.dispatcher.pending_mut().reset_key_slots();
            let tx = self.dispatcher.fresh_tx();
            let request = match mode {
                LookupMode::Exists => messages::exists_request(tx, key),
                LookupMode::Read => messages::read_request(tx, key),
            };
            self.send_request(&peer, addr, request).await;

            let answered = self
                .pump_for(self.config.query_timeout, |d| match mode {
                    LookupMode::Exists => d.pending().existence,
                    LookupMode::Read => d.pending().read_value.is_some(),
                })
                .await?;
            if answered {
                debug!(key = %key, peer = %peer, visited = lookup.visited(), "lookup answered");
                return Ok(match mode {
                    LookupMode::Exists => LookupOutcome::Present,
                    LookupMode::Read => match self.dispatcher.pending_mut().read_value.take() {
                        Some(value) => LookupOutcome::Value(value),
                        None => LookupOutcome::Missing,
                    },
                });
            }

            let nearest_tx = self.dispatcher.fresh_tx();
            self.send_request(&peer, addr, messages::nearest_request(nearest_tx, lookup.target()))
                .await;
            self.pump_for(self.config.query_timeout, |d| d.pending().has_nearest(&nearest_tx))
                .await?;

            let Some(raw) = self.dispatcher.pending_mut().take_nearest(&nearest_tx) else {
                trace!(peer = %peer, "no nearest-node reply");
                continue;
            };
            let pairs = messages::parse_node_list(&raw);
            let queued = lookup.absorb(&pairs, &mut self.tables.routing);
            trace!(peer = %peer, returned = pairs.len(), queued, "absorbed nearest-node reply");
        }

        debug!(key = %key, visited = lookup.visited(), "lookup exhausted");
        Ok(LookupOutcome::Missing)
    }

    /// Send a request to `peer`, through the relay chain when it is non-empty.
    async fn send_request(&self, peer: &NodeName, addr: SocketAddr, request: String) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };

        let dispatcher = &self.dispatcher;
        let mut used: HashSet<TxId> = messages::peek_tx(&request).into_iter().collect();
        let wrapped = self.relays.wrap(peer, &request, || loop {
            let tx = dispatcher.fresh_tx();
            if used.insert(tx) {
                break tx;
            }
        });

        match wrapped {
            None => {
                transport.send_to(&request, addr).await;
            }
            Some((first_hop, envelope)) => match self.tables.routing.get(&first_hop) {
                Some(relay_addr) => {
                    trace!(peer = %peer, relay = %first_hop, "sending through relay chain");
                    transport.send_to(&envelope, relay_addr).await;
                }
                None => {
                    debug!(peer = %peer, relay = %first_hop, "first relay unknown, request dropped");
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn name(&self) -> Option<&NodeName> {
        self.dispatcher.name()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.local_addr().ok())
    }

    pub fn known_node_names(&self) -> Vec<NodeName> {
        let mut names = self.tables.routing.names();
        names.sort();
        names
    }

    pub fn relay_depth(&self) -> usize {
        self.relays.len()
    }

    /// Text of every informational message received, oldest first.
    pub fn info_messages(&self) -> Vec<String> {
        self.dispatcher.info_messages().map(str::to_string).collect()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
