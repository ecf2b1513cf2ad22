//! # crnode - Peer-to-Peer Key-Value Node
//!
//! crnode is one participant in a peer-to-peer key-value network that speaks a
//! small text protocol over UDP:
//!
//! - **Identity**: `N:`-prefixed node names, SHA-256 hash identifiers
//! - **Routing**: peers ranked by shared-prefix distance to a key's hash
//! - **Storage**: a local key-value store with compare-and-swap
//! - **Lookup**: iterative search that walks toward nodes nearer a key
//! - **Relaying**: requests tunnelled through a stack of relay nodes
//!
//! ## Architecture
//!
//! A node is a single owner of all of its state. There is no background task:
//! datagrams are received and dispatched only while a [`Node`] method pumps
//! the socket, so every table is mutated from one logical thread.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API, configuration, receive pump, iterative lookup |
//! | `identity` | Node names, hash identifiers, distance metric |
//! | `messages` | Text wire format: framing, transaction ids, message kinds |
//! | `dht` | Routing table, local store, lookup work queue |
//! | `relay` | Relay chain envelopes and reply return routes |
//! | `rpc` | Transaction cache and per-kind message dispatch |
//! | `transport` | UDP endpoint |

mod dht;
mod identity;
mod messages;
mod node;
mod relay;
mod rpc;
mod transport;

pub use identity::{HashId, NameError, NodeName, NODE_NAME_PREFIX};
pub use node::{
    BootstrapPeer, Node, NodeConfig, NodeError, DEFAULT_BOOTSTRAP_ADDR, DEFAULT_BOOTSTRAP_NAME,
    DEFAULT_POLL_INTERVAL, DEFAULT_PORT_RANGE, DEFAULT_QUERY_TIMEOUT,
};
