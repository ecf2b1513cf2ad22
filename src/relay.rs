//! # Relay Chain and Return Routes
//!
//! Outgoing requests can be tunnelled through a chain of relays. The chain is
//! a stack: the base entry is the first hop, the top entry is the hop nearest
//! the final destination.
//!
//! ## Envelope Layout
//!
//! With relays `[A, B]` (A pushed first) and a request `M` for node `D`:
//!
//! ```text
//! t1 V <A> t2 V <B> t3 V <D> M      sent to A's address
//! ```
//!
//! Each node strips the layer naming itself and handles the remainder as if it
//! had arrived directly. A layer naming some other known peer is forwarded to
//! that peer unchanged.
//!
//! ## Return Routes
//!
//! When a node forwards an envelope it remembers the transaction id of the
//! innermost request together with the address the envelope came from. The
//! reply from the destination carries that transaction id, so each relay can
//! pass it one hop back toward the origin.

use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::trace;

use crate::identity::NodeName;
use crate::messages::{self, Message, MessageKind, TxId};

/// Maximum remembered return routes.
/// Bounded so relay traffic that never receives a reply cannot grow state.
pub const MAX_RETURN_ROUTES: usize = 1_000;

/// Stack of relays used for every outgoing request while non-empty.
#[derive(Debug, Default, Clone)]
pub struct RelayChain {
    stack: Vec<NodeName>,
}

impl RelayChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, relay: NodeName) {
        self.stack.push(relay);
    }

    /// Remove the top relay. No effect on an empty chain.
    pub fn pop(&mut self) -> Option<NodeName> {
        self.stack.pop()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Wrap `message` for `destination` through every relay in the chain.
    ///
    /// Returns `None` when the chain is empty and the message should be sent
    /// directly. Each layer gets its own transaction id from `next_tx`.
    pub fn wrap(
        &self,
        destination: &NodeName,
        message: &str,
        mut next_tx: impl FnMut() -> TxId,
    ) -> Option<(NodeName, String)> {
        let first_hop = self.stack.first()?.clone();
        let mut envelope = messages::relay(next_tx(), destination, message);
        for relay in self.stack.iter().rev() {
            envelope = messages::relay(next_tx(), relay, &envelope);
        }
        Some((first_hop, envelope))
    }
}

/// Transaction id of the request buried inside any number of relay layers.
pub fn innermost_tx(text: &str) -> Option<TxId> {
    let mut current = text;
    loop {
        let msg = Message::parse(current).ok()?;
        if msg.kind != MessageKind::Relay {
            return Some(msg.tx);
        }
        let (_, inner) = messages::parse_relay(msg.body)?;
        current = inner;
    }
}

/// Where to send replies for requests this node relayed onward.
pub struct ReturnRoutes {
    routes: LruCache<TxId, SocketAddr>,
}

impl ReturnRoutes {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RETURN_ROUTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            routes: LruCache::new(cap),
        }
    }

    pub fn record(&mut self, tx: TxId, reply_to: SocketAddr) {
        trace!(tx = %tx, reply_to = %reply_to, "recording relay return route");
        self.routes.put(tx, reply_to);
    }

    /// Remove and return the route for `tx`.
    pub fn take(&mut self, tx: &TxId) -> Option<SocketAddr> {
        self.routes.pop(tx)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for ReturnRoutes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::parse(s).unwrap()
    }

    fn counter() -> impl FnMut() -> TxId {
        let mut n = 0u8;
        move || {
            n += 1;
            TxId::parse(&format!("T{}", n)).unwrap()
        }
    }

    /// Strip one relay layer, returning (named hop, inner message).
    fn strip(envelope: &str) -> (String, String) {
        let msg = Message::parse(envelope).unwrap();
        assert_eq!(msg.kind, MessageKind::Relay);
        let (hop, inner) = messages::parse_relay(msg.body).unwrap();
        (hop.to_string(), inner.to_string())
    }

    #[test]
    fn empty_chain_sends_directly() {
        let chain = RelayChain::new();
        assert!(chain.wrap(&name("N:d"), "AB G", counter()).is_none());
    }

    #[test]
    fn base_relay_is_outermost() {
        let mut chain = RelayChain::new();
        chain.push(name("N:a"));
        chain.push(name("N:b"));

        let (first_hop, envelope) = chain.wrap(&name("N:d"), "AB R 0 k ", counter()).unwrap();
        assert_eq!(first_hop, name("N:a"));

        let (hop, inner) = strip(&envelope);
        assert_eq!(hop, "N:a");

        let (hop, inner) = strip(&inner);
        assert_eq!(hop, "N:b");

        let (hop, inner) = strip(&inner);
        assert_eq!(hop, "N:d");
        assert_eq!(inner, "AB R 0 k ");
    }

    #[test]
    fn each_layer_gets_its_own_transaction() {
        let mut chain = RelayChain::new();
        chain.push(name("N:a"));
        chain.push(name("N:b"));

        let (_, envelope) = chain.wrap(&name("N:d"), "AB G", counter()).unwrap();
        assert_eq!(envelope, "T3 V 0 N:a T2 V 0 N:b T1 V 0 N:d AB G");
    }

    #[test]
    fn pop_restores_direct_sending() {
        let mut chain = RelayChain::new();
        chain.push(name("N:a"));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.pop(), Some(name("N:a")));
        assert_eq!(chain.pop(), None);
        assert!(chain.is_empty());
        assert!(chain.wrap(&name("N:d"), "AB G", counter()).is_none());
    }

    #[test]
    fn innermost_tx_digs_through_layers() {
        let mut chain = RelayChain::new();
        chain.push(name("N:a"));
        chain.push(name("N:b"));
        let (_, envelope) = chain.wrap(&name("N:d"), "ZZ E 0 k ", counter()).unwrap();

        assert_eq!(innermost_tx(&envelope), TxId::parse("ZZ"));
        assert_eq!(innermost_tx("QQ G"), TxId::parse("QQ"));
        assert_eq!(innermost_tx("QQ V garbage"), None);
    }

    #[test]
    fn return_routes_are_single_use() {
        let mut routes = ReturnRoutes::new();
        let tx = TxId::parse("AB").unwrap();
        let addr: SocketAddr = "127.0.0.1:20110".parse().unwrap();

        routes.record(tx, addr);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes.take(&tx), Some(addr));
        assert_eq!(routes.take(&tx), None);
        assert!(routes.is_empty());
    }

    #[test]
    fn return_routes_are_bounded() {
        let mut routes = ReturnRoutes::with_capacity(2);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        for token in ["AA", "BB", "CC"] {
            routes.record(TxId::parse(token).unwrap(), addr);
        }
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.take(&TxId::parse("AA").unwrap()), None);
    }
}
