//! # Protocol Dispatcher
//!
//! Turns one received datagram into state changes and at most one reply.
//!
//! ## Pipeline
//!
//! 1. Fault injection: with probability `drop_rate` the datagram is discarded
//!    before anything else happens.
//! 2. Decode `<txid> <kind> <body>`. Malformed lines are dropped.
//! 3. Deduplicate on the transaction id via [`TransactionCache`].
//! 4. Replies whose transaction id has a relay return route are passed back
//!    toward the origin instead of being handled here.
//! 5. Run the handler for the kind. Relay layers naming this node are stripped
//!    and the inner message re-enters step 2.
//!
//! Handlers never touch the network; they return [`Outbound`] datagrams for
//! the caller to send.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::dht::Tables;
use crate::identity::{is_node_key, HashId, NodeName};
use crate::messages::{self, Message, MessageKind, TxId};
use crate::relay::{innermost_tx, ReturnRoutes};

/// Default number of transaction ids remembered for deduplication.
pub const DEFAULT_TRANSACTION_CACHE_CAPACITY: usize = 1_000;

/// Maximum unconsumed nearest-node replies kept.
const MAX_PENDING_NEAREST: usize = 256;

/// Maximum informational messages retained.
const MAX_INFO_MESSAGES: usize = 1_000;

/// Attempts at drawing a transaction id that is not already cached.
const FRESH_TX_ATTEMPTS: usize = 32;

// ============================================================================
// Transaction Cache
// ============================================================================

/// Recency-ordered set of recently seen transaction ids.
pub struct TransactionCache {
    seen: LruCache<TxId, ()>,
}

impl TransactionCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(cap),
        }
    }

    /// Returns `true` if `tx` was already present (refreshing its recency).
    /// Otherwise records it and returns `false`.
    pub fn record_and_check(&mut self, tx: TxId) -> bool {
        if self.seen.get(&tx).is_some() {
            return true;
        }
        self.seen.put(tx, ());
        false
    }

    /// Membership test that does not touch recency.
    pub fn contains(&self, tx: &TxId) -> bool {
        self.seen.contains(tx)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for TransactionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_CACHE_CAPACITY)
    }
}

// ============================================================================
// Pending Responses
// ============================================================================

/// Reply slots polled by the lookup engine.
///
/// `existence` and `read_value` are single slots shared by every query, so
/// only one key lookup may be in flight at a time. Nearest-node replies are
/// keyed by transaction id.
pub struct PendingResponses {
    pub existence: bool,
    pub read_value: Option<String>,
    nearest: LruCache<TxId, String>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self {
            existence: false,
            read_value: None,
            nearest: LruCache::new(
                NonZeroUsize::new(MAX_PENDING_NEAREST).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Clear the key-level slots before issuing a new query.
    pub fn reset_key_slots(&mut self) {
        self.existence = false;
        self.read_value = None;
    }

    pub fn has_nearest(&self, tx: &TxId) -> bool {
        self.nearest.contains(tx)
    }

    pub fn take_nearest(&mut self, tx: &TxId) -> Option<String> {
        self.nearest.pop(tx)
    }
}

impl Default for PendingResponses {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A datagram to send as a result of handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub text: String,
}

impl Outbound {
    fn new(to: SocketAddr, text: String) -> Self {
        Self { to, text }
    }
}

pub struct Dispatcher {
    name: Option<NodeName>,
    seen: TransactionCache,
    return_routes: ReturnRoutes,
    pending: PendingResponses,
    info: VecDeque<String>,
    drop_rate: f64,
    nearest_count: usize,
}

impl Dispatcher {
    pub fn new(cache_capacity: usize, drop_rate: f64, nearest_count: usize) -> Self {
        Self {
            name: None,
            seen: TransactionCache::new(cache_capacity),
            return_routes: ReturnRoutes::new(),
            pending: PendingResponses::new(),
            info: VecDeque::new(),
            drop_rate,
            nearest_count,
        }
    }

    pub fn set_name(&mut self, name: NodeName) {
        self.name = Some(name);
    }

    pub fn name(&self) -> Option<&NodeName> {
        self.name.as_ref()
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingResponses {
        &mut self.pending
    }

    pub fn info_messages(&self) -> impl Iterator<Item = &str> {
        self.info.iter().map(String::as_str)
    }

    /// Draw a transaction id, avoiding ids still held in the dedup cache so
    /// that the reply is not mistaken for a duplicate.
    pub fn fresh_tx(&self) -> TxId {
        let mut rng = rand::thread_rng();
        let mut candidate = TxId::random(&mut rng);
        for _ in 0..FRESH_TX_ATTEMPTS {
            if !self.seen.contains(&candidate) && !self.pending.has_nearest(&candidate) {
                break;
            }
            candidate = TxId::random(&mut rng);
        }
        candidate
    }

    fn should_drop(&self) -> bool {
        let p = self.drop_rate;
        if !(p > 0.0) {
            return false;
        }
        rand::thread_rng().gen_bool(p.min(1.0))
    }

    /// Handle one received datagram, returning the datagrams to send.
    pub fn handle_datagram(
        &mut self,
        text: &str,
        from: SocketAddr,
        tables: &mut Tables,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if self.should_drop() {
            trace!(from = %from, "fault injection dropped datagram");
            return out;
        }
        self.dispatch(text, from, tables, &mut out);
        out
    }

    fn dispatch(&mut self, text: &str, from: SocketAddr, tables: &mut Tables, out: &mut Vec<Outbound>) {
        let mut current = text;
        loop {
            let msg = match Message::parse(current) {
                Ok(msg) => msg,
                Err(err) => {
                    trace!(from = %from, error = ?err, "dropping malformed datagram");
                    return;
                }
            };

            if self.seen.record_and_check(msg.tx) {
                trace!(tx = %msg.tx, kind = %msg.kind, from = %from, "dropping duplicate transaction");
                return;
            }

            if msg.kind.is_response() {
                if let Some(origin) = self.return_routes.take(&msg.tx) {
                    debug!(tx = %msg.tx, kind = %msg.kind, to = %origin, "passing relayed reply back");
                    out.push(Outbound::new(origin, current.to_string()));
                    return;
                }
            }

            trace!(tx = %msg.tx, kind = %msg.kind, from = %from, "handling message");

            if msg.kind == MessageKind::Relay {
                match self.handle_relay(&msg, current, from, tables) {
                    RelayStep::Unwrapped(inner) => {
                        current = inner;
                        continue;
                    }
                    RelayStep::Forward(outbound) => out.push(outbound),
                    RelayStep::Dropped => {}
                }
                return;
            }

            if let Some(reply) = self.handle_message(&msg, from, tables) {
                out.push(reply);
            }
            return;
        }
    }

    fn handle_relay<'t>(
        &mut self,
        msg: &Message<'t>,
        text: &'t str,
        from: SocketAddr,
        tables: &Tables,
    ) -> RelayStep<'t> {
        let Some((hop, inner)) = messages::parse_relay(msg.body) else {
            debug!(tx = %msg.tx, "dropping relay envelope without next hop");
            return RelayStep::Dropped;
        };

        if self.name.as_ref().is_some_and(|me| me.as_str() == hop) {
            trace!(tx = %msg.tx, "unwrapping relay layer addressed to us");
            return RelayStep::Unwrapped(inner);
        }

        let Some((next, addr)) = tables.routing.get_str(hop) else {
            debug!(tx = %msg.tx, hop = %hop, "dropping relay envelope for unknown hop");
            return RelayStep::Dropped;
        };

        if let Some(request_tx) = innermost_tx(inner) {
            self.return_routes.record(request_tx, from);
        }
        debug!(tx = %msg.tx, hop = %next, to = %addr, "forwarding relay envelope");
        RelayStep::Forward(Outbound::new(addr, text.to_string()))
    }

    fn handle_message(
        &mut self,
        msg: &Message<'_>,
        from: SocketAddr,
        tables: &mut Tables,
    ) -> Option<Outbound> {
        let tx = msg.tx;
        match msg.kind {
            MessageKind::NameRequest => {
                let Some(name) = &self.name else {
                    debug!(tx = %tx, "ignoring name request before node name is set");
                    return None;
                };
                Some(Outbound::new(from, messages::name_response(tx, name)))
            }
            MessageKind::NameResponse => {
                let raw = messages::unwrap(msg.body)?;
                match NodeName::parse(raw) {
                    Ok(name) => {
                        if tables.routing.observe(name.clone(), from) {
                            debug!(peer = %name, addr = %from, "learned peer from name response");
                        }
                    }
                    Err(err) => debug!(tx = %tx, error = %err, "ignoring name response"),
                }
                None
            }
            MessageKind::NearestRequest => {
                let target = match HashId::from_hex(msg.body.trim()) {
                    Ok(target) => target,
                    Err(err) => {
                        debug!(tx = %tx, error = %err, "ignoring nearest request with bad hash");
                        return None;
                    }
                };
                let nearest = tables.routing.closest(&target, self.nearest_count);
                trace!(tx = %tx, returned = nearest.len(), "answering nearest request");
                Some(Outbound::new(from, messages::nearest_response(tx, &nearest)))
            }
            MessageKind::NearestResponse => {
                self.pending.nearest.put(tx, msg.body.to_string());
                None
            }
            MessageKind::Information => {
                let text = messages::unwrap(msg.body)?;
                info!(from = %from, text = %text, "information message");
                if self.info.len() >= MAX_INFO_MESSAGES {
                    self.info.pop_front();
                }
                self.info.push_back(text.to_string());
                None
            }
            MessageKind::Relay => None,
            MessageKind::ExistsRequest => {
                let exists = messages::unwrap(msg.body)
                    .map(|key| tables.store.contains(key))
                    .unwrap_or(false);
                Some(Outbound::new(from, messages::exists_response(tx, exists)))
            }
            MessageKind::ExistsResponse => {
                if msg.body.trim() == "Y" {
                    self.pending.existence = true;
                }
                None
            }
            MessageKind::ReadRequest => {
                let key = messages::unwrap(msg.body)?;
                let value = tables.store.get(key);
                Some(Outbound::new(from, messages::read_response(tx, value)))
            }
            MessageKind::ReadResponse => {
                let value = match msg.body.split_once(' ') {
                    Some(("Y", rest)) => messages::unwrap(rest),
                    _ => None,
                };
                if let Some(value) = value {
                    self.pending.read_value = Some(value.to_string());
                }
                None
            }
            MessageKind::WriteRequest => {
                let Some((key, value)) = messages::parse_key_value(msg.body) else {
                    debug!(tx = %tx, "ignoring malformed write request");
                    return None;
                };
                let replaced = tables.store.put(key, value);
                if is_node_key(key) {
                    match (NodeName::parse(key), value.parse::<SocketAddr>()) {
                        (Ok(name), Ok(addr)) => {
                            tables.routing.observe(name, addr);
                        }
                        _ => debug!(key = %key, value = %value, "node record with unusable address"),
                    }
                }
                Some(Outbound::new(from, messages::write_response(tx, replaced)))
            }
            MessageKind::WriteResponse => {
                trace!(tx = %tx, code = %msg.body.trim(), "write acknowledged");
                None
            }
        }
    }
}

enum RelayStep<'t> {
    Unwrapped(&'t str),
    Forward(Outbound),
    Dropped,
}
