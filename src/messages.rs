//! # Wire Protocol Messages
//!
//! Every datagram is a UTF-8 line of space-delimited tokens:
//!
//! ```text
//! <txid> <kind> <payload...>
//! ```
//!
//! The transaction id is two non-space characters and the kind is a single
//! character. Free-form strings inside the payload are framed with
//! [`wrap`], which prefixes the number of spaces the string contains and
//! terminates it with a trailing space, so that a reader can find where the
//! string ends even if it embeds spaces itself.
//!
//! ## Message Kinds
//!
//! | Kind | Direction | Payload |
//! |------|-----------|---------|
//! | `G` | request | none |
//! | `H` | response | wrapped node name |
//! | `N` | request | hex hash id |
//! | `O` | response | repeated wrapped (name, address) pairs |
//! | `I` | one-way | wrapped text |
//! | `V` | relay | wrapped next hop, then an inner message |
//! | `E` | request | wrapped key |
//! | `F` | response | `Y` or `N` |
//! | `R` | request | wrapped key |
//! | `S` | response | `Y` and a wrapped value, or `N` |
//! | `W` | request | wrapped key, wrapped value |
//! | `X` | response | `A` (added) or `R` (replaced) |

use std::fmt;
use std::net::SocketAddr;

use rand::Rng;

use crate::identity::{HashId, NodeName};

/// Symbols used when generating transaction ids: printable ASCII without
/// the space. Two of them give 8836 ids, well above the dedup cache capacity.
pub const TX_ALPHABET: std::ops::RangeInclusive<u8> = b'!'..=b'~';

/// Frame a string so it can be embedded in a space-delimited payload.
///
/// Produces `"<spaces> <s> "`.
pub fn wrap(s: &str) -> String {
    let spaces = s.chars().filter(|c| *c == ' ').count();
    format!("{} {} ", spaces, s)
}

/// Strip the framing added by [`wrap`] from a trailing field.
///
/// Takes everything between the first space and the final character. The
/// space count is not re-checked, so callers must treat `None` (and odd
/// results on malformed input) as a bad message.
pub fn unwrap(s: &str) -> Option<&str> {
    let first_space = s.find(' ')?;
    if s.len() <= first_space + 1 {
        return None;
    }
    let (last_char_start, _) = s.char_indices().next_back()?;
    Some(&s[first_space + 1..last_char_start])
}

/// Read one wrapped field from the front of `input`, honouring its space
/// count, and return it with the unread remainder.
pub fn read_field(input: &str) -> Option<(&str, &str)> {
    let (count, rest) = input.split_once(' ')?;
    let spaces: usize = count.parse().ok()?;
    let mut seen = 0;
    for (idx, ch) in rest.char_indices() {
        if ch == ' ' {
            if seen == spaces {
                return Some((&rest[..idx], &rest[idx + 1..]));
            }
            seen += 1;
        }
    }
    None
}

/// Two-symbol transaction identifier pairing a request with its reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId([u8; 2]);

impl TxId {
    /// Parse a transaction id token. Exactly two bytes, neither a space.
    pub fn parse(token: &str) -> Option<Self> {
        match token.as_bytes() {
            [a, b] if *a != b' ' && *b != b' ' => Some(Self([*a, *b])),
            _ => None,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self([rng.gen_range(TX_ALPHABET), rng.gen_range(TX_ALPHABET)])
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always built from a `&str` token or ASCII symbols.
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("??"))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NameRequest,
    NameResponse,
    NearestRequest,
    NearestResponse,
    Information,
    Relay,
    ExistsRequest,
    ExistsResponse,
    ReadRequest,
    ReadResponse,
    WriteRequest,
    WriteResponse,
}

impl MessageKind {
    pub fn from_token(token: &str) -> Option<Self> {
        let kind = match token {
            "G" => Self::NameRequest,
            "H" => Self::NameResponse,
            "N" => Self::NearestRequest,
            "O" => Self::NearestResponse,
            "I" => Self::Information,
            "V" => Self::Relay,
            "E" => Self::ExistsRequest,
            "F" => Self::ExistsResponse,
            "R" => Self::ReadRequest,
            "S" => Self::ReadResponse,
            "W" => Self::WriteRequest,
            "X" => Self::WriteResponse,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_char(self) -> char {
        match self {
            Self::NameRequest => 'G',
            Self::NameResponse => 'H',
            Self::NearestRequest => 'N',
            Self::NearestResponse => 'O',
            Self::Information => 'I',
            Self::Relay => 'V',
            Self::ExistsRequest => 'E',
            Self::ExistsResponse => 'F',
            Self::ReadRequest => 'R',
            Self::ReadResponse => 'S',
            Self::WriteRequest => 'W',
            Self::WriteResponse => 'X',
        }
    }

    /// Replies to a request this node (or a node it relays for) sent.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::NameResponse
                | Self::NearestResponse
                | Self::ExistsResponse
                | Self::ReadResponse
                | Self::WriteResponse
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A decoded datagram. `body` borrows the payload after the kind token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub tx: TxId,
    pub kind: MessageKind,
    pub body: &'a str,
}

/// Why a line could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than two tokens.
    TooShort,
    BadTransactionId,
    UnknownKind,
}

impl Message<'_> {
    pub fn parse(text: &str) -> Result<Message<'_>, ParseError> {
        let text = text.trim_start().trim_end_matches(['\r', '\n']);
        let (tx_token, rest) = text.split_once(' ').ok_or(ParseError::TooShort)?;
        let (kind_token, body) = match rest.split_once(' ') {
            Some((kind, body)) => (kind, body),
            None => (rest, ""),
        };
        if kind_token.is_empty() {
            return Err(ParseError::TooShort);
        }
        let tx = TxId::parse(tx_token).ok_or(ParseError::BadTransactionId)?;
        let kind = MessageKind::from_token(kind_token).ok_or(ParseError::UnknownKind)?;
        Ok(Message { tx, kind, body })
    }
}

/// Peek at the transaction id of a line without fully decoding it.
pub fn peek_tx(text: &str) -> Option<TxId> {
    let text = text.trim_start();
    let token = text.split(' ').next()?;
    TxId::parse(token)
}

// ============================================================================
// Encoders
// ============================================================================

fn header(tx: TxId, kind: MessageKind) -> String {
    format!("{} {}", tx, kind)
}

pub fn name_request(tx: TxId) -> String {
    header(tx, MessageKind::NameRequest)
}

pub fn name_response(tx: TxId, name: &NodeName) -> String {
    format!("{} {}", header(tx, MessageKind::NameResponse), wrap(name.as_str()))
}

pub fn nearest_request(tx: TxId, target: &HashId) -> String {
    format!("{} {}", header(tx, MessageKind::NearestRequest), target.to_hex())
}

pub fn nearest_response(tx: TxId, nodes: &[(NodeName, SocketAddr)]) -> String {
    let mut out = format!("{} ", header(tx, MessageKind::NearestResponse));
    for (name, addr) in nodes {
        out.push_str(&wrap(name.as_str()));
        out.push_str(&wrap(&addr.to_string()));
    }
    out
}

pub fn relay(tx: TxId, next_hop: &NodeName, inner: &str) -> String {
    format!(
        "{} {}{}",
        header(tx, MessageKind::Relay),
        wrap(next_hop.as_str()),
        inner
    )
}

pub fn exists_request(tx: TxId, key: &str) -> String {
    format!("{} {}", header(tx, MessageKind::ExistsRequest), wrap(key))
}

pub fn exists_response(tx: TxId, exists: bool) -> String {
    let flag = if exists { "Y" } else { "N" };
    format!("{} {}", header(tx, MessageKind::ExistsResponse), flag)
}

pub fn read_request(tx: TxId, key: &str) -> String {
    format!("{} {}", header(tx, MessageKind::ReadRequest), wrap(key))
}

pub fn read_response(tx: TxId, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{} Y {}", header(tx, MessageKind::ReadResponse), wrap(value)),
        None => format!("{} N ", header(tx, MessageKind::ReadResponse)),
    }
}

pub fn write_response(tx: TxId, replaced: bool) -> String {
    let code = if replaced { "R" } else { "A" };
    format!("{} {}", header(tx, MessageKind::WriteResponse), code)
}

// ============================================================================
// Payload decoders
// ============================================================================

/// Split an `O` payload into raw (name, address) string pairs.
///
/// Stops at the first field that cannot be read; pairs before it are kept.
pub fn parse_node_list(body: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let Some((name, after_name)) = read_field(rest) else {
            break;
        };
        let Some((addr, after_addr)) = read_field(after_name) else {
            break;
        };
        out.push((name, addr));
        rest = after_addr.trim_start();
    }
    out
}

/// Split a `W` payload into (key, value).
pub fn parse_key_value(body: &str) -> Option<(&str, &str)> {
    let (key, rest) = read_field(body)?;
    let (value, _) = read_field(rest)?;
    Some((key, value))
}

/// Split a `V` payload into (next hop, inner message).
pub fn parse_relay(body: &str) -> Option<(&str, &str)> {
    read_field(body)
}
