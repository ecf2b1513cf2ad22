//! # Node Names and Hash Identifiers
//!
//! This module defines the identity types shared by every other component:
//!
//! - [`NodeName`]: the validated, `N:`-prefixed name of a peer
//! - [`HashId`]: the 32-byte SHA-256 digest of a name or key
//!
//! ## Naming Model
//!
//! Node names and ordinary keys live in the same namespace. A key that starts
//! with [`NODE_NAME_PREFIX`] is a node name and its stored value is the node's
//! `host:port` address; every other key is opaque data.
//!
//! ## Distance
//!
//! Distance between two hash identifiers is `256 - shared_prefix_bits`, i.e.
//! the number of bit positions remaining once the common leading bits are
//! removed. Identical digests are at distance 0, digests differing in the
//! very first bit are at distance 256. Sorting ascending by distance yields
//! the peers with the smallest XOR distance first.

use std::cmp::Ordering;
use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix that marks a key as a node name.
pub const NODE_NAME_PREFIX: &str = "N:";

/// Width of a hash identifier in bits.
pub const HASH_ID_BITS: u32 = 256;

/// Rejected node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameError {
    pub name: String,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid node name {:?}: must be non-empty and start with {:?}",
            self.name, NODE_NAME_PREFIX
        )
    }
}

impl std::error::Error for NameError {}

/// Name of a node on the network, always carrying the `N:` prefix.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeName(String);

impl NodeName {
    pub fn parse(name: &str) -> Result<Self, NameError> {
        if name.trim().is_empty() || !is_node_key(name) {
            return Err(NameError {
                name: name.to_string(),
            });
        }
        Ok(Self(name.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash_id(&self) -> HashId {
        HashId::of(&self.0)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({})", self.0)
    }
}

impl std::str::FromStr for NodeName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Whether a store key names a node rather than ordinary data.
#[inline]
pub fn is_node_key(key: &str) -> bool {
    key.starts_with(NODE_NAME_PREFIX)
}

/// SHA-256 digest of a name or key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashId([u8; 32]);

impl HashId {
    pub fn of(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    #[inline]
    pub fn xor_distance(&self, other: &HashId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other` (256 when equal).
    pub fn shared_prefix_bits(&self, other: &HashId) -> u32 {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx as u32 * 8 + byte.leading_zeros();
            }
        }
        HASH_ID_BITS
    }

    /// Prefix distance to `other`, in `0..=256`.
    #[inline]
    pub fn distance(&self, other: &HashId) -> u32 {
        HASH_ID_BITS - self.shared_prefix_bits(other)
    }
}

impl fmt::Debug for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Orders two candidates by their distance to `target`, nearest first.
#[inline]
pub fn distance_cmp(target: &HashId, a: &HashId, b: &HashId) -> Ordering {
    target.distance(a).cmp(&target.distance(b))
}
