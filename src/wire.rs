//! Outbound messages published to subscribers.
//!
//! TransactionObserved: 4-byte little-endian node id followed by the
//! 32-byte digest in wire order (36 bytes).
//! ConnectionCount: 4-byte little-endian unsigned count.

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use std::fmt;

use crate::error::WireError;
use crate::node_id::NodeId;

pub type Digest = [u8; 32];

pub const OBSERVED_LEN: usize = 4 + 32;
pub const COUNT_LEN: usize = 4;

/// A transaction announcement seen on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservedEvent {
    pub node_id: NodeId,
    pub digest: Digest,
}

impl ObservedEvent {
    pub fn new(node_id: NodeId, digest: Digest) -> Self {
        Self { node_id, digest }
    }

    pub fn txid(&self) -> Txid {
        Txid::from_byte_array(self.digest)
    }

    pub fn encode(&self) -> [u8; OBSERVED_LEN] {
        let mut out = [0u8; OBSERVED_LEN];
        out[..4].copy_from_slice(&self.node_id.to_le_bytes());
        out[4..].copy_from_slice(&self.digest);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() != OBSERVED_LEN {
            return Err(WireError::Length {
                expected: OBSERVED_LEN,
                actual: raw.len(),
            });
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&raw[..4]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&raw[4..]);
        Ok(Self {
            node_id: NodeId::from_le_bytes(id),
            digest,
        })
    }
}

impl fmt::Display for ObservedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.node_id, self.txid())
    }
}

/// Encode a live connection count. Counts beyond `u32::MAX` saturate.
pub fn encode_connection_count(count: usize) -> [u8; COUNT_LEN] {
    u32::try_from(count).unwrap_or(u32::MAX).to_le_bytes()
}

pub fn decode_connection_count(raw: &[u8]) -> Result<u32, WireError> {
    let bytes: [u8; COUNT_LEN] = raw.try_into().map_err(|_| WireError::Length {
        expected: COUNT_LEN,
        actual: raw.len(),
    })?;
    Ok(u32::from_le_bytes(bytes))
}
