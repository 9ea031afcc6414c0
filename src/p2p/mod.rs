pub mod addrman;
pub mod network;
pub mod peer;
pub mod seeds;

pub use addrman::AddressBook;
pub use network::BitcoinNetwork;
pub use peer::Peer;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message_blockdata::Inventory;
use std::net::SocketAddr;

use crate::error::PeerError;
use crate::wire::Digest;

/// Inventory kind as far as the radar cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Transaction,
    Block,
    /// Raw type id of anything else.
    Other(u32),
}

/// One announced item, digest in wire byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryEntry {
    pub kind: InvKind,
    pub digest: Digest,
}

impl InventoryEntry {
    pub fn transaction(digest: Digest) -> Self {
        Self {
            kind: InvKind::Transaction,
            digest,
        }
    }

    pub fn block(digest: Digest) -> Self {
        Self {
            kind: InvKind::Block,
            digest,
        }
    }
}

impl From<&Inventory> for InventoryEntry {
    fn from(inv: &Inventory) -> Self {
        let (kind, digest) = match inv {
            Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                return Self::transaction(txid.to_byte_array());
            }
            Inventory::Block(hash) | Inventory::WitnessBlock(hash) | Inventory::CompactBlock(hash) => {
                return Self::block(hash.to_byte_array());
            }
            Inventory::WTx(wtxid) => (InvKind::Other(5), wtxid.to_byte_array()),
            Inventory::Unknown { inv_type, hash } => (InvKind::Other(*inv_type), *hash),
            _ => (InvKind::Other(0), [0u8; 32]),
        };
        Self { kind, digest }
    }
}

/// Source of outbound peer links.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    type Channel: PeerChannel;

    /// Establish one more outbound connection.
    async fn connect(&self) -> Result<Self::Channel, PeerError>;
}

/// An established link that reports inventory announcements.
#[async_trait]
pub trait PeerChannel: Send + 'static {
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Wait for the next `inv` batch. An error means the link is unusable.
    async fn next_inventory(&mut self) -> Result<Vec<InventoryEntry>, PeerError>;
}
