use tracing::{error, trace, warn};

use crate::node_id::NodeId;
use crate::p2p::{InvKind, InventoryEntry, PeerChannel};
use crate::publish::RelayPublisher;

/// Forwards the transaction announcements of one connection.
pub struct InventoryMonitor {
    node_id: NodeId,
    relay: RelayPublisher,
}

impl InventoryMonitor {
    pub fn new(node_id: NodeId, relay: RelayPublisher) -> Self {
        Self { node_id, relay }
    }

    /// Await and process inventory batches until the channel fails.
    pub async fn run<C: PeerChannel>(&self, mut channel: C) {
        loop {
            match channel.next_inventory().await {
                Ok(batch) => {
                    self.process_batch(&batch).await;
                }
                Err(err) => {
                    error!(node_id = %self.node_id, error = %err, "inventory");
                    return;
                }
            }
        }
    }

    /// Publish every transaction entry of `batch` in order. Returns how
    /// many were forwarded.
    pub async fn process_batch(&self, batch: &[InventoryEntry]) -> usize {
        let mut forwarded = 0;
        for entry in batch {
            match entry.kind {
                InvKind::Transaction => {
                    if let Err(err) = self.relay.publish_observed(self.node_id, entry.digest).await {
                        warn!(node_id = %self.node_id, error = %err, "publish failed");
                        continue;
                    }
                    forwarded += 1;
                }
                InvKind::Block => {}
                InvKind::Other(inv_type) => {
                    warn!(node_id = %self.node_id, inv_type, "Ignoring unknown inventory type");
                }
            }
        }
        trace!(node_id = %self.node_id, entries = batch.len(), forwarded, "processed inventory");
        forwarded
    }
}
