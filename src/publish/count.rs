use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, warn};

use super::Publisher;
use crate::manager::ConnectionRegistry;
use crate::wire::encode_connection_count;

/// Heartbeat publishing the number of live outbound connections.
pub struct CountPublisher {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Publisher>,
    interval: Duration,
}

impl CountPublisher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Publisher>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            interval,
        }
    }

    /// Publish the current count every interval until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let count = self.registry.len();
                    trace!(count, "publishing connection count");
                    let payload = Bytes::copy_from_slice(&encode_connection_count(count));
                    if let Err(err) = self.transport.publish(payload).await {
                        warn!(error = %err, "failed to publish connection count");
                    }
                }
            }
        }
        info!("connection count publisher stopped");
    }
}
