use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use super::Publisher;
use crate::error::PublishError;
use crate::node_id::NodeId;
use crate::wire::{Digest, ObservedEvent};

/// Publishes "transaction observed" events.
///
/// The underlying channel is bound before the publisher is built, so every
/// inventory monitor shares one ready handle.
#[derive(Clone)]
pub struct RelayPublisher {
    transport: Arc<dyn Publisher>,
}

impl RelayPublisher {
    pub fn new(transport: Arc<dyn Publisher>) -> Self {
        Self { transport }
    }

    pub async fn publish_observed(&self, node_id: NodeId, digest: Digest) -> Result<(), PublishError> {
        let event = ObservedEvent::new(node_id, digest);
        debug!(node_id = %event.node_id, txid = %event.txid(), "sending");
        self.transport
            .publish(Bytes::copy_from_slice(&event.encode()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::testing::RecordingPublisher;
    use crate::publish::TcpPublisher;
    use crate::wire::OBSERVED_LEN;
    use futures::StreamExt;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

    #[tokio::test]
    async fn test_publish_observed_bytes() {
        let sink = Arc::new(RecordingPublisher::default());
        let relay = RelayPublisher::new(sink.clone());

        relay.publish_observed(NodeId::new(7), [0x11; 32]).await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        let mut expected = vec![0x07, 0x00, 0x00, 0x00];
        expected.extend_from_slice(&[0x11; 32]);
        assert_eq!(&messages[0][..], &expected[..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_publishers_share_one_channel() {
        let transport = Arc::new(
            TcpPublisher::bind("127.0.0.1:0".parse().unwrap(), true)
                .await
                .unwrap(),
        );
        let stream = TcpStream::connect(transport.local_addr()).await.unwrap();
        while transport.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());

        let relay = RelayPublisher::new(transport.clone());
        let first = relay.clone();
        let second = relay.clone();
        let a = tokio::spawn(async move { first.publish_observed(NodeId::new(1), [0xaa; 32]).await });
        let b = tokio::spawn(async move { second.publish_observed(NodeId::new(2), [0xbb; 32]).await });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let mut seen = HashSet::new();
        for _ in 0..2 {
            let frame = frames.next().await.unwrap().unwrap();
            assert_eq!(frame.len(), OBSERVED_LEN);
            seen.insert(ObservedEvent::decode(&frame).unwrap());
        }
        assert!(seen.contains(&ObservedEvent::new(NodeId::new(1), [0xaa; 32])));
        assert!(seen.contains(&ObservedEvent::new(NodeId::new(2), [0xbb; 32])));
    }
}
