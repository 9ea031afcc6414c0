use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::Publisher;
use crate::error::{FatalError, PublishError};

/// Messages buffered per subscriber before a slow one starts losing them.
const CHANNEL_CAPACITY: usize = 4096;

/// Publish channel over TCP.
///
/// Every subscriber receives each message as one length-delimited frame
/// (4-byte big-endian length, then the payload). Messages published while
/// nobody is connected are dropped.
pub struct TcpPublisher {
    local_addr: SocketAddr,
    sender: broadcast::Sender<Bytes>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPublisher {
    /// Bind the channel. With `local_only`, subscribers from other hosts
    /// are refused even if the listener is reachable.
    pub async fn bind(addr: SocketAddr, local_only: bool) -> Result<Self, FatalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FatalError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| FatalError::Bind { addr, source })?;

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            sender.clone(),
            local_only,
            shutdown_rx,
        ));
        info!(addr = %local_addr, local_only, "publish channel bound");

        Ok(Self {
            local_addr,
            sender,
            closed: AtomicBool::new(false),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stop accepting, disconnect subscribers and refuse further publishes.
    pub async fn close(&self) {
        debug!(addr = %self.local_addr, subscribers = self.subscriber_count(), "closing publish channel");
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(addr = %self.local_addr, error = %err, "accept loop ended abnormally");
            }
        }
        info!(addr = %self.local_addr, "publish channel closed");
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed(self.local_addr));
        }
        // Err here only means nobody is subscribed.
        let _ = self.sender.send(payload);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: broadcast::Sender<Bytes>,
    local_only: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscribers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if local_only && !peer.ip().is_loopback() {
                        warn!(%peer, "refusing non-local subscriber");
                        continue;
                    }
                    debug!(%peer, "subscriber connected");
                    subscribers.spawn(serve_subscriber(stream, peer, sender.subscribe()));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = subscribers.join_next(), if !subscribers.is_empty() => {}
        }
    }
    subscribers.shutdown().await;
}

async fn serve_subscriber(stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Bytes>) {
    let _ = stream.set_nodelay(true);
    let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
    loop {
        match rx.recv().await {
            Ok(payload) => {
                if let Err(err) = frames.send(payload).await {
                    debug!(%peer, error = %err, "subscriber gone");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%peer, skipped, "subscriber lagging, messages dropped");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    async fn subscribe(publisher: &TcpPublisher) -> FramedRead<TcpStream, LengthDelimitedCodec> {
        let before = publisher.subscriber_count();
        let stream = TcpStream::connect(publisher.local_addr()).await.unwrap();
        while publisher.subscriber_count() == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        FramedRead::new(stream, LengthDelimitedCodec::new())
    }

    #[tokio::test]
    async fn test_frames_reach_every_subscriber() {
        let publisher = TcpPublisher::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let mut a = subscribe(&publisher).await;
        let mut b = subscribe(&publisher).await;

        publisher.publish(Bytes::from_static(b"hello")).await.unwrap();
        publisher.publish(Bytes::from_static(b"world")).await.unwrap();

        for sub in [&mut a, &mut b] {
            assert_eq!(&sub.next().await.unwrap().unwrap()[..], b"hello");
            assert_eq!(&sub.next().await.unwrap().unwrap()[..], b"world");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = TcpPublisher::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        assert!(publisher.publish(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let publisher = TcpPublisher::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let mut sub = subscribe(&publisher).await;
        publisher.close().await;

        assert!(matches!(
            publisher.publish(Bytes::from_static(b"x")).await,
            Err(PublishError::Closed(_))
        ));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = TcpPublisher::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let second = TcpPublisher::bind(first.local_addr(), true).await;
        assert!(matches!(second, Err(FatalError::Bind { .. })));
    }
}
