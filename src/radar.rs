use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::config::RadarConfig;
use crate::error::FatalError;
use crate::manager::{ConnectionManager, ConnectionRegistry};
use crate::p2p::PeerNetwork;
use crate::publish::{CountPublisher, RelayPublisher, TcpPublisher};

/// A running radar: both publish channels, the connection slots and the
/// count heartbeat.
pub struct Radar {
    notify: Arc<TcpPublisher>,
    count: Arc<TcpPublisher>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Sender<bool>,
    slots: JoinSet<()>,
    heartbeat: JoinHandle<()>,
}

impl Radar {
    /// Bind both channels, then start connecting. Nothing touches the
    /// network before the channels exist.
    pub async fn start<N: PeerNetwork>(config: &RadarConfig, network: Arc<N>) -> Result<Self, FatalError> {
        let notify = Arc::new(TcpPublisher::bind(config.notify_addr(), config.local_only).await?);
        let count = Arc::new(TcpPublisher::bind(config.count_addr(), config.local_only).await?);

        let manager = Arc::new(ConnectionManager::new(
            network,
            RelayPublisher::new(notify.clone()),
            config.target_connection_count,
            config.retry,
        ));
        let registry = manager.registry();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(
            CountPublisher::new(registry.clone(), count.clone(), config.count_interval)
                .run(shutdown_rx.clone()),
        );
        let slots = manager.start(&shutdown_rx);

        info!(
            notify = %notify.local_addr(),
            count = %count.local_addr(),
            target = config.target_connection_count,
            "Radar started."
        );
        Ok(Self {
            notify,
            count,
            registry,
            shutdown,
            slots,
            heartbeat,
        })
    }

    pub fn notify_addr(&self) -> SocketAddr {
        self.notify.local_addr()
    }

    pub fn count_addr(&self) -> SocketAddr {
        self.count.local_addr()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Stop every task, then close the channels so nothing publishes
    /// into a torn-down transport.
    pub async fn shutdown(self) -> Result<(), FatalError> {
        for conn in self.registry.snapshot() {
            debug!(node_id = %conn.node_id, peer = ?conn.addr, "dropping connection");
        }
        let Self {
            notify,
            count,
            shutdown,
            mut slots,
            heartbeat,
            ..
        } = self;

        let _ = shutdown.send(true);
        let mut first_err = None;
        while let Some(res) = slots.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "connection slot failed");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = heartbeat.await {
            error!(error = %err, "count publisher failed");
            first_err.get_or_insert(err);
        }

        notify.close().await;
        count.close().await;
        info!("Radar stopped.");
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::PeerError;
    use crate::p2p::testing::{ScriptedChannel, ScriptedNetwork};
    use crate::p2p::InventoryEntry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::wire::{decode_connection_count, ObservedEvent};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

    fn test_config() -> RadarConfig {
        RadarConfig {
            target_connection_count: 2,
            notify_port: 0,
            count_port: 0,
            local_only: true,
            count_interval: Duration::from_millis(20),
            retry: RetryPolicy::immediate(),
            ..RadarConfig::default()
        }
    }

    async fn subscribe(addr: SocketAddr) -> FramedRead<TcpStream, LengthDelimitedCodec> {
        FramedRead::new(TcpStream::connect(addr).await.unwrap(), LengthDelimitedCodec::new())
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let network = Arc::new(ScriptedNetwork::default());
        let batches = network.accept();

        let radar = Radar::start(&test_config(), network.clone()).await.unwrap();
        let mut counts = subscribe(radar.count_addr()).await;
        let mut events = subscribe(radar.notify_addr()).await;

        // wait for the heartbeat to report the connection
        loop {
            let frame = counts.next().await.unwrap().unwrap();
            if decode_connection_count(&frame).unwrap() == 1 {
                break;
            }
        }
        assert_eq!(radar.active_connections(), 1);

        // the notify subscriber may not be attached yet; keep announcing
        // until one event arrives
        let event = loop {
            batches
                .send(Ok(vec![InventoryEntry::transaction([0x42; 32])]))
                .unwrap();
            match tokio::time::timeout(Duration::from_millis(50), events.next()).await {
                Ok(Some(frame)) => break ObservedEvent::decode(&frame.unwrap()).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(event.digest, [0x42; 32]);

        radar.shutdown().await.unwrap();
        // both channels hang up on their subscribers
        while events.next().await.is_some() {}
        while counts.next().await.is_some() {}
    }

    /// Dialing panics, taking its slot task down with it.
    #[derive(Default)]
    struct PanickingNetwork {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl PeerNetwork for PanickingNetwork {
        type Channel = ScriptedChannel;

        async fn connect(&self) -> Result<ScriptedChannel, PeerError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            panic!("dialer crashed");
        }
    }

    #[tokio::test]
    async fn test_failed_slot_still_closes_channels() {
        let network = Arc::new(PanickingNetwork::default());
        let radar = Radar::start(&test_config(), network.clone()).await.unwrap();
        let mut counts = subscribe(radar.count_addr()).await;
        let mut events = subscribe(radar.notify_addr()).await;

        while network.dials.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(radar.shutdown().await, Err(FatalError::Task(_))));
        while events.next().await.is_some() {}
        while counts.next().await.is_some() {}
    }
}
