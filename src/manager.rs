use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::monitor::InventoryMonitor;
use crate::node_id::{NodeId, NodeIdGenerator};
use crate::p2p::{PeerChannel, PeerNetwork};
use crate::publish::RelayPublisher;

/// State of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotState::Connecting => "connecting",
            SlotState::Connected => "connected",
            SlotState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LiveConnection {
    pub node_id: NodeId,
    pub addr: Option<SocketAddr>,
    pub since: Instant,
}

/// The set of currently established connections.
///
/// Keyed by an internal sequence number since node ids may collide.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_key: AtomicU64,
    live: RwLock<HashMap<u64, LiveConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection; it stays counted until the guard is dropped.
    pub fn register(self: &Arc<Self>, node_id: NodeId, addr: Option<SocketAddr>) -> ConnectionGuard {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.live.write().insert(
            key,
            LiveConnection {
                node_id,
                addr,
                since: Instant::now(),
            },
        );
        ConnectionGuard {
            registry: self.clone(),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn snapshot(&self) -> Vec<LiveConnection> {
        self.live.read().values().cloned().collect()
    }
}

pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    key: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.registry.live.write().remove(&self.key) {
            debug!(node_id = %conn.node_id, uptime = ?conn.since.elapsed(), "deregistered");
        }
    }
}

/// Keeps `target` outbound connections alive and attaches an inventory
/// monitor to each.
///
/// Every slot loops forever: connect, monitor until the link closes,
/// connect again. Failed attempts are retried according to the retry
/// policy; the loop never gives up.
pub struct ConnectionManager<N: PeerNetwork> {
    network: Arc<N>,
    relay: RelayPublisher,
    ids: NodeIdGenerator,
    registry: Arc<ConnectionRegistry>,
    target: usize,
    retry: RetryPolicy,
    attempts: AtomicU64,
    slots: RwLock<Vec<SlotState>>,
    #[cfg(test)]
    history: parking_lot::Mutex<Vec<(usize, SlotState)>>,
}

impl<N: PeerNetwork> ConnectionManager<N> {
    pub fn new(network: Arc<N>, relay: RelayPublisher, target: usize, retry: RetryPolicy) -> Self {
        Self {
            network,
            relay,
            ids: NodeIdGenerator::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            target,
            retry,
            attempts: AtomicU64::new(0),
            slots: RwLock::new(vec![SlotState::Connecting; target]),
            #[cfg(test)]
            history: parking_lot::Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn with_id_generator(mut self, ids: NodeIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Connect attempts made so far, across all slots.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.read().get(slot).copied()
    }

    /// Every state a slot was put in, in order.
    #[cfg(test)]
    pub fn slot_history(&self, slot: usize) -> Vec<SlotState> {
        self.history
            .lock()
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Spawn one task per slot. They run until `shutdown` flips.
    pub fn start(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> JoinSet<()> {
        let mut slots = JoinSet::new();
        for slot in 0..self.target {
            slots.spawn(self.clone().run_slot(slot, shutdown.clone()));
        }
        info!(target = self.target, "connection manager started");
        slots
    }

    async fn run_slot(self: Arc<Self>, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.retry.backoff();
        while !*shutdown.borrow() {
            let state = tokio::select! {
                _ = shutdown.changed() => break,
                state = self.connect_and_monitor(slot) => state,
            };
            if state == SlotState::Failed {
                let delay = backoff.next_delay();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            } else {
                backoff.reset();
            }
        }
        debug!(slot, attempts = self.attempts(), "slot stopped");
    }

    /// One pass of a slot: connect, and on success monitor the connection
    /// until it closes. Returns `Failed` if the attempt failed, `Connected`
    /// once an established connection has ended.
    pub async fn connect_and_monitor(&self, slot: usize) -> SlotState {
        self.set_state(slot, SlotState::Connecting);
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;

        let channel = match self.network.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(slot, attempt, error = %err, "Couldn't start connection, retrying");
                self.set_state(slot, SlotState::Failed);
                return SlotState::Failed;
            }
        };

        let node_id = self.ids.next_id();
        let addr = channel.remote_addr();
        let _guard = self.registry.register(node_id, addr);
        self.set_state(slot, SlotState::Connected);
        info!(
            slot,
            %node_id,
            peer = ?addr,
            active = self.registry.len(),
            "Connection established"
        );

        InventoryMonitor::new(node_id, self.relay.clone())
            .run(channel)
            .await;

        info!(slot, %node_id, "Connection closed");
        SlotState::Connected
    }

    fn set_state(&self, slot: usize, state: SlotState) {
        #[cfg(test)]
        self.history.lock().push((slot, state));
        let mut slots = self.slots.write();
        if let Some(current) = slots.get_mut(slot) {
            if *current != state {
                debug!(slot, from = %current, to = %state, "slot transition");
                *current = state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::testing::ScriptedNetwork;
    use crate::p2p::InventoryEntry;
    use crate::publish::testing::RecordingPublisher;
    use crate::wire::ObservedEvent;
    use std::time::Duration;

    struct Harness {
        network: Arc<ScriptedNetwork>,
        sink: Arc<RecordingPublisher>,
        manager: Arc<ConnectionManager<ScriptedNetwork>>,
        shutdown: watch::Sender<bool>,
        slots: JoinSet<()>,
    }

    fn start(network: ScriptedNetwork, target: usize) -> Harness {
        let network = Arc::new(network);
        let sink = Arc::new(RecordingPublisher::default());
        let manager = Arc::new(
            ConnectionManager::new(
                network.clone(),
                RelayPublisher::new(sink.clone()),
                target,
                RetryPolicy::immediate(),
            )
            .with_id_generator(NodeIdGenerator::with_seed(7)),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let slots = manager.start(&shutdown_rx);
        Harness {
            network,
            sink,
            manager,
            shutdown,
            slots,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_registry_guard_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = registry.register(NodeId::new(1), None);
        let b = registry.register(NodeId::new(1), None);
        assert_eq!(registry.len(), 2);
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_retries_until_connected() {
        let network = ScriptedNetwork::default();
        network.fail();
        network.fail();
        let _batches = network.accept();

        let h = start(network, 1);
        wait_until(|| h.manager.active_connections() == 1).await;

        assert_eq!(h.network.attempts(), 3);
        assert_eq!(h.manager.attempts(), 3);
        assert_eq!(h.manager.slot_state(0), Some(SlotState::Connected));
        assert_eq!(
            h.manager.slot_history(0),
            vec![
                SlotState::Connecting,
                SlotState::Failed,
                SlotState::Connecting,
                SlotState::Failed,
                SlotState::Connecting,
                SlotState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_fills_target() {
        let network = ScriptedNetwork::default();
        let _senders: Vec<_> = (0..3).map(|_| network.accept()).collect();

        let h = start(network, 3);
        wait_until(|| h.manager.active_connections() == 3).await;

        let ids: Vec<_> = h.manager.registry().snapshot().iter().map(|c| c.node_id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_relays_with_connection_node_id() {
        let network = ScriptedNetwork::default();
        let batches = network.accept();

        let h = start(network, 1);
        wait_until(|| h.manager.active_connections() == 1).await;
        let node_id = h.manager.registry().snapshot()[0].node_id;

        batches
            .send(Ok(vec![
                InventoryEntry::transaction([1; 32]),
                InventoryEntry::block([2; 32]),
                InventoryEntry::transaction([3; 32]),
            ]))
            .unwrap();
        wait_until(|| h.sink.messages().len() == 2).await;

        let events: Vec<_> = h
            .sink
            .messages()
            .iter()
            .map(|m| ObservedEvent::decode(m).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                ObservedEvent::new(node_id, [1; 32]),
                ObservedEvent::new(node_id, [3; 32]),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_connection_recycles_slot() {
        let network = ScriptedNetwork::default();
        let first = network.accept();
        let _second = network.accept();

        let h = start(network, 1);
        wait_until(|| h.network.attempts() == 1 && h.manager.active_connections() == 1).await;

        drop(first);
        wait_until(|| h.network.attempts() == 2 && h.manager.active_connections() == 1).await;
        assert_eq!(h.manager.slot_state(0), Some(SlotState::Connected));
    }

    #[tokio::test]
    async fn test_shutdown_stops_slots() {
        let network = ScriptedNetwork::default();
        let _batches = network.accept();

        let mut h = start(network, 2);
        wait_until(|| h.manager.active_connections() == 1).await;

        h.shutdown.send(true).unwrap();
        while let Some(res) = h.slots.join_next().await {
            res.unwrap();
        }
        assert_eq!(h.manager.active_connections(), 0);
    }
}
