use async_trait::async_trait;
use bitcoin::Network;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::seeds;
use super::{AddressBook, Peer, PeerNetwork};
use crate::config::RadarConfig;
use crate::error::PeerError;

/// Minimum spacing between two rounds of DNS seeding.
const RESEED_INTERVAL: Duration = Duration::from_secs(30);

/// Dials outbound Bitcoin peers for the connection manager.
pub struct BitcoinNetwork {
    net: Network,
    user_agent: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    book: Arc<AddressBook>,
    last_seeded: Mutex<Option<Instant>>,
}

impl BitcoinNetwork {
    pub fn new(config: &RadarConfig) -> Self {
        let book = Arc::new(AddressBook::new());
        for addr in &config.peers {
            book.add_pinned(*addr);
        }
        if book.is_empty() {
            debug!(network = %config.network, "no configured peers, relying on DNS seeds");
        }
        Self {
            net: config.network,
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            book,
            last_seeded: Mutex::new(None),
        }
    }

    /// Resolve the DNS seeds into the address book. Concurrent callers
    /// share one round; rounds are spaced by `RESEED_INTERVAL`.
    async fn bootstrap(&self) -> usize {
        let mut last = self.last_seeded.lock().await;
        if last.is_some_and(|t| t.elapsed() < RESEED_INTERVAL) {
            return 0;
        }
        *last = Some(Instant::now());

        let default_port = seeds::default_port(self.net);
        let mut added = 0usize;
        for &seed in seeds::dns_seeds(self.net) {
            let target = if seed.contains(':') {
                seed.to_string()
            } else {
                format!("{seed}:{default_port}")
            };
            match lookup_host(target).await {
                Ok(addrs) => {
                    let n = addrs.filter(|a| self.book.add(*a)).count();
                    debug!(seed, added = n, "resolved seed");
                    added += n;
                }
                Err(err) => warn!(seed, error = %err, "DNS seed lookup failed"),
            }
        }
        info!(added, known = self.book.len(), "bootstrapped from DNS seeds");
        added
    }
}

#[async_trait]
impl PeerNetwork for BitcoinNetwork {
    type Channel = Peer;

    async fn connect(&self) -> Result<Peer, PeerError> {
        let addr = match self.book.checkout() {
            Some(addr) => addr,
            None => {
                self.bootstrap().await;
                self.book.checkout().ok_or(PeerError::NoAddress)?
            }
        };

        let mut peer = match Peer::connect(addr, self.net, self.connect_timeout).await {
            Ok(peer) => peer.with_address_book(self.book.clone()),
            Err(err) => {
                self.book.release(&addr);
                return Err(err);
            }
        };
        // From here on dropping `peer` returns the address to the book.
        peer.handshake(&self.user_agent, self.handshake_timeout).await?;
        self.book.good(&addr);
        debug!(
            peer = %addr,
            user_agent = peer.user_agent(),
            in_use = self.book.in_use(),
            "peer ready"
        );
        Ok(peer)
    }
}
