use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::p2p::{self, address, message, message_network as msg_net};
use bitcoin::Network;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{AddressBook, InventoryEntry, PeerChannel};
use crate::error::PeerError;

/// Protocol version advertised in our `version` message.
const ADVERTISED_PROTO: u32 = 70016;

const HEADER_LEN: usize = 24;

/// Largest payload accepted from a peer (same bound as Bitcoin Core).
const MAX_PAYLOAD: usize = 4_000_000;

/// Commands worth decoding; every other payload is read and discarded.
const HANDLED_COMMANDS: &[&str] = &["version", "verack", "inv", "ping", "addr"];

/// Outbound link to one Bitcoin peer.
pub struct Peer {
    addr: SocketAddr,
    magic: p2p::Magic,
    stream: TcpStream,
    their_services: p2p::ServiceFlags,
    their_user_agent: String,
    book: Option<Arc<AddressBook>>,
}

impl Peer {
    pub async fn connect(addr: SocketAddr, net: Network, connect_timeout: Duration) -> Result<Self, PeerError> {
        debug!(peer = %addr, "connecting");
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(PeerError::Io(e)),
            Err(_) => return Err(PeerError::ConnectTimeout(addr)),
        };
        Ok(Self {
            addr,
            magic: net.magic(),
            stream,
            their_services: p2p::ServiceFlags::NONE,
            their_user_agent: String::new(),
            book: None,
        })
    }

    /// Feed `addr` announcements into `book`, and give our address back
    /// to it when the link is dropped.
    pub fn with_address_book(mut self, book: Arc<AddressBook>) -> Self {
        self.book = Some(book);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn user_agent(&self) -> &str {
        &self.their_user_agent
    }

    pub async fn send(&mut self, msg: message::NetworkMessage) -> Result<(), PeerError> {
        let raw = message::RawNetworkMessage::new(self.magic, msg);
        let bytes = encode::serialize(&raw);
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Read one message. `None` means a message we don't care about was skipped.
    async fn recv(&mut self) -> Result<Option<message::NetworkMessage>, PeerError> {
        let mut header = [0u8; HEADER_LEN];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Err(PeerError::Closed),
            Err(err) => return Err(err.into()),
        }

        if header[..4] != self.magic.to_bytes() {
            return Err(PeerError::Protocol("wrong network magic".into()));
        }
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(PeerError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;

        let command = command_name(&header);
        if !HANDLED_COMMANDS.contains(&command) {
            trace!(peer = %self.addr, command, len, "skipping message");
            return Ok(None);
        }

        let raw: message::RawNetworkMessage =
            bitcoin::consensus::deserialize(&[&header[..], &payload[..]].concat())?;
        Ok(Some(raw.into_payload()))
    }

    pub async fn handshake(&mut self, user_agent: &str, handshake_timeout: Duration) -> Result<(), PeerError> {
        match timeout(handshake_timeout, self.negotiate(user_agent)).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::HandshakeTimeout),
        }
    }

    async fn negotiate(&mut self, user_agent: &str) -> Result<(), PeerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let unroutable = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut vm = msg_net::VersionMessage::new(
            p2p::ServiceFlags::NONE,
            now,
            address::Address::new(&self.addr, p2p::ServiceFlags::NONE),
            address::Address::new(&unroutable, p2p::ServiceFlags::NONE),
            rand::thread_rng().gen::<u64>(),
            user_agent.into(),
            0,
        );
        vm.version = ADVERTISED_PROTO;
        // Without this the peer never announces transactions to us.
        vm.relay = true;

        self.send(message::NetworkMessage::Version(vm)).await?;
        trace!(peer = %self.addr, user_agent, "sent version");

        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            match self.recv().await? {
                Some(message::NetworkMessage::Version(peer_vm)) => {
                    debug!(
                        peer = %self.addr,
                        user_agent = %peer_vm.user_agent,
                        height = peer_vm.start_height,
                        "received version"
                    );
                    self.their_services = peer_vm.services;
                    self.their_user_agent = peer_vm.user_agent;
                    self.send(message::NetworkMessage::Verack).await?;
                    got_version = true;
                }
                Some(message::NetworkMessage::Verack) => got_verack = true,
                Some(other) if !got_version => {
                    return Err(PeerError::Handshake(format!(
                        "unexpected {} before version",
                        other.command()
                    )));
                }
                _ => {}
            }
        }

        let _ = self.send(message::NetworkMessage::GetAddr).await;
        debug!(peer = %self.addr, services = ?self.their_services, "handshake complete");
        Ok(())
    }

    fn learn_addresses(&self, addrs: Vec<(u32, address::Address)>) {
        let Some(book) = &self.book else {
            return;
        };
        let added = addrs
            .into_iter()
            .filter_map(|(_, a)| a.socket_addr().ok())
            .filter(|sock| book.add(*sock))
            .count();
        trace!(peer = %self.addr, added, "learned addresses");
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(book) = &self.book {
            book.release(&self.addr);
        }
    }
}

#[async_trait]
impl PeerChannel for Peer {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.addr())
    }

    async fn next_inventory(&mut self) -> Result<Vec<InventoryEntry>, PeerError> {
        loop {
            let Some(msg) = self.recv().await? else {
                continue;
            };
            match msg {
                message::NetworkMessage::Inv(inv) => {
                    return Ok(inv.iter().map(InventoryEntry::from).collect());
                }
                message::NetworkMessage::Ping(nonce) => {
                    self.send(message::NetworkMessage::Pong(nonce)).await?;
                }
                message::NetworkMessage::Addr(addrs) => self.learn_addresses(addrs),
                other => trace!(peer = %self.addr, command = %other.command(), "ignored"),
            }
        }
    }
}

fn command_name(header: &[u8; HEADER_LEN]) -> &str {
    let raw = &header[4..16];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}
