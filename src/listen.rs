use anyhow::{Context, Result};
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{info, warn};

use crate::wire::{decode_connection_count, ObservedEvent};

type Frames = FramedRead<TcpStream, LengthDelimitedCodec>;

async fn subscribe(addr: SocketAddr) -> Result<Frames> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!(%addr, "subscribed");
    Ok(FramedRead::new(stream, LengthDelimitedCodec::new()))
}

async fn next_frame(frames: &mut Option<Frames>) -> Option<io::Result<BytesMut>> {
    match frames {
        Some(f) => f.next().await,
        None => std::future::pending().await,
    }
}

pub fn format_event(raw: &[u8]) -> String {
    match ObservedEvent::decode(raw) {
        Ok(event) => format!("Node ID: {}\nTx hash: {}", event.node_id, event.txid()),
        Err(err) => format!("malformed event: {err}"),
    }
}

pub fn format_count(raw: &[u8]) -> String {
    match decode_connection_count(raw) {
        Ok(count) => format!("Connections: {count}"),
        Err(err) => format!("malformed count: {err}"),
    }
}

/// Print everything published on the notify channel and, optionally, the
/// connection count channel. Returns when the notify channel closes.
pub async fn run(notify: SocketAddr, count: Option<SocketAddr>) -> Result<()> {
    let mut events = subscribe(notify).await?;
    let mut counts = match count {
        Some(addr) => Some(subscribe(addr).await?),
        None => None,
    };

    loop {
        tokio::select! {
            frame = events.next() => match frame {
                Some(frame) => println!("{}", format_event(&frame.context("notify channel")?)),
                None => {
                    info!("notify channel closed");
                    return Ok(());
                }
            },
            frame = next_frame(&mut counts) => match frame {
                Some(Ok(frame)) => println!("{}", format_count(&frame)),
                Some(Err(err)) => {
                    warn!(error = %err, "count channel failed");
                    counts = None;
                }
                None => {
                    info!("count channel closed");
                    counts = None;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NodeId;
    use crate::wire::encode_connection_count;

    #[test]
    fn test_format_event() {
        let mut digest = [0u8; 32];
        digest[0] = 0xab;
        let raw = ObservedEvent::new(NodeId::new(7), digest).encode();
        let text = format_event(&raw);

        assert!(text.starts_with("Node ID: 7\nTx hash: "));
        // txids display in reversed byte order
        assert!(text.ends_with("ab"));
    }

    #[test]
    fn test_format_malformed() {
        assert!(format_event(&[1, 2, 3]).starts_with("malformed"));
        assert_eq!(format_count(&encode_connection_count(12)), "Connections: 12");
    }
}
