use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures on a single peer link. Always recoverable: the owning slot
/// logs them and reconnects.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("timed out waiting for handshake")]
    HandshakeTimeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("malformed message: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),
    #[error("message of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("no peer address available")]
    NoAddress,
    #[error("peer closed the connection")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher on {0} is closed")]
    Closed(SocketAddr),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Invariant violations. These are never retried: the hosting process
/// decides how to stop.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to bind publish channel on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
