use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

/// Failures while building, serializing or parsing a packet.
///
/// A packet that fails to build is never handed out partially, so none of
/// these leave a half-formed `Packet` behind.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("payload of {len} bytes does not fit in an IPv4 datagram")]
    PayloadTooLarge { len: usize },

    #[error("truncated {what}: need {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("unsupported header: {0}")]
    UnsupportedHeader(String),
}

/// Fatal conditions of a receive session.
///
/// Per-socket read errors are not represented here; they are logged and the
/// session carries on with the remaining sockets.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("receive loop started with no sockets")]
    EmptySet,
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("raw socket creation failed (requires CAP_NET_RAW): {0}")]
    Open(#[source] io::Error),

    #[error("raw socket configuration failed ({option}): {source}")]
    Configure {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("packet send failed: {0}")]
    Send(#[source] io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),
}
