//! Raw IPv4/TCP packet crafting and a multiplexed raw socket receive loop.
//!
//! Packets are built field by field in network byte order with their IP and
//! TCP checksums filled in, then serialized for a header-included raw socket.
//! The receive side waits on a fixed set of raw sockets until a shared stop
//! flag is raised.

pub mod error;
pub mod event;
pub mod hextools;
pub mod net;
pub mod receive;
pub mod socket;

pub use error::{PacketError, ReceiveError, SocketError};
pub use event::StopEvent;
pub use net::checksum::rfc1071_checksum;
pub use net::ip::{build_ip_header, build_ip_header_with_rng, IdentificationPolicy, Ipv4Header};
pub use net::packet::{build_tcp_packet, build_tcp_packet_with_rng, Packet};
pub use net::tcp::{build_tcp_header, tcp_checksum, PseudoHeader, TcpFlags, TcpHeader};
pub use receive::{
    run_receive_loop, run_receive_loop_with, PollWait, ReadinessWait, ReceiveConfig, ReceiveStats,
};
pub use socket::{open_raw_socket, send_packet, send_protocol, DatagramSource, RawSocketSet};
