use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use log::{debug, error, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::SocketError;
use crate::net::packet::Packet;

/// Anything the receive loop can wait on and drain one datagram from.
///
/// Implementations are expected to be non-blocking: a read after a spurious
/// wakeup must return `WouldBlock` instead of stalling the loop.
pub trait DatagramSource: AsRawFd {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSource for Socket {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self;
        socket.read(buf)
    }
}

impl DatagramSource for UdpSocket {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// IPPROTO_RAW: send-only on Linux, the kernel never delivers inbound
/// packets to it.
pub fn send_protocol() -> Protocol {
    Protocol::from(libc::IPPROTO_RAW)
}

/// Opens a non-blocking IPv4 raw socket for `protocol` with IP_HDRINCL set.
///
/// Requires root or CAP_NET_RAW.
pub fn open_raw_socket(protocol: Protocol) -> Result<Socket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(protocol)).map_err(SocketError::Open)?;

    socket
        .set_header_included_v4(true)
        .map_err(|source| SocketError::Configure {
            option: "IP_HDRINCL",
            source,
        })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| SocketError::Configure {
            option: "O_NONBLOCK",
            source,
        })?;

    Ok(socket)
}

/// Fixed, ordered set of sockets owned by one receive session.
///
/// Each socket is closed exactly once, when the set is dropped.
#[derive(Debug)]
pub struct RawSocketSet<S = Socket> {
    sockets: Vec<S>,
}

impl RawSocketSet<Socket> {
    /// Opens `count` raw sockets. If any of them fails, the ones already
    /// opened are closed again and the error is returned.
    pub fn open(count: usize, protocol: Protocol) -> Result<Self, SocketError> {
        let sockets = (0..count)
            .map(|index| {
                open_raw_socket(protocol)
                    .inspect_err(|e| error!("failed to create socket {index}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!("opened {} raw sockets", sockets.len());
        Ok(RawSocketSet { sockets })
    }
}

impl<S: DatagramSource> RawSocketSet<S> {
    pub fn from_sockets(sockets: Vec<S>) -> Self {
        RawSocketSet { sockets }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, S> {
        self.sockets.iter()
    }

    pub fn get(&self, index: usize) -> Option<&S> {
        self.sockets.get(index)
    }
}

/// Sends a built packet through a header-included raw socket to the packet's
/// own destination address and port.
pub fn send_packet(socket: &Socket, packet: &Packet) -> Result<usize, SocketError> {
    let bytes = packet.serialize()?;
    let destination = SockAddr::from(SocketAddr::new(
        IpAddr::V4(packet.ip_header().destination()),
        packet.tcp_header().destination_port(),
    ));

    let sent = socket
        .send_to(&bytes, &destination)
        .map_err(SocketError::Send)?;
    debug!("sent {sent} of {} bytes to {:?}", bytes.len(), destination.as_socket());

    Ok(sent)
}
