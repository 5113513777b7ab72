use std::net::Ipv4Addr;

use log::debug;
use rand::Rng;

use super::ip::{
    build_ip_header_with_rng, IdentificationPolicy, Ipv4Header, IP_HEADER_LENGTH,
    TCP_PROTOCOL_NUM,
};
use super::tcp::{build_tcp_header, tcp_checksum, TcpFlags, TcpHeader, TCP_HEADER_LENGTH};
use crate::error::PacketError;

/// A checksummed IPv4 + TCP datagram with its own copy of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    ip_header: Ipv4Header,
    tcp_header: TcpHeader,
    payload: Vec<u8>,
}

/// Builds a complete IPv4/TCP packet, using the thread RNG for a random
/// identification field.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet(
    source_ip: Ipv4Addr,
    destination_ip: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    sequence_number: u32,
    ack_number: u32,
    flags: TcpFlags,
    payload: &[u8],
    id_policy: IdentificationPolicy,
) -> Result<Packet, PacketError> {
    build_tcp_packet_with_rng(
        source_ip,
        destination_ip,
        source_port,
        destination_port,
        sequence_number,
        ack_number,
        flags,
        payload,
        id_policy,
        &mut rand::thread_rng(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet_with_rng<R: Rng + ?Sized>(
    source_ip: Ipv4Addr,
    destination_ip: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    sequence_number: u32,
    ack_number: u32,
    flags: TcpFlags,
    payload: &[u8],
    id_policy: IdentificationPolicy,
    rng: &mut R,
) -> Result<Packet, PacketError> {
    // 1. total length, which must fit the 16-bit IPv4 field
    let total_length = u16::try_from(IP_HEADER_LENGTH + TCP_HEADER_LENGTH + payload.len())
        .map_err(|_| PacketError::PayloadTooLarge { len: payload.len() })?;

    // 2. IP header first: the TCP checksum needs its addresses
    let ip_header = build_ip_header_with_rng(
        total_length,
        TCP_PROTOCOL_NUM,
        source_ip,
        destination_ip,
        id_policy,
        rng,
    );

    // 3. TCP header, then 4. its checksum against this IP header + payload
    let tcp_header = build_tcp_header(
        source_port,
        destination_port,
        sequence_number,
        ack_number,
        flags,
    );
    let checksum = tcp_checksum(&tcp_header, &ip_header, payload)?;
    let tcp_header = tcp_header.with_checksum(checksum);

    // 5. take our own copy of the payload
    let mut owned_payload = Vec::new();
    owned_payload.try_reserve_exact(payload.len())?;
    owned_payload.extend_from_slice(payload);

    debug!(
        "built {} packet {}:{} -> {}:{} ({} bytes)",
        flags, source_ip, source_port, destination_ip, destination_port, total_length
    );

    Ok(Packet {
        ip_header,
        tcp_header,
        payload: owned_payload,
    })
}

impl Packet {
    pub fn ip_header(&self) -> &Ipv4Header {
        &self.ip_header
    }

    pub fn tcp_header(&self) -> &TcpHeader {
        &self.tcp_header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the serialized packet: both headers plus the payload.
    pub fn wire_len(&self) -> usize {
        IP_HEADER_LENGTH + TCP_HEADER_LENGTH + self.payload.len()
    }

    /// Wire image: IP header, TCP header, payload, no padding.
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(self.wire_len())?;
        buffer.extend_from_slice(&self.ip_header.to_bytes());
        buffer.extend_from_slice(&self.tcp_header.to_bytes());
        buffer.extend_from_slice(&self.payload);
        Ok(buffer)
    }

    /// Splits a serialized packet into its two headers and the payload.
    ///
    /// No checksum is verified here; the TCP checksum can only be checked
    /// against the IP header it was built with.
    pub fn split(bytes: &[u8]) -> Result<(Ipv4Header, TcpHeader, &[u8]), PacketError> {
        let needed = IP_HEADER_LENGTH + TCP_HEADER_LENGTH;
        if bytes.len() < needed {
            return Err(PacketError::Truncated {
                what: "IPv4/TCP packet",
                needed,
                got: bytes.len(),
            });
        }

        let ip_header = Ipv4Header::parse(&bytes[..IP_HEADER_LENGTH])?;
        let tcp_header = TcpHeader::parse(&bytes[IP_HEADER_LENGTH..needed])?;
        Ok((ip_header, tcp_header, &bytes[needed..]))
    }

    /// True when both the IP header checksum and the TCP checksum hold.
    pub fn verify(&self) -> Result<bool, PacketError> {
        let expected = tcp_checksum(&self.tcp_header, &self.ip_header, &self.payload)?;
        Ok(self.ip_header.checksum_is_valid() && expected == self.tcp_header.checksum())
    }
}
