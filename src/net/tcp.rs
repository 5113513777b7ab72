use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use log::debug;

use super::checksum::rfc1071_checksum;
use super::ip::{Ipv4Header, TCP_PROTOCOL_NUM};
use crate::error::PacketError;

pub const TCP_HEADER_LENGTH: usize = 20;
pub const PSEUDO_HEADER_LENGTH: usize = 12;
pub const MAX_WINDOW: u16 = u16::MAX;

// 5 x 32-bit words, no options
const TCP_HEADER_WORDS: u8 = 5;

/// TCP control bits as they sit in byte 13 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    const NAMES: [(&'static str, TcpFlags); 6] = [
        ("FIN", TcpFlags::FIN),
        ("SYN", TcpFlags::SYN),
        ("RST", TcpFlags::RST),
        ("PSH", TcpFlags::PSH),
        ("ACK", TcpFlags::ACK),
        ("URG", TcpFlags::URG),
    ];

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: TcpFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Parses a comma or `|` separated list of flag names, e.g. `syn,ack`.
impl FromStr for TcpFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = TcpFlags::empty();
        for name in s.split([',', '|']).map(str::trim).filter(|n| !n.is_empty()) {
            let (_, flag) = Self::NAMES
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(name))
                .ok_or_else(|| format!("unknown TCP flag '{name}'"))?;
            flags |= *flag;
        }
        Ok(flags)
    }
}

/// TCP header without options.
///
/// The checksum is 0 until the header is paired with an IPv4 header and a
/// payload by the packet assembler. It is only meaningful for that pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    source_port: u16,
    destination_port: u16,
    sequence_number: u32,
    ack_number: u32,
    data_offset: u8,
    flags: TcpFlags,
    window: u16,
    checksum: u16,
    urgent_pointer: u16,
}

/// Builds a 20-byte TCP header with a maximum window and no checksum yet.
pub fn build_tcp_header(
    source_port: u16,
    destination_port: u16,
    sequence_number: u32,
    ack_number: u32,
    flags: TcpFlags,
) -> TcpHeader {
    TcpHeader {
        source_port,
        destination_port,
        sequence_number,
        ack_number,
        data_offset: TCP_HEADER_WORDS,
        flags,
        window: MAX_WINDOW,
        checksum: 0,
        urgent_pointer: 0,
    }
}

impl TcpHeader {
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LENGTH] {
        let mut buffer = [0u8; TCP_HEADER_LENGTH];

        buffer[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        buffer[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.sequence_number.to_be_bytes());
        buffer[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        // data offset in the upper nibble, reserved bits zero
        buffer[12] = self.data_offset << 4;
        buffer[13] = self.flags.bits();
        buffer[14..16].copy_from_slice(&self.window.to_be_bytes());
        buffer[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        buffer[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        buffer
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < TCP_HEADER_LENGTH {
            return Err(PacketError::Truncated {
                what: "TCP header",
                needed: TCP_HEADER_LENGTH,
                got: bytes.len(),
            });
        }

        let data_offset = bytes[12] >> 4;
        if data_offset != TCP_HEADER_WORDS {
            return Err(PacketError::UnsupportedHeader(format!(
                "TCP data offset {data_offset} words"
            )));
        }

        let be16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let be32 = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        Ok(TcpHeader {
            source_port: be16(0),
            destination_port: be16(2),
            sequence_number: be32(4),
            ack_number: be32(8),
            data_offset,
            flags: TcpFlags::from_bits(bytes[13]),
            window: be16(14),
            checksum: be16(16),
            urgent_pointer: be16(18),
        })
    }

    pub(crate) fn with_checksum(self, checksum: u16) -> Self {
        TcpHeader { checksum, ..self }
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    pub fn header_length_words(&self) -> u8 {
        self.data_offset
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }
}

/// Checksum-only prefix: never part of the packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub tcp_length: u16,
}

impl PseudoHeader {
    pub fn for_segment(ip_header: &Ipv4Header, tcp_length: u16) -> Self {
        PseudoHeader {
            source: ip_header.source(),
            destination: ip_header.destination(),
            protocol: TCP_PROTOCOL_NUM,
            tcp_length,
        }
    }

    pub fn to_bytes(&self) -> [u8; PSEUDO_HEADER_LENGTH] {
        let mut buffer = [0u8; PSEUDO_HEADER_LENGTH];
        buffer[0..4].copy_from_slice(&self.source.octets());
        buffer[4..8].copy_from_slice(&self.destination.octets());
        // buffer[8] stays zero
        buffer[9] = self.protocol;
        buffer[10..12].copy_from_slice(&self.tcp_length.to_be_bytes());
        buffer
    }
}

/// TCP checksum of `tcp_header` + `payload` as carried inside `ip_header`.
///
/// The header's own checksum field is treated as zero. Fails rather than
/// returning a made-up value if the scratch buffer cannot be allocated.
pub fn tcp_checksum(
    tcp_header: &TcpHeader,
    ip_header: &Ipv4Header,
    payload: &[u8],
) -> Result<u16, PacketError> {
    let tcp_length = u16::try_from(TCP_HEADER_LENGTH + payload.len())
        .map_err(|_| PacketError::PayloadTooLarge { len: payload.len() })?;
    let pseudo_header = PseudoHeader::for_segment(ip_header, tcp_length);

    let mut checksum_buffer: Vec<u8> = Vec::new();
    checksum_buffer.try_reserve_exact(PSEUDO_HEADER_LENGTH + usize::from(tcp_length))?;
    checksum_buffer.extend_from_slice(&pseudo_header.to_bytes());
    checksum_buffer.extend_from_slice(&tcp_header.with_checksum(0).to_bytes());
    checksum_buffer.extend_from_slice(payload);

    let checksum = rfc1071_checksum(&checksum_buffer);
    debug!(
        "tcp checksum {}:{} -> {}:{} over {} bytes: {:#06x}",
        pseudo_header.source,
        tcp_header.source_port,
        pseudo_header.destination,
        tcp_header.destination_port,
        checksum_buffer.len(),
        checksum
    );

    Ok(checksum)
}
