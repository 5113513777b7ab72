use std::net::Ipv4Addr;

use log::debug;
use pnet_packet::ip::IpNextHeaderProtocols;
use rand::Rng;

use super::checksum::rfc1071_checksum;
use crate::error::PacketError;

pub const TCP_PROTOCOL_NUM: u8 = IpNextHeaderProtocols::Tcp.0;
pub const IP_HEADER_LENGTH: usize = 20;
pub const DEFAULT_TTL: u8 = 64;

const IP_VERSION: u8 = 4;
// 5 x 32-bit words, no options
const IP_HEADER_WORDS: u8 = 5;

/// Where the 16-bit identification field comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentificationPolicy {
    /// Drawn from the RNG handed to the builder.
    #[default]
    Random,
    /// Same value on every header, for reproducible output.
    Fixed(u16),
}

impl IdentificationPolicy {
    pub fn next_id<R: Rng + ?Sized>(&self, rng: &mut R) -> u16 {
        match self {
            IdentificationPolicy::Random => rng.gen(),
            IdentificationPolicy::Fixed(id) => *id,
        }
    }
}

/// IPv4 header without options.
///
/// Only the builders and [`Ipv4Header::parse`] create one, and the checksum is
/// always filled in last, so a value of this type is valid for its own byte
/// image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    version: u8,
    ihl: u8,
    tos: u8,
    total_length: u16,
    identification: u16,
    // flags (3 bits) + fragment offset (13 bits), never set by the builder
    flags_fragment: u16,
    ttl: u8,
    protocol: u8,
    checksum: u16,
    source: Ipv4Addr,
    destination: Ipv4Addr,
}

/// Builds a 20-byte IPv4 header, drawing a random identification from the
/// thread RNG when the policy asks for one.
pub fn build_ip_header(
    total_length: u16,
    protocol: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    id_policy: IdentificationPolicy,
) -> Ipv4Header {
    build_ip_header_with_rng(
        total_length,
        protocol,
        source,
        destination,
        id_policy,
        &mut rand::thread_rng(),
    )
}

pub fn build_ip_header_with_rng<R: Rng + ?Sized>(
    total_length: u16,
    protocol: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    id_policy: IdentificationPolicy,
    rng: &mut R,
) -> Ipv4Header {
    let mut header = Ipv4Header {
        version: IP_VERSION,
        ihl: IP_HEADER_WORDS,
        tos: 0,
        total_length,
        identification: id_policy.next_id(rng),
        flags_fragment: 0,
        ttl: DEFAULT_TTL,
        protocol,
        checksum: 0,
        source,
        destination,
    };
    header.checksum = rfc1071_checksum(&header.to_bytes());

    debug!(
        "ipv4 header {} -> {} proto={} len={} id={:#06x} csum={:#06x}",
        source, destination, protocol, total_length, header.identification, header.checksum
    );

    header
}

impl Ipv4Header {
    pub fn to_bytes(&self) -> [u8; IP_HEADER_LENGTH] {
        let mut buffer = [0u8; IP_HEADER_LENGTH];

        buffer[0] = (self.version << 4) | (self.ihl & 0x0f);
        buffer[1] = self.tos;
        buffer[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.identification.to_be_bytes());
        buffer[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        buffer[8] = self.ttl;
        buffer[9] = self.protocol;
        buffer[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        buffer[12..16].copy_from_slice(&self.source.octets());
        buffer[16..20].copy_from_slice(&self.destination.octets());

        buffer
    }

    /// Reads the first 20 bytes of `bytes` back into a header.
    ///
    /// Headers carrying options are rejected, since nothing here can build them.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < IP_HEADER_LENGTH {
            return Err(PacketError::Truncated {
                what: "IPv4 header",
                needed: IP_HEADER_LENGTH,
                got: bytes.len(),
            });
        }

        let version = bytes[0] >> 4;
        let ihl = bytes[0] & 0x0f;
        if version != IP_VERSION || ihl != IP_HEADER_WORDS {
            return Err(PacketError::UnsupportedHeader(format!(
                "IPv4 version {version}, header length {ihl} words"
            )));
        }

        let be16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);

        Ok(Ipv4Header {
            version,
            ihl,
            tos: bytes[1],
            total_length: be16(2),
            identification: be16(4),
            flags_fragment: be16(6),
            ttl: bytes[8],
            protocol: bytes[9],
            checksum: be16(10),
            source: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            destination: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        })
    }

    /// True when the header checksum matches the rest of the header.
    pub fn checksum_is_valid(&self) -> bool {
        rfc1071_checksum(&self.to_bytes()) == 0
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn header_length_words(&self) -> u8 {
        self.ihl
    }

    pub fn tos(&self) -> u8 {
        self.tos
    }

    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    pub fn identification(&self) -> u16 {
        self.identification
    }

    pub fn flags_fragment(&self) -> u16 {
        self.flags_fragment
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }
}
