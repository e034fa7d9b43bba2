//! IP packet abstraction
//!
//! Parses just enough of an IPv4 or IPv6 datagram to demultiplex traffic
//! carried through the tunnel: addresses, upper-layer protocol and the
//! fragmentation fields. Also provides the builders used to originate
//! membership reports and to split datagrams into fragments.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// IPv6 hop-by-hop options header
pub const PROTO_HOP_BY_HOP: u8 = 0;
/// Internet Group Management Protocol
pub const PROTO_IGMP: u8 = 2;
/// User Datagram Protocol
pub const PROTO_UDP: u8 = 17;
/// IPv6 routing header
pub const PROTO_ROUTING: u8 = 43;
/// IPv6 fragment header
pub const PROTO_FRAGMENT: u8 = 44;
/// ICMPv6 (carries MLD)
pub const PROTO_ICMPV6: u8 = 58;
/// IPv6 destination options header
pub const PROTO_DEST_OPTS: u8 = 60;

/// Minimum IPv4 header size
pub const IPV4_HEADER_SIZE: usize = 20;
/// Fixed IPv6 header size
pub const IPV6_HEADER_SIZE: usize = 40;
/// IPv6 fragment extension header size
pub const IPV6_FRAGMENT_HEADER_SIZE: usize = 8;
/// Largest datagram either family can describe in its length field
pub const MAX_DATAGRAM_SIZE: usize = 65535;

const IPV4_MORE_FRAGMENTS: u16 = 0x2000;
const IPV4_DONT_FRAGMENT: u16 = 0x4000;
const IPV4_OFFSET_MASK: u16 = 0x1FFF;
const UDP_HEADER_SIZE: usize = 8;

/// IP parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpError {
    #[error("Packet truncated ({0} bytes)")]
    Truncated(usize),

    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid header length")]
    InvalidHeaderLength,

    #[error("Malformed IPv6 extension header")]
    MalformedExtension,

    #[error("Datagram exceeds {MAX_DATAGRAM_SIZE} bytes")]
    TooLarge,

    #[error("Not a UDP datagram")]
    NotUdp,

    #[error("Source and destination address families differ")]
    FamilyMismatch,
}

/// Address family of a tunnel session
///
/// IPv4 sessions carry IGMP membership traffic, IPv6 sessions carry MLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// The unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// IP version number
    pub fn version(self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Fragmentation fields of a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Fragment offset in 8-byte units
    pub offset: u16,
    /// More-fragments flag
    pub more: bool,
    /// Identification (16 bits for IPv4, 32 bits for IPv6)
    pub identification: u32,
}

impl Fragment {
    /// Byte offset of the fragment data within the original payload
    pub fn byte_offset(&self) -> usize {
        self.offset as usize * 8
    }
}

/// A parsed IPv4 or IPv6 datagram
#[derive(Clone, PartialEq, Eq)]
pub struct IpPacket {
    data: Bytes,
    family: AddressFamily,
    source: IpAddr,
    destination: IpAddr,
    /// Upper-layer protocol, after any IPv6 extension headers
    protocol: u8,
    /// Bytes that are repeated in every fragment
    unfragmentable_len: usize,
    /// Start of the upper-layer payload (or fragment data)
    payload_offset: usize,
    /// Index of the byte naming the header that follows the unfragmentable part
    next_header_index: usize,
    fragment: Option<Fragment>,
}

impl IpPacket {
    /// Parse a datagram, truncating any trailing bytes beyond its length field
    pub fn parse(data: Bytes) -> Result<Self, IpError> {
        if data.is_empty() {
            return Err(IpError::Truncated(0));
        }

        match data[0] >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(IpError::UnsupportedVersion(v)),
        }
    }

    /// Parse from a borrowed slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IpError> {
        Self::parse(Bytes::copy_from_slice(bytes))
    }

    fn parse_v4(data: Bytes) -> Result<Self, IpError> {
        if data.len() < IPV4_HEADER_SIZE {
            return Err(IpError::Truncated(data.len()));
        }

        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_HEADER_SIZE {
            return Err(IpError::InvalidHeaderLength);
        }

        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < ihl {
            return Err(IpError::InvalidHeaderLength);
        }
        if data.len() < total_len {
            return Err(IpError::Truncated(data.len()));
        }
        let data = data.slice(..total_len);

        let identification = u16::from_be_bytes([data[4], data[5]]) as u32;
        let flags_offset = u16::from_be_bytes([data[6], data[7]]);
        let more = flags_offset & IPV4_MORE_FRAGMENTS != 0;
        let offset = flags_offset & IPV4_OFFSET_MASK;
        let fragment = if more || offset != 0 {
            Some(Fragment {
                offset,
                more,
                identification,
            })
        } else {
            None
        };

        let source = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
        let destination = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));

        Ok(IpPacket {
            protocol: data[9],
            data,
            family: AddressFamily::Ipv4,
            source,
            destination,
            unfragmentable_len: ihl,
            payload_offset: ihl,
            next_header_index: 9,
            fragment,
        })
    }

    fn parse_v6(data: Bytes) -> Result<Self, IpError> {
        if data.len() < IPV6_HEADER_SIZE {
            return Err(IpError::Truncated(data.len()));
        }

        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let total_len = IPV6_HEADER_SIZE + payload_len;
        if data.len() < total_len {
            return Err(IpError::Truncated(data.len()));
        }
        let data = data.slice(..total_len);

        let mut src = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&data[24..40]);

        let mut next = data[6];
        let mut next_header_index = 6;
        let mut offset = IPV6_HEADER_SIZE;
        let mut fragment = None;
        let mut payload_offset = offset;

        loop {
            match next {
                PROTO_HOP_BY_HOP | PROTO_ROUTING | PROTO_DEST_OPTS => {
                    if data.len() < offset + 2 {
                        return Err(IpError::MalformedExtension);
                    }
                    let len = (data[offset + 1] as usize + 1) * 8;
                    if data.len() < offset + len {
                        return Err(IpError::MalformedExtension);
                    }
                    next_header_index = offset;
                    next = data[offset];
                    offset += len;
                }
                PROTO_FRAGMENT => {
                    if data.len() < offset + IPV6_FRAGMENT_HEADER_SIZE {
                        return Err(IpError::MalformedExtension);
                    }
                    let off_flags = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                    let identification = u32::from_be_bytes([
                        data[offset + 4],
                        data[offset + 5],
                        data[offset + 6],
                        data[offset + 7],
                    ]);
                    fragment = Some(Fragment {
                        offset: off_flags >> 3,
                        more: off_flags & 1 != 0,
                        identification,
                    });
                    next = data[offset];
                    payload_offset = offset + IPV6_FRAGMENT_HEADER_SIZE;
                    break;
                }
                _ => {
                    payload_offset = offset;
                    break;
                }
            }
        }

        // For a fragment, the unfragmentable part ends where the fragment header begins.
        let unfragmentable_len = if fragment.is_some() {
            payload_offset - IPV6_FRAGMENT_HEADER_SIZE
        } else {
            payload_offset
        };

        Ok(IpPacket {
            data,
            family: AddressFamily::Ipv6,
            source: IpAddr::V6(Ipv6Addr::from(src)),
            destination: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: next,
            unfragmentable_len,
            payload_offset,
            next_header_index,
            fragment,
        })
    }

    /// Build an IPv4 datagram
    ///
    /// `options` is padded with zeros to a multiple of four bytes.
    pub fn build_v4(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        options: &[u8],
        payload: &[u8],
    ) -> Result<Self, IpError> {
        let padded_options = (options.len() + 3) & !3;
        let ihl = IPV4_HEADER_SIZE + padded_options;
        if ihl > 60 {
            return Err(IpError::InvalidHeaderLength);
        }
        let total_len = ihl + payload.len();
        if total_len > MAX_DATAGRAM_SIZE {
            return Err(IpError::TooLarge);
        }

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u8(0x40 | (ihl / 4) as u8);
        buf.put_u8(0); // DSCP/ECN
        buf.put_u16(total_len as u16);
        buf.put_u16(0); // identification
        buf.put_u16(0); // flags/offset
        buf.put_u8(ttl);
        buf.put_u8(protocol);
        buf.put_u16(0); // checksum placeholder
        buf.put_slice(&source.octets());
        buf.put_slice(&destination.octets());
        buf.put_slice(options);
        buf.put_bytes(0, padded_options - options.len());

        let checksum = checksum(&buf[..ihl]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf.put_slice(payload);

        Self::parse(buf.freeze())
    }

    /// Build an IPv6 datagram, optionally preceded by a hop-by-hop options header
    ///
    /// `hop_by_hop` holds the option TLVs only; the header is padded with PadN.
    pub fn build_v6(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        next_header: u8,
        hop_limit: u8,
        hop_by_hop: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<Self, IpError> {
        let mut ext = BytesMut::new();
        let first_header = match hop_by_hop {
            Some(options) => {
                let unpadded = 2 + options.len();
                let len = (unpadded + 7) & !7;
                ext.put_u8(next_header);
                ext.put_u8((len / 8 - 1) as u8);
                ext.put_slice(options);
                put_padding(&mut ext, len - unpadded);
                PROTO_HOP_BY_HOP
            }
            None => next_header,
        };

        let payload_len = ext.len() + payload.len();
        if payload_len > MAX_DATAGRAM_SIZE {
            return Err(IpError::TooLarge);
        }

        let mut buf = BytesMut::with_capacity(IPV6_HEADER_SIZE + payload_len);
        buf.put_u32(0x6000_0000);
        buf.put_u16(payload_len as u16);
        buf.put_u8(first_header);
        buf.put_u8(hop_limit);
        buf.put_slice(&source.octets());
        buf.put_slice(&destination.octets());
        buf.put_slice(&ext);
        buf.put_slice(payload);

        Self::parse(buf.freeze())
    }

    /// Rebuild a complete datagram from the first fragment's header and the
    /// reassembled payload
    pub fn reassembled(first: &IpPacket, payload: &[u8]) -> Result<Self, IpError> {
        let header = &first.data[..first.unfragmentable_len];
        let total_len = header.len() + payload.len();
        if total_len > MAX_DATAGRAM_SIZE + IPV6_HEADER_SIZE
            || (first.family == AddressFamily::Ipv4 && total_len > MAX_DATAGRAM_SIZE)
        {
            return Err(IpError::TooLarge);
        }

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_slice(header);

        match first.family {
            AddressFamily::Ipv4 => {
                buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
                let flags = u16::from_be_bytes([buf[6], buf[7]]) & IPV4_DONT_FRAGMENT;
                buf[6..8].copy_from_slice(&flags.to_be_bytes());
                buf[10..12].copy_from_slice(&[0, 0]);
                let sum = checksum(&buf[..header.len()]);
                buf[10..12].copy_from_slice(&sum.to_be_bytes());
            }
            AddressFamily::Ipv6 => {
                let payload_len = total_len - IPV6_HEADER_SIZE;
                if payload_len > MAX_DATAGRAM_SIZE {
                    return Err(IpError::TooLarge);
                }
                buf[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
                buf[first.next_header_index] = first.protocol;
            }
        }

        buf.put_slice(payload);
        Self::parse(buf.freeze())
    }

    /// Split this datagram into fragments carrying at most `max_payload`
    /// bytes of fragment data each (rounded down to a multiple of eight)
    pub fn fragment(&self, identification: u32, max_payload: usize) -> Vec<IpPacket> {
        let chunk = (max_payload & !7).max(8);
        let payload = self.payload();
        if self.fragment.is_some() || payload.len() <= chunk {
            return vec![self.clone()];
        }

        let header = &self.data[..self.payload_offset];
        let mut fragments = Vec::with_capacity(payload.len() / chunk + 1);
        let mut pos = 0;

        while pos < payload.len() {
            let end = (pos + chunk).min(payload.len());
            let more = end < payload.len();
            let offset = (pos / 8) as u16;
            let mut buf = BytesMut::with_capacity(header.len() + 8 + (end - pos));
            buf.put_slice(header);

            match self.family {
                AddressFamily::Ipv4 => {
                    let total = header.len() + (end - pos);
                    buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
                    buf[4..6].copy_from_slice(&(identification as u16).to_be_bytes());
                    let mut flags = offset & IPV4_OFFSET_MASK;
                    if more {
                        flags |= IPV4_MORE_FRAGMENTS;
                    }
                    buf[6..8].copy_from_slice(&flags.to_be_bytes());
                    buf[10..12].copy_from_slice(&[0, 0]);
                    let sum = checksum(&buf[..header.len()]);
                    buf[10..12].copy_from_slice(&sum.to_be_bytes());
                }
                AddressFamily::Ipv6 => {
                    buf[self.next_header_index] = PROTO_FRAGMENT;
                    let payload_len = header.len() - IPV6_HEADER_SIZE
                        + IPV6_FRAGMENT_HEADER_SIZE
                        + (end - pos);
                    buf[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
                    buf.put_u8(self.protocol);
                    buf.put_u8(0);
                    buf.put_u16((offset << 3) | more as u16);
                    buf.put_u32(identification);
                }
            }

            buf.put_slice(&payload[pos..end]);
            // The header came from a datagram that parsed, so only a length
            // overflow could fail here and chunking rules that out.
            if let Ok(packet) = Self::parse(buf.freeze()) {
                fragments.push(packet);
            }
            pos = end;
        }

        fragments
    }

    /// Raw datagram bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Total datagram length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the datagram holds no bytes (never true for a parsed packet)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address family
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// IP version number (4 or 6)
    pub fn version(&self) -> u8 {
        self.family.version()
    }

    /// Source address
    pub fn source(&self) -> IpAddr {
        self.source
    }

    /// Destination address
    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Upper-layer protocol number
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Fragmentation fields, if this datagram is a fragment
    pub fn fragment_info(&self) -> Option<Fragment> {
        self.fragment
    }

    /// Whether this datagram is a fragment
    pub fn is_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// Upper-layer payload, or the fragment data for a fragment
    pub fn payload(&self) -> Bytes {
        self.data.slice(self.payload_offset..)
    }

    /// Header bytes repeated in every fragment
    pub fn unfragmentable_header(&self) -> &[u8] {
        &self.data[..self.unfragmentable_len]
    }

    /// Hop limit (IPv6) or time to live (IPv4)
    pub fn hop_limit(&self) -> u8 {
        match self.family {
            AddressFamily::Ipv4 => self.data[8],
            AddressFamily::Ipv6 => self.data[7],
        }
    }
}

impl fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpPacket")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("protocol", &self.protocol)
            .field("len", &self.data.len())
            .field("fragment", &self.fragment)
            .finish()
    }
}

fn put_padding(buf: &mut BytesMut, len: usize) {
    match len {
        0 => {}
        1 => buf.put_u8(0), // Pad1
        n => {
            buf.put_u8(1); // PadN
            buf.put_u8((n - 2) as u8);
            buf.put_bytes(0, n - 2);
        }
    }
}

/// A UDP datagram carried inside an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub payload: Bytes,
}

impl UdpDatagram {
    /// Extract the UDP datagram from a complete (unfragmented) packet
    pub fn parse(packet: &IpPacket) -> Result<Self, IpError> {
        if packet.protocol() != PROTO_UDP || packet.is_fragment() {
            return Err(IpError::NotUdp);
        }

        let segment = packet.payload();
        if segment.len() < UDP_HEADER_SIZE {
            return Err(IpError::Truncated(segment.len()));
        }

        let length = u16::from_be_bytes([segment[4], segment[5]]) as usize;
        let end = if length >= UDP_HEADER_SIZE && length <= segment.len() {
            length
        } else {
            segment.len()
        };

        Ok(UdpDatagram {
            source: packet.source(),
            source_port: u16::from_be_bytes([segment[0], segment[1]]),
            destination: packet.destination(),
            destination_port: u16::from_be_bytes([segment[2], segment[3]]),
            payload: segment.slice(UDP_HEADER_SIZE..end),
        })
    }

    /// Wrap this datagram in an IP packet with a valid UDP checksum
    pub fn to_packet(&self, ttl: u8) -> Result<IpPacket, IpError> {
        let length = UDP_HEADER_SIZE + self.payload.len();
        if length > MAX_DATAGRAM_SIZE {
            return Err(IpError::TooLarge);
        }

        let mut segment = BytesMut::with_capacity(length);
        segment.put_u16(self.source_port);
        segment.put_u16(self.destination_port);
        segment.put_u16(length as u16);
        segment.put_u16(0);
        segment.put_slice(&self.payload);

        let mut sum = Checksum::new();
        sum.add_pseudo_header(&self.source, &self.destination, PROTO_UDP, length)?;
        sum.add_bytes(&segment);
        let value = match sum.finish() {
            0 => 0xFFFF,
            v => v,
        };
        segment[6..8].copy_from_slice(&value.to_be_bytes());

        match (self.source, self.destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                IpPacket::build_v4(src, dst, PROTO_UDP, ttl, &[], &segment)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                IpPacket::build_v6(src, dst, PROTO_UDP, ttl, None, &segment)
            }
            _ => Err(IpError::FamilyMismatch),
        }
    }
}

/// Ones'-complement Internet checksum accumulator
#[derive(Debug, Default, Clone)]
pub struct Checksum {
    sum: u64,
    odd: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; odd lengths carry over into the next call
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut bytes = bytes;
        if let Some(high) = self.odd.take() {
            if let Some((&low, rest)) = bytes.split_first() {
                self.sum += u16::from_be_bytes([high, low]) as u64;
                bytes = rest;
            } else {
                self.odd = Some(high);
                return;
            }
        }

        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.sum += u16::from_be_bytes([pair[0], pair[1]]) as u64;
        }
        if let [last] = chunks.remainder() {
            self.odd = Some(*last);
        }
    }

    /// Feed the transport pseudo-header for `protocol`
    pub fn add_pseudo_header(
        &mut self,
        source: &IpAddr,
        destination: &IpAddr,
        protocol: u8,
        length: usize,
    ) -> Result<(), IpError> {
        match (source, destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                self.add_bytes(&src.octets());
                self.add_bytes(&dst.octets());
                self.add_bytes(&[0, protocol]);
                self.add_bytes(&(length as u16).to_be_bytes());
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                self.add_bytes(&src.octets());
                self.add_bytes(&dst.octets());
                self.add_bytes(&(length as u32).to_be_bytes());
                self.add_bytes(&[0, 0, 0, protocol]);
            }
            _ => return Err(IpError::FamilyMismatch),
        }
        Ok(())
    }

    /// Fold and complement
    pub fn finish(mut self) -> u16 {
        if let Some(high) = self.odd.take() {
            self.sum += u16::from_be_bytes([high, 0]) as u64;
        }
        let mut sum = self.sum;
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Internet checksum of a single buffer
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_bytes(bytes);
    sum.finish()
}
