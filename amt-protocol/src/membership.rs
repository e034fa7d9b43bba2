//! IGMP / MLD membership messages
//!
//! Encodes IGMPv3 (RFC 3376) and MLDv2 (RFC 3810) membership reports and
//! decodes the queries a relay encapsulates in Membership Query messages.
//! Older query versions (IGMPv1/v2, MLDv1) are accepted and mapped onto the
//! same structure with default robustness and interval values.

use crate::ip::{
    AddressFamily, Checksum, IpError, IpPacket, PROTO_ICMPV6, PROTO_IGMP,
};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;

/// IGMP membership query type
pub const IGMP_QUERY: u8 = 0x11;
/// IGMPv3 membership report type
pub const IGMP_V3_REPORT: u8 = 0x22;
/// MLD listener query type
pub const MLD_QUERY: u8 = 130;
/// MLDv2 listener report type
pub const MLD_V2_REPORT: u8 = 143;

/// Destination of IGMPv3 reports (all IGMPv3-capable routers)
pub const IGMP_V3_REPORT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);
/// Destination of MLDv2 reports (all MLDv2-capable routers)
pub const MLD_V2_REPORT_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

/// Robustness variable assumed when a query does not carry one
pub const DEFAULT_ROBUSTNESS: u8 = 2;
/// Query interval assumed when a query does not carry one
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(125);

const IPV4_ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
const IPV6_ROUTER_ALERT: [u8; 4] = [0x05, 0x02, 0x00, 0x00];

/// Membership codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipCodecError {
    #[error("Message truncated ({0} bytes)")]
    Truncated(usize),

    #[error("Not a membership message (protocol {protocol}, type {message_type})")]
    NotMembership { protocol: u8, message_type: u8 },

    #[error("Checksum mismatch")]
    BadChecksum,

    #[error("Unknown group record type: {0}")]
    UnknownRecordType(u8),

    #[error("Address family mismatch")]
    FamilyMismatch,

    #[error("IP error: {0}")]
    Ip(#[from] IpError),
}

/// Group record types (identical numbering for IGMPv3 and MLDv2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GroupRecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToIncludeMode = 3,
    ChangeToExcludeMode = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl GroupRecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(GroupRecordType::ModeIsInclude),
            2 => Some(GroupRecordType::ModeIsExclude),
            3 => Some(GroupRecordType::ChangeToIncludeMode),
            4 => Some(GroupRecordType::ChangeToExcludeMode),
            5 => Some(GroupRecordType::AllowNewSources),
            6 => Some(GroupRecordType::BlockOldSources),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One group record inside a membership report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: GroupRecordType,
    pub group: IpAddr,
    pub sources: Vec<IpAddr>,
}

impl GroupRecord {
    pub fn new(record_type: GroupRecordType, group: IpAddr, sources: &BTreeSet<IpAddr>) -> Self {
        GroupRecord {
            record_type,
            group,
            sources: sources.iter().copied().collect(),
        }
    }

    /// Whether this record leaves the reporter receiving something for the group
    pub fn describes_reception(&self) -> bool {
        match self.record_type {
            GroupRecordType::ModeIsExclude | GroupRecordType::ChangeToExcludeMode => true,
            GroupRecordType::ModeIsInclude
            | GroupRecordType::ChangeToIncludeMode
            | GroupRecordType::AllowNewSources => !self.sources.is_empty(),
            GroupRecordType::BlockOldSources => false,
        }
    }
}

/// IGMPv3 / MLDv2 membership report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipReport {
    pub family: AddressFamily,
    pub records: Vec<GroupRecord>,
}

impl MembershipReport {
    pub fn new(family: AddressFamily) -> Self {
        MembershipReport {
            family,
            records: Vec::new(),
        }
    }

    pub fn with_records(family: AddressFamily, records: Vec<GroupRecord>) -> Self {
        MembershipReport { family, records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether any record describes non-empty reception state
    pub fn describes_reception(&self) -> bool {
        self.records.iter().any(GroupRecord::describes_reception)
    }

    /// Encode as an IP packet addressed to the all-routers report group
    pub fn to_packet(&self, source: IpAddr) -> Result<IpPacket, MembershipCodecError> {
        if AddressFamily::of(&source) != self.family
            || self
                .records
                .iter()
                .any(|r| AddressFamily::of(&r.group) != self.family)
        {
            return Err(MembershipCodecError::FamilyMismatch);
        }

        let mut body = BytesMut::new();
        match self.family {
            AddressFamily::Ipv4 => body.put_u8(IGMP_V3_REPORT),
            AddressFamily::Ipv6 => body.put_u8(MLD_V2_REPORT),
        }
        body.put_u8(0);
        body.put_u16(0); // checksum
        body.put_u16(0);
        body.put_u16(self.records.len() as u16);

        for record in &self.records {
            body.put_u8(record.record_type.as_u8());
            body.put_u8(0); // aux data len
            body.put_u16(record.sources.len() as u16);
            put_addr(&mut body, &record.group);
            for source in &record.sources {
                put_addr(&mut body, source);
            }
        }

        match (source, self.family) {
            (IpAddr::V4(src), AddressFamily::Ipv4) => {
                let sum = crate::ip::checksum(&body);
                body[2..4].copy_from_slice(&sum.to_be_bytes());
                Ok(IpPacket::build_v4(
                    src,
                    IGMP_V3_REPORT_GROUP,
                    PROTO_IGMP,
                    1,
                    &IPV4_ROUTER_ALERT,
                    &body,
                )?)
            }
            (IpAddr::V6(src), AddressFamily::Ipv6) => {
                let dst = IpAddr::V6(MLD_V2_REPORT_GROUP);
                let mut sum = Checksum::new();
                sum.add_pseudo_header(&source, &dst, PROTO_ICMPV6, body.len())?;
                sum.add_bytes(&body);
                body[2..4].copy_from_slice(&sum.finish().to_be_bytes());
                Ok(IpPacket::build_v6(
                    src,
                    MLD_V2_REPORT_GROUP,
                    PROTO_ICMPV6,
                    1,
                    Some(&IPV6_ROUTER_ALERT),
                    &body,
                )?)
            }
            _ => Err(MembershipCodecError::FamilyMismatch),
        }
    }

    /// Decode a report packet
    pub fn from_packet(packet: &IpPacket) -> Result<Self, MembershipCodecError> {
        let body = membership_body(packet, IGMP_V3_REPORT, MLD_V2_REPORT)?;
        let family = packet.family();
        let addr_len = addr_len(family);

        let mut buf = &body[4..];
        if buf.len() < 4 {
            return Err(MembershipCodecError::Truncated(body.len()));
        }
        buf.advance(2);
        let count = buf.get_u16() as usize;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.len() < 4 + addr_len {
                return Err(MembershipCodecError::Truncated(body.len()));
            }
            let raw_type = buf.get_u8();
            let record_type = GroupRecordType::from_u8(raw_type)
                .ok_or(MembershipCodecError::UnknownRecordType(raw_type))?;
            let aux_len = buf.get_u8() as usize * 4;
            let num_sources = buf.get_u16() as usize;
            let group = get_addr(&mut buf, family);

            if buf.len() < num_sources * addr_len + aux_len {
                return Err(MembershipCodecError::Truncated(body.len()));
            }
            let sources = (0..num_sources).map(|_| get_addr(&mut buf, family)).collect();
            buf.advance(aux_len);

            records.push(GroupRecord {
                record_type,
                group,
                sources,
            });
        }

        Ok(MembershipReport { family, records })
    }
}

/// A membership query (general, group-specific or group-and-source-specific)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    pub family: AddressFamily,
    /// Upper bound on the randomized response delay
    pub max_response_delay: Duration,
    /// Queried group, `None` for a general query
    pub group: Option<IpAddr>,
    /// S flag
    pub suppress_router_processing: bool,
    /// Querier's robustness variable, 0 if unspecified
    pub robustness: u8,
    /// Querier's query interval, zero if unspecified
    pub query_interval: Duration,
    pub sources: Vec<IpAddr>,
}

impl MembershipQuery {
    /// A general query with the default robustness and interval
    pub fn general(family: AddressFamily, max_response_delay: Duration) -> Self {
        MembershipQuery {
            family,
            max_response_delay,
            group: None,
            suppress_router_processing: false,
            robustness: DEFAULT_ROBUSTNESS,
            query_interval: DEFAULT_QUERY_INTERVAL,
            sources: Vec::new(),
        }
    }

    /// A group-specific (empty `sources`) or group-and-source-specific query
    pub fn group_specific(
        group: IpAddr,
        sources: Vec<IpAddr>,
        max_response_delay: Duration,
    ) -> Self {
        MembershipQuery {
            group: Some(group),
            sources,
            ..Self::general(AddressFamily::of(&group), max_response_delay)
        }
    }

    pub fn is_general(&self) -> bool {
        self.group.is_none()
    }

    /// Encode as an IGMPv3 / MLDv2 query packet
    pub fn to_packet(
        &self,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<IpPacket, MembershipCodecError> {
        if AddressFamily::of(&source) != self.family
            || AddressFamily::of(&destination) != self.family
        {
            return Err(MembershipCodecError::FamilyMismatch);
        }

        let group = self.group.unwrap_or_else(|| self.family.unspecified());
        let mut flags = self.robustness.min(7);
        if self.suppress_router_processing {
            flags |= 0x08;
        }
        let qqic = encode_exponential_u8(self.query_interval.as_secs());

        let mut body = BytesMut::new();
        match self.family {
            AddressFamily::Ipv4 => {
                let tenths = self.max_response_delay.as_millis() / 100;
                body.put_u8(IGMP_QUERY);
                body.put_u8(encode_exponential_u8(tenths as u64));
                body.put_u16(0);
            }
            AddressFamily::Ipv6 => {
                body.put_u8(MLD_QUERY);
                body.put_u8(0);
                body.put_u16(0);
                body.put_u16(encode_exponential_u16(
                    self.max_response_delay.as_millis() as u64,
                ));
                body.put_u16(0);
            }
        }
        put_addr(&mut body, &group);
        body.put_u8(flags);
        body.put_u8(qqic);
        body.put_u16(self.sources.len() as u16);
        for source in &self.sources {
            put_addr(&mut body, source);
        }

        match (source, destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let sum = crate::ip::checksum(&body);
                body[2..4].copy_from_slice(&sum.to_be_bytes());
                Ok(IpPacket::build_v4(
                    src,
                    dst,
                    PROTO_IGMP,
                    1,
                    &IPV4_ROUTER_ALERT,
                    &body,
                )?)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let mut sum = Checksum::new();
                sum.add_pseudo_header(&source, &destination, PROTO_ICMPV6, body.len())?;
                sum.add_bytes(&body);
                body[2..4].copy_from_slice(&sum.finish().to_be_bytes());
                Ok(IpPacket::build_v6(
                    src,
                    dst,
                    PROTO_ICMPV6,
                    1,
                    Some(&IPV6_ROUTER_ALERT),
                    &body,
                )?)
            }
            _ => Err(MembershipCodecError::FamilyMismatch),
        }
    }

    /// Decode a query packet of any IGMP or MLD version
    pub fn from_packet(packet: &IpPacket) -> Result<Self, MembershipCodecError> {
        let body = membership_body(packet, IGMP_QUERY, MLD_QUERY)?;
        let family = packet.family();

        match family {
            AddressFamily::Ipv4 => Self::decode_igmp(&body),
            AddressFamily::Ipv6 => Self::decode_mld(&body),
        }
    }

    fn decode_igmp(body: &[u8]) -> Result<Self, MembershipCodecError> {
        if body.len() < 8 {
            return Err(MembershipCodecError::Truncated(body.len()));
        }
        let code = body[1];
        let group = IpAddr::V4(Ipv4Addr::new(body[4], body[5], body[6], body[7]));
        let group = (!group.is_unspecified()).then_some(group);

        if body.len() < 12 {
            // IGMPv1 (code 0 means 10 s) or IGMPv2
            let tenths = if code == 0 { 100 } else { code as u64 };
            return Ok(MembershipQuery {
                max_response_delay: Duration::from_millis(tenths * 100),
                group,
                ..Self::general(AddressFamily::Ipv4, Duration::ZERO)
            });
        }

        let mut buf = &body[8..];
        let flags = buf.get_u8();
        let qqic = buf.get_u8();
        let num_sources = buf.get_u16() as usize;
        if buf.len() < num_sources * 4 {
            return Err(MembershipCodecError::Truncated(body.len()));
        }
        let sources = (0..num_sources)
            .map(|_| get_addr(&mut buf, AddressFamily::Ipv4))
            .collect();

        Ok(MembershipQuery {
            family: AddressFamily::Ipv4,
            max_response_delay: Duration::from_millis(decode_exponential_u8(code) * 100),
            group,
            suppress_router_processing: flags & 0x08 != 0,
            robustness: flags & 0x07,
            query_interval: Duration::from_secs(decode_exponential_u8(qqic)),
            sources,
        })
    }

    fn decode_mld(body: &[u8]) -> Result<Self, MembershipCodecError> {
        if body.len() < 24 {
            return Err(MembershipCodecError::Truncated(body.len()));
        }
        let code = u16::from_be_bytes([body[4], body[5]]);
        let mut buf = &body[8..];
        let group = get_addr(&mut buf, AddressFamily::Ipv6);
        let group = (!group.is_unspecified()).then_some(group);

        if body.len() < 28 {
            // MLDv1: plain milliseconds
            return Ok(MembershipQuery {
                max_response_delay: Duration::from_millis(code as u64),
                group,
                ..Self::general(AddressFamily::Ipv6, Duration::ZERO)
            });
        }

        let flags = buf.get_u8();
        let qqic = buf.get_u8();
        let num_sources = buf.get_u16() as usize;
        if buf.len() < num_sources * 16 {
            return Err(MembershipCodecError::Truncated(body.len()));
        }
        let sources = (0..num_sources)
            .map(|_| get_addr(&mut buf, AddressFamily::Ipv6))
            .collect();

        Ok(MembershipQuery {
            family: AddressFamily::Ipv6,
            max_response_delay: Duration::from_millis(decode_exponential_u16(code)),
            group,
            suppress_router_processing: flags & 0x08 != 0,
            robustness: flags & 0x07,
            query_interval: Duration::from_secs(decode_exponential_u8(qqic)),
            sources,
        })
    }
}

/// Validate protocol, type and checksum; return the IGMP/ICMPv6 message
fn membership_body(
    packet: &IpPacket,
    igmp_type: u8,
    mld_type: u8,
) -> Result<bytes::Bytes, MembershipCodecError> {
    let body = packet.payload();
    if packet.is_fragment() || body.len() < 4 {
        return Err(MembershipCodecError::Truncated(body.len()));
    }

    let (expected_protocol, expected_type) = match packet.family() {
        AddressFamily::Ipv4 => (PROTO_IGMP, igmp_type),
        AddressFamily::Ipv6 => (PROTO_ICMPV6, mld_type),
    };
    if packet.protocol() != expected_protocol || body[0] != expected_type {
        return Err(MembershipCodecError::NotMembership {
            protocol: packet.protocol(),
            message_type: body[0],
        });
    }

    let mut sum = Checksum::new();
    if packet.family() == AddressFamily::Ipv6 {
        sum.add_pseudo_header(
            &packet.source(),
            &packet.destination(),
            PROTO_ICMPV6,
            body.len(),
        )?;
    }
    sum.add_bytes(&body);
    if sum.finish() != 0 {
        return Err(MembershipCodecError::BadChecksum);
    }

    Ok(body)
}

fn addr_len(family: AddressFamily) -> usize {
    match family {
        AddressFamily::Ipv4 => 4,
        AddressFamily::Ipv6 => 16,
    }
}

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

/// Callers check the remaining length first.
fn get_addr(buf: &mut &[u8], family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::from(buf.get_u32())),
        AddressFamily::Ipv6 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// 8-bit floating point code (IGMPv3 Max Resp Code, QQIC)
pub fn decode_exponential_u8(code: u8) -> u64 {
    if code < 0x80 {
        code as u64
    } else {
        let exp = (code >> 4) & 0x07;
        let mant = (code & 0x0F) as u64;
        (mant | 0x10) << (exp + 3)
    }
}

pub fn encode_exponential_u8(value: u64) -> u8 {
    if value < 0x80 {
        return value as u8;
    }
    for exp in 0u8..8 {
        let mant = value >> (exp + 3);
        if mant < 0x20 {
            return 0x80 | (exp << 4) | ((mant as u8) & 0x0F);
        }
    }
    0xFF
}

/// 16-bit floating point code (MLDv2 Maximum Response Code)
pub fn decode_exponential_u16(code: u16) -> u64 {
    if code < 0x8000 {
        code as u64
    } else {
        let exp = (code >> 12) & 0x07;
        let mant = (code & 0x0FFF) as u64;
        (mant | 0x1000) << (exp + 3)
    }
}

pub fn encode_exponential_u16(value: u64) -> u16 {
    if value < 0x8000 {
        return value as u16;
    }
    for exp in 0u16..8 {
        let mant = value >> (exp + 3);
        if mant < 0x2000 {
            return 0x8000 | (exp << 12) | ((mant as u16) & 0x0FFF);
        }
    }
    0xFFFF
}
