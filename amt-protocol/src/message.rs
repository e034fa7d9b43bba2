//! AMT Message Structures and Serialization
//!
//! Implements the seven message types exchanged between an AMT gateway and
//! relay (RFC 7450). Every message starts with a one-byte version/type
//! field; the remaining layout depends on the type.

use crate::ip::{AddressFamily, IpError, IpPacket};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// IANA-assigned AMT UDP port
pub const AMT_PORT: u16 = 2268;

/// Protocol version carried in the high nibble of the first byte
pub const AMT_VERSION: u8 = 0;

/// Length of the response MAC in bytes (48 bits)
pub const MAC_LEN: usize = 6;

/// AMT message errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message truncated ({0} bytes)")]
    Truncated(usize),

    #[error("Unsupported AMT version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown AMT message type: {0}")]
    UnknownType(u8),

    #[error("Invalid relay address length: {0}")]
    InvalidAddressLength(usize),

    #[error("Encapsulated packet: {0}")]
    Encapsulated(#[from] IpError),
}

/// AMT message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RelayDiscovery = 1,
    RelayAdvertisement = 2,
    Request = 3,
    MembershipQuery = 4,
    MembershipUpdate = 5,
    MulticastData = 6,
    Teardown = 7,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::RelayDiscovery),
            2 => Some(MessageType::RelayAdvertisement),
            3 => Some(MessageType::Request),
            4 => Some(MessageType::MembershipQuery),
            5 => Some(MessageType::MembershipUpdate),
            6 => Some(MessageType::MulticastData),
            7 => Some(MessageType::Teardown),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Response MAC issued by the relay in a Membership Query
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResponseMac(pub [u8; MAC_LEN]);

impl fmt::Debug for ResponseMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseMac(")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A decoded AMT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmtMessage {
    /// Gateway → relay-discovery address
    RelayDiscovery { nonce: u32 },
    /// Relay → gateway, echoes the discovery nonce
    RelayAdvertisement { nonce: u32, relay: IpAddr },
    /// Gateway → relay, `family` selects IGMP (IPv4) or MLD (IPv6) queries
    Request { nonce: u32, family: AddressFamily },
    /// Relay → gateway, echoes the request nonce
    MembershipQuery {
        /// L flag: the relay accepts no further membership updates
        limited: bool,
        mac: ResponseMac,
        nonce: u32,
        query: IpPacket,
        /// Relay-observed gateway address (present when the G flag is set)
        gateway: Option<SocketAddr>,
    },
    /// Gateway → relay, encapsulated IGMP/MLD report
    MembershipUpdate {
        mac: ResponseMac,
        nonce: u32,
        report: IpPacket,
    },
    /// Relay → gateway, encapsulated multicast datagram
    MulticastData { packet: IpPacket },
    /// Gateway → relay, ends the session identified by mac/nonce/gateway
    Teardown {
        mac: ResponseMac,
        nonce: u32,
        gateway: SocketAddr,
    },
}

impl AmtMessage {
    /// Message type tag
    pub fn message_type(&self) -> MessageType {
        match self {
            AmtMessage::RelayDiscovery { .. } => MessageType::RelayDiscovery,
            AmtMessage::RelayAdvertisement { .. } => MessageType::RelayAdvertisement,
            AmtMessage::Request { .. } => MessageType::Request,
            AmtMessage::MembershipQuery { .. } => MessageType::MembershipQuery,
            AmtMessage::MembershipUpdate { .. } => MessageType::MembershipUpdate,
            AmtMessage::MulticastData { .. } => MessageType::MulticastData,
            AmtMessage::Teardown { .. } => MessageType::Teardown,
        }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        buf.put_u8((AMT_VERSION << 4) | self.message_type().as_u8());

        match self {
            AmtMessage::RelayDiscovery { nonce } => {
                buf.put_bytes(0, 3);
                buf.put_u32(*nonce);
            }
            AmtMessage::RelayAdvertisement { nonce, relay } => {
                buf.put_bytes(0, 3);
                buf.put_u32(*nonce);
                put_addr(&mut buf, relay);
            }
            AmtMessage::Request { nonce, family } => {
                let p_flag = match family {
                    AddressFamily::Ipv4 => 0,
                    AddressFamily::Ipv6 => 1,
                };
                buf.put_u8(p_flag);
                buf.put_u16(0);
                buf.put_u32(*nonce);
            }
            AmtMessage::MembershipQuery {
                limited,
                mac,
                nonce,
                query,
                gateway,
            } => {
                let mut flags = 0u8;
                if *limited {
                    flags |= 0x02;
                }
                if gateway.is_some() {
                    flags |= 0x01;
                }
                buf.put_u8(flags);
                buf.put_slice(&mac.0);
                buf.put_u32(*nonce);
                buf.put_slice(query.as_bytes());
                if let Some(gateway) = gateway {
                    buf.put_u16(gateway.port());
                    put_addr(&mut buf, &gateway.ip());
                }
            }
            AmtMessage::MembershipUpdate { mac, nonce, report } => {
                buf.put_u8(0);
                buf.put_slice(&mac.0);
                buf.put_u32(*nonce);
                buf.put_slice(report.as_bytes());
            }
            AmtMessage::MulticastData { packet } => {
                buf.put_u8(0);
                buf.put_slice(packet.as_bytes());
            }
            AmtMessage::Teardown { mac, nonce, gateway } => {
                buf.put_u8(0);
                buf.put_slice(&mac.0);
                buf.put_u32(*nonce);
                buf.put_u16(gateway.port());
                // Always 128 bits; IPv4 gateways use the IPv4-mapped form.
                let mapped = match gateway.ip() {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                buf.put_slice(&mapped.octets());
            }
        }

        buf
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            AmtMessage::RelayDiscovery { .. } | AmtMessage::Request { .. } => 8,
            AmtMessage::RelayAdvertisement { .. } => 24,
            AmtMessage::MembershipQuery { query, .. } => 12 + query.len() + 18,
            AmtMessage::MembershipUpdate { report, .. } => 12 + report.len(),
            AmtMessage::MulticastData { packet } => 2 + packet.len(),
            AmtMessage::Teardown { .. } => 30,
        }
    }

    /// Parse from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.is_empty() {
            return Err(MessageError::Truncated(0));
        }

        let version = bytes[0] >> 4;
        if version != AMT_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }

        let raw_type = bytes[0] & 0x0F;
        let message_type =
            MessageType::from_u8(raw_type).ok_or(MessageError::UnknownType(raw_type))?;

        match message_type {
            MessageType::RelayDiscovery => {
                let mut buf = require(bytes, 8)?;
                buf.advance(4);
                Ok(AmtMessage::RelayDiscovery {
                    nonce: buf.get_u32(),
                })
            }
            MessageType::RelayAdvertisement => {
                let mut buf = require(bytes, 8)?;
                buf.advance(4);
                let nonce = buf.get_u32();
                let relay = read_addr(buf)?;
                Ok(AmtMessage::RelayAdvertisement { nonce, relay })
            }
            MessageType::Request => {
                let mut buf = require(bytes, 8)?;
                buf.advance(1);
                let family = if buf.get_u8() & 0x01 != 0 {
                    AddressFamily::Ipv6
                } else {
                    AddressFamily::Ipv4
                };
                buf.advance(2);
                Ok(AmtMessage::Request {
                    nonce: buf.get_u32(),
                    family,
                })
            }
            MessageType::MembershipQuery => {
                let mut buf = require(bytes, 12)?;
                buf.advance(1);
                let flags = buf.get_u8();
                let mac = read_mac(&mut buf);
                let nonce = buf.get_u32();
                let query = IpPacket::from_slice(buf)?;
                let rest = &buf[query.len()..];

                let gateway = if flags & 0x01 != 0 {
                    if rest.len() < 2 {
                        return Err(MessageError::Truncated(bytes.len()));
                    }
                    let port = u16::from_be_bytes([rest[0], rest[1]]);
                    let ip = read_addr(&rest[2..])?;
                    Some(SocketAddr::new(ip, port))
                } else {
                    None
                };

                Ok(AmtMessage::MembershipQuery {
                    limited: flags & 0x02 != 0,
                    mac,
                    nonce,
                    query,
                    gateway,
                })
            }
            MessageType::MembershipUpdate => {
                let mut buf = require(bytes, 12)?;
                buf.advance(2);
                let mac = read_mac(&mut buf);
                let nonce = buf.get_u32();
                let report = IpPacket::from_slice(buf)?;
                Ok(AmtMessage::MembershipUpdate { mac, nonce, report })
            }
            MessageType::MulticastData => {
                let buf = require(bytes, 2)?;
                let packet = IpPacket::from_slice(&buf[2..])?;
                Ok(AmtMessage::MulticastData { packet })
            }
            MessageType::Teardown => {
                let mut buf = require(bytes, 30)?;
                buf.advance(2);
                let mac = read_mac(&mut buf);
                let nonce = buf.get_u32();
                let port = buf.get_u16();
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let v6 = Ipv6Addr::from(octets);
                let ip = match v6.to_ipv4_mapped() {
                    Some(v4) => IpAddr::V4(v4),
                    None => IpAddr::V6(v6),
                };
                Ok(AmtMessage::Teardown {
                    mac,
                    nonce,
                    gateway: SocketAddr::new(ip, port),
                })
            }
        }
    }
}

fn require(bytes: &[u8], len: usize) -> Result<&[u8], MessageError> {
    if bytes.len() < len {
        Err(MessageError::Truncated(bytes.len()))
    } else {
        Ok(bytes)
    }
}

fn read_mac(buf: &mut &[u8]) -> ResponseMac {
    let mut mac = [0u8; MAC_LEN];
    buf.copy_to_slice(&mut mac);
    ResponseMac(mac)
}

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

fn read_addr(bytes: &[u8]) -> Result<IpAddr, MessageError> {
    match bytes.len() {
        4 => Ok(IpAddr::V4(Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(MessageError::InvalidAddressLength(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::UdpDatagram;
    use bytes::Bytes;

    fn sample_packet() -> IpPacket {
        UdpDatagram {
            source: "10.1.1.1".parse().unwrap(),
            source_port: 10,
            destination: "232.0.0.1".parse().unwrap(),
            destination_port: 20,
            payload: Bytes::from_static(b"data"),
        }
        .to_packet(8)
        .unwrap()
    }

    #[test]
    fn test_discovery_layout() {
        let bytes = AmtMessage::RelayDiscovery { nonce: 0xDEADBEEF }.encode();
        assert_eq!(bytes.as_ref(), &[0x01, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_request_p_flag() {
        let bytes = AmtMessage::Request {
            nonce: 7,
            family: AddressFamily::Ipv6,
        }
        .encode();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 0x01);

        let decoded = AmtMessage::decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            AmtMessage::Request {
                nonce: 7,
                family: AddressFamily::Ipv6
            }
        );
    }

    #[test]
    fn test_advertisement_with_v6_relay() {
        let msg = AmtMessage::RelayAdvertisement {
            nonce: 42,
            relay: "2001:db8::5".parse().unwrap(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 24);
        assert_eq!(AmtMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_advertisement_bad_address_length() {
        let mut bytes = AmtMessage::RelayAdvertisement {
            nonce: 1,
            relay: "192.0.2.1".parse().unwrap(),
        }
        .encode();
        bytes.put_u8(0);
        assert_eq!(
            AmtMessage::decode(&bytes),
            Err(MessageError::InvalidAddressLength(5))
        );
    }

    #[test]
    fn test_query_with_gateway_fields() {
        let msg = AmtMessage::MembershipQuery {
            limited: false,
            mac: ResponseMac([1, 2, 3, 4, 5, 6]),
            nonce: 99,
            query: sample_packet(),
            gateway: Some("203.0.113.9:40000".parse().unwrap()),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[1], 0x01);
        assert_eq!(AmtMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_teardown_maps_ipv4_gateway() {
        let msg = AmtMessage::Teardown {
            mac: ResponseMac([9; 6]),
            nonce: 5,
            gateway: "198.51.100.7:1234".parse().unwrap(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 30);
        assert_eq!(&bytes[14..24], &[0u8; 10]);
        assert_eq!(&bytes[24..26], &[0xFF, 0xFF]);
        assert_eq!(AmtMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_and_versioned() {
        assert_eq!(
            AmtMessage::decode(&[0x09, 0, 0, 0]),
            Err(MessageError::UnknownType(9))
        );
        assert_eq!(
            AmtMessage::decode(&[0x11, 0, 0, 0]),
            Err(MessageError::UnsupportedVersion(1))
        );
        assert_eq!(AmtMessage::decode(&[]), Err(MessageError::Truncated(0)));
    }

    #[test]
    fn test_data_carries_packet() {
        let packet = sample_packet();
        let msg = AmtMessage::MulticastData {
            packet: packet.clone(),
        };
        match AmtMessage::decode(&msg.encode()).unwrap() {
            AmtMessage::MulticastData { packet: decoded } => assert_eq!(decoded, packet),
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..256)) {
            let _ = AmtMessage::decode(&bytes);
        }

        #[test]
        fn prop_truncated_data_is_rejected(cut in 0usize..28) {
            let encoded = AmtMessage::MulticastData { packet: sample_packet() }.encode();
            let cut = cut.min(encoded.len() - 1);
            proptest::prop_assert!(AmtMessage::decode(&encoded[..cut]).is_err());
        }
    }
}
