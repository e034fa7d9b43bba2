//! AMT Protocol Wire Layer
//!
//! This crate implements the wire formats an AMT (Automatic Multicast
//! Tunneling, RFC 7450) gateway speaks: the IP packet abstraction used for
//! encapsulated payloads, the seven AMT tunnel messages, IGMPv3/MLDv2
//! membership reports and queries, and IP fragment reassembly.

pub mod ip;
pub mod membership;
pub mod message;
pub mod reassembly;

pub use ip::{AddressFamily, Fragment, IpError, IpPacket, UdpDatagram};
pub use membership::{
    GroupRecord, GroupRecordType, MembershipCodecError, MembershipQuery, MembershipReport,
};
pub use message::{AmtMessage, MessageError, MessageType, ResponseMac, AMT_PORT};
pub use reassembly::{
    Expired, FragmentKey, Reassembler, ReassemblyConfig, ReassemblyError, ReassemblyStats,
};
