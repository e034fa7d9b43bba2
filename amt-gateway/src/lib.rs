//! AMT Gateway Core
//!
//! This crate implements the gateway side of Automatic Multicast Tunneling:
//! the relay handshake engine, the per-interface membership aggregator, the
//! channel fan-out tree and the reference-counted interface registry.

pub mod aggregator;
pub mod channel;
pub mod gateway;
pub mod interface;
pub mod registry;
pub mod session;
pub mod tunnel;

pub use aggregator::{
    FilterMode, MembershipAggregator, MembershipConfig, MembershipControl, MembershipError,
    QueryResponseMode, ReportSender, SourceFilter,
};
pub use channel::{ChannelError, ChannelStats, ChannelTree, DatagramSink, SinkError, SinkId};
pub use gateway::{
    udp_transport, Gateway, GatewayConfig, GatewayError, InterfaceLease, RelayHandle,
    Subscription, TransportFactory,
};
pub use interface::{InterfaceKey, InterfaceStats, PacketSink, TunnelInterface};
pub use registry::{Lease, Registry, Shared};
pub use session::{HandshakeError, HandshakePhase, QueryGrant, TunnelSession};
pub use tunnel::{
    SendOutcome, TunnelConfig, TunnelEngine, TunnelError, TunnelListener, TunnelStats,
    TunnelTransport,
};
