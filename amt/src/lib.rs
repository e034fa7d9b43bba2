//! AMT - Automatic Multicast Tunneling
//!
//! High-level Rust API for receiving multicast through an AMT relay.

pub use amt_gateway as gateway;
pub use amt_io as io;
pub use amt_protocol as protocol;

// Re-export commonly used types
pub use gateway::{
    DatagramSink, Gateway, GatewayConfig, GatewayError, InterfaceStats, PacketSink, SinkError,
    SinkId, Subscription,
};
pub use protocol::{AddressFamily, AmtMessage, IpPacket, UdpDatagram, AMT_PORT};
