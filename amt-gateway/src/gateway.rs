//! Gateway context
//!
//! The process-wide entry point applications hold. It owns the shared timer
//! thread and the registry of tunnel interfaces keyed by relay discovery
//! address and address family, and hands out subscriptions that keep their
//! interface alive.

use crate::aggregator::{MembershipConfig, MembershipError};
use crate::channel::{ChannelError, DatagramSink, SinkId};
use crate::interface::{InterfaceKey, PacketSink, TunnelInterface};
use crate::registry::{Lease, Registry};
use crate::tunnel::{TunnelConfig, TunnelError, TunnelTransport};
use amt_io::socket::{AmtSocket, SocketError};
use amt_io::time::Scheduler;
use amt_protocol::ip::AddressFamily;
use amt_protocol::reassembly::ReassemblyConfig;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
}

/// Configuration shared by every interface a gateway opens
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub tunnel: TunnelConfig,
    pub membership: MembershipConfig,
    pub reassembly: ReassemblyConfig,
}

/// Builds the transport for a new interface
pub type TransportFactory = Arc<
    dyn Fn(&InterfaceKey, &TunnelConfig) -> Result<Arc<dyn TunnelTransport>, GatewayError>
        + Send
        + Sync,
>;

/// Counted handle on a shared tunnel interface
pub type InterfaceLease = Lease<InterfaceKey, TunnelInterface>;

/// UDP socket toward the discovery address, unconnected until discovery
pub fn udp_transport(
    key: &InterfaceKey,
    config: &TunnelConfig,
) -> Result<Arc<dyn TunnelTransport>, GatewayError> {
    let socket = AmtSocket::bind_for(&key.discovery_address)?;
    socket.set_read_timeout(Some(config.receive_timeout))?;
    Ok(Arc::new(socket))
}

/// Gateway context
#[derive(Clone)]
pub struct Gateway {
    config: GatewayConfig,
    scheduler: Scheduler,
    interfaces: Arc<Registry<InterfaceKey, TunnelInterface>>,
    transports: TransportFactory,
}

impl Gateway {
    /// Create a gateway using UDP sockets
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::with_transport_factory(config, Arc::new(udp_transport))
    }

    pub fn with_transport_factory(
        config: GatewayConfig,
        transports: TransportFactory,
    ) -> Result<Self, GatewayError> {
        Ok(Gateway {
            config,
            scheduler: Scheduler::with_name("amt-timer")?,
            interfaces: Registry::new(),
            transports,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Keys of every live interface
    pub fn interfaces(&self) -> Vec<InterfaceKey> {
        self.interfaces.keys()
    }

    /// Live interface for a key, without taking a lease
    pub fn find(&self, key: &InterfaceKey) -> Option<Arc<TunnelInterface>> {
        self.interfaces.get(key)
    }

    /// Number of leases held on an interface
    pub fn ref_count(&self, key: &InterfaceKey) -> usize {
        self.interfaces.ref_count(key)
    }

    /// Acquire the interface for a relay and family, opening it if needed
    pub fn interface(
        &self,
        discovery_address: IpAddr,
        family: AddressFamily,
    ) -> Result<InterfaceLease, GatewayError> {
        let key = InterfaceKey::new(discovery_address, family);
        self.interfaces.acquire(key, |key| {
            let transport = (self.transports)(key, &self.config.tunnel)?;
            let interface = TunnelInterface::open(
                *key,
                self.config.tunnel.clone(),
                self.config.membership.clone(),
                self.config.reassembly,
                transport,
                self.scheduler.clone(),
            )?;
            Ok(interface)
        })
    }

    /// Handle dispatching joins for one relay by address family
    pub fn relay(&self, discovery_address: IpAddr) -> RelayHandle {
        RelayHandle {
            gateway: self.clone(),
            discovery_address,
            ipv4: Mutex::new(None),
            ipv6: Mutex::new(None),
        }
    }

    /// Join a channel through a relay; dropping the subscription leaves it
    pub fn subscribe(
        &self,
        discovery_address: IpAddr,
        sink: Arc<dyn DatagramSink>,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<Subscription, GatewayError> {
        let lease = self.interface(discovery_address, AddressFamily::of(&group))?;
        let sink_id = sink.id();
        lease.join(sink, group, source, port)?;
        debug!(
            "Subscribed {} to {} via {}",
            sink_id,
            describe(group, source, port),
            discovery_address
        );
        Ok(Subscription {
            lease,
            sink: sink_id,
            group,
            source,
            port,
            left: false,
        })
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("interfaces", &self.interfaces.keys())
            .finish()
    }
}

/// One channel subscription; leaves and releases its interface on drop
pub struct Subscription {
    lease: InterfaceLease,
    sink: SinkId,
    group: IpAddr,
    source: Option<IpAddr>,
    port: u16,
    left: bool,
}

impl Subscription {
    pub fn interface(&self) -> &InterfaceLease {
        &self.lease
    }

    pub fn sink(&self) -> SinkId {
        self.sink
    }

    pub fn group(&self) -> IpAddr {
        self.group
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Leave now and report the outcome
    pub fn unsubscribe(mut self) -> Result<(), GatewayError> {
        self.left = true;
        self.leave()
    }

    fn leave(&self) -> Result<(), GatewayError> {
        self.lease
            .leave(self.sink, self.group, self.source, self.port)
            .map_err(GatewayError::from)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        if let Err(e) = self.leave() {
            warn!(
                "Leaving {} on drop failed: {}",
                describe(self.group, self.source, self.port),
                e
            );
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subscription({} {} via {})",
            self.sink,
            describe(self.group, self.source, self.port),
            self.lease.key()
        )
    }
}

/// Per-relay handle holding one lazily opened interface per family
pub struct RelayHandle {
    gateway: Gateway,
    discovery_address: IpAddr,
    ipv4: Mutex<Option<InterfaceLease>>,
    ipv6: Mutex<Option<InterfaceLease>>,
}

impl RelayHandle {
    pub fn discovery_address(&self) -> IpAddr {
        self.discovery_address
    }

    /// Interface for a family, opening it on first use
    pub fn interface(&self, family: AddressFamily) -> Result<InterfaceLease, GatewayError> {
        let mut slot = self.slot(family).lock();
        if let Some(lease) = slot.as_ref() {
            return Ok(lease.clone());
        }
        let lease = self.gateway.interface(self.discovery_address, family)?;
        *slot = Some(lease.clone());
        Ok(lease)
    }

    pub fn join(
        &self,
        sink: Arc<dyn DatagramSink>,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), GatewayError> {
        let interface = self.interface(AddressFamily::of(&group))?;
        interface.join(sink, group, source, port)?;
        Ok(())
    }

    /// Leave a channel; a family never joined is a no-op
    pub fn leave(
        &self,
        sink: SinkId,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), GatewayError> {
        let slot = self.slot(AddressFamily::of(&group)).lock();
        if let Some(interface) = slot.as_ref() {
            interface.leave(sink, group, source, port)?;
        }
        Ok(())
    }

    /// Register a raw packet sink on both families
    pub fn add_output_channel(&self, sink: Arc<dyn PacketSink>) -> Result<(), GatewayError> {
        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            self.interface(family)?.add_output_channel(sink.clone());
        }
        Ok(())
    }

    pub fn remove_output_channel(&self, sink: SinkId) {
        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            if let Some(interface) = self.slot(family).lock().as_ref() {
                interface.remove_output_channel(sink);
            }
        }
    }

    /// Drop this handle's leases; interfaces close once nothing else holds them
    pub fn release(&self) {
        self.ipv4.lock().take();
        self.ipv6.lock().take();
    }

    fn slot(&self, family: AddressFamily) -> &Mutex<Option<InterfaceLease>> {
        match family {
            AddressFamily::Ipv4 => &self.ipv4,
            AddressFamily::Ipv6 => &self.ipv6,
        }
    }
}

fn describe(group: IpAddr, source: Option<IpAddr>, port: u16) -> String {
    match source {
        Some(source) => format!("({}, {}):{}", source, group, port),
        None => format!("(*, {}):{}", group, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SinkError;
    use crate::tunnel::testing::MockTransport;
    use amt_protocol::ip::UdpDatagram;
    use std::time::Duration;

    struct NullSink(SinkId);

    impl DatagramSink for NullSink {
        fn id(&self) -> SinkId {
            self.0
        }

        fn deliver(&self, _: &UdpDatagram) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn sink() -> Arc<NullSink> {
        Arc::new(NullSink(SinkId::next()))
    }

    fn gateway() -> Gateway {
        let mut config = GatewayConfig::default();
        config.tunnel.discovery_interval = Duration::from_secs(600);
        config.tunnel.receive_timeout = Duration::from_millis(20);
        config.membership.unsolicited_report_interval = Duration::from_secs(600);
        Gateway::with_transport_factory(
            config,
            Arc::new(|_: &InterfaceKey, _: &TunnelConfig| {
                let transport: Arc<dyn TunnelTransport> = Arc::new(MockTransport::default());
                Ok::<_, GatewayError>(transport)
            }),
        )
        .unwrap()
    }

    fn relay() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    #[test]
    fn test_subscriptions_share_interface() {
        let gateway = gateway();
        let key = InterfaceKey::new(relay(), AddressFamily::Ipv4);

        let a = gateway
            .subscribe(relay(), sink(), "232.1.1.1".parse().unwrap(), None, 5000)
            .unwrap();
        let b = gateway
            .subscribe(relay(), sink(), "232.1.1.2".parse().unwrap(), None, 5000)
            .unwrap();
        assert!(Arc::ptr_eq(a.interface().value(), b.interface().value()));
        assert_eq!(gateway.ref_count(&key), 2);

        let interface = a.interface().value().clone();
        drop(a);
        assert_eq!(interface.aggregator().group_count(), 1);
        assert!(!interface.engine().is_closed());

        drop(b);
        assert!(interface.engine().is_closed());
        assert!(gateway.find(&key).is_none());
    }

    #[test]
    fn test_unsubscribe_leaves_once() {
        let gateway = gateway();
        let keep = gateway
            .subscribe(relay(), sink(), "232.1.1.1".parse().unwrap(), None, 5000)
            .unwrap();
        let sub = gateway
            .subscribe(relay(), sink(), "232.1.1.9".parse().unwrap(), None, 5000)
            .unwrap();
        let interface = keep.interface().value().clone();

        sub.unsubscribe().unwrap();
        assert_eq!(interface.aggregator().group_count(), 1);
        assert_eq!(gateway.ref_count(keep.interface().key()), 1);
    }

    #[test]
    fn test_invalid_group_releases_interface() {
        let gateway = gateway();
        let result = gateway.subscribe(relay(), sink(), "10.0.0.1".parse().unwrap(), None, 5000);
        assert!(matches!(
            result,
            Err(GatewayError::Channel(ChannelError::InvalidGroup(_)))
        ));
        assert!(gateway.interfaces().is_empty());
    }

    #[test]
    fn test_relay_dispatches_by_family() {
        let gateway = gateway();
        let relay_handle = gateway.relay(relay());
        let s = sink();

        relay_handle
            .join(s.clone(), "232.1.1.1".parse().unwrap(), None, 5000)
            .unwrap();
        relay_handle
            .join(s.clone(), "ff3e::8000:1".parse().unwrap(), None, 5000)
            .unwrap();

        let mut keys = gateway.interfaces();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                InterfaceKey::new(relay(), AddressFamily::Ipv4),
                InterfaceKey::new(relay(), AddressFamily::Ipv6),
            ]
        );

        relay_handle
            .leave(s.id(), "ff3e::8000:1".parse().unwrap(), None, 5000)
            .unwrap();
        let v6 = gateway
            .find(&InterfaceKey::new(relay(), AddressFamily::Ipv6))
            .unwrap();
        assert_eq!(v6.aggregator().group_count(), 0);

        relay_handle.release();
        assert!(gateway.interfaces().is_empty());
        assert!(v6.engine().is_closed());
    }

    #[test]
    fn test_leave_unjoined_family_is_noop() {
        let gateway = gateway();
        let relay_handle = gateway.relay(relay());
        relay_handle
            .leave(SinkId::next(), "ff3e::1".parse().unwrap(), None, 5000)
            .unwrap();
        assert!(gateway.interfaces().is_empty());
    }
}
