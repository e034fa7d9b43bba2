//! Tunnel interface
//!
//! One logical interface per (relay discovery address, address family). It
//! owns the handshake engine, membership aggregator, channel tree, fragment
//! reassembler and the output channels for raw IP traffic, and is the
//! listener the engine delivers relay traffic to.

use crate::aggregator::{MembershipAggregator, MembershipConfig, MembershipError};
use crate::channel::{ChannelError, ChannelStats, ChannelTree, DatagramSink, SinkError, SinkId};
use crate::registry::Shared;
use crate::session::HandshakePhase;
use crate::tunnel::{TunnelConfig, TunnelEngine, TunnelError, TunnelListener, TunnelTransport};
use amt_io::time::{Scheduler, TimerHandle};
use amt_protocol::ip::{AddressFamily, IpPacket, UdpDatagram, PROTO_UDP};
use amt_protocol::membership::MembershipQuery;
use amt_protocol::reassembly::{Reassembler, ReassemblyConfig, ReassemblyError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Granularity of the reassembly reaper
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Key of a shared tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceKey {
    pub discovery_address: IpAddr,
    pub family: AddressFamily,
}

impl InterfaceKey {
    pub fn new(discovery_address: IpAddr, family: AddressFamily) -> Self {
        InterfaceKey {
            discovery_address,
            family,
        }
    }
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.discovery_address, self.family)
    }
}

/// Receiver of complete IP datagrams arriving over the tunnel
pub trait PacketSink: Send + Sync {
    fn id(&self) -> SinkId;

    fn deliver(&self, packet: &IpPacket) -> Result<(), SinkError>;
}

/// Snapshot of an interface's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceStats {
    pub phase: HandshakePhase,
    pub reports_sent: u64,
    pub send_refusals: u64,
    pub data_packets_received: u64,
    pub datagrams_reassembled: u64,
    pub datagrams_delivered: u64,
    pub reassembly_timeouts: u64,
    pub reassembly_overflows: u64,
    pub sink_evictions: u64,
    pub groups: usize,
    pub channels: usize,
}

#[derive(Default)]
struct Counters {
    reassembly_overflows: AtomicU64,
    output_evictions: AtomicU64,
}

/// Shared tunnel interface
pub struct TunnelInterface {
    key: InterfaceKey,
    engine: Arc<TunnelEngine>,
    aggregator: Arc<MembershipAggregator>,
    channels: ChannelTree,
    reassembler: Mutex<Reassembler>,
    outputs: RwLock<Vec<Arc<dyn PacketSink>>>,
    timeout_sink: RwLock<Option<Arc<dyn PacketSink>>>,
    reaper: Mutex<Option<TimerHandle>>,
    scheduler: Scheduler,
    counters: Counters,
    closed: AtomicBool,
    self_ref: Weak<TunnelInterface>,
}

impl TunnelInterface {
    /// Build an interface over `transport` and start its engine
    pub fn open(
        key: InterfaceKey,
        tunnel: TunnelConfig,
        membership: MembershipConfig,
        reassembly: ReassemblyConfig,
        transport: Arc<dyn TunnelTransport>,
        scheduler: Scheduler,
    ) -> Result<Arc<Self>, TunnelError> {
        let interface = Arc::new_cyclic(|self_ref: &Weak<TunnelInterface>| {
            let listener: Weak<dyn TunnelListener> = self_ref.clone();
            let engine = TunnelEngine::new(
                key.discovery_address,
                key.family,
                tunnel,
                transport,
                scheduler.clone(),
                listener,
            );
            let aggregator =
                MembershipAggregator::new(membership, engine.clone(), scheduler.clone());
            let channels = ChannelTree::new(aggregator.clone());

            TunnelInterface {
                key,
                engine,
                aggregator,
                channels,
                reassembler: Mutex::new(Reassembler::new(reassembly)),
                outputs: RwLock::new(Vec::new()),
                timeout_sink: RwLock::new(None),
                reaper: Mutex::new(None),
                scheduler,
                counters: Counters::default(),
                closed: AtomicBool::new(false),
                self_ref: self_ref.clone(),
            }
        });

        interface.engine.start()?;
        info!("Opened tunnel interface {}", key);
        Ok(interface)
    }

    pub fn key(&self) -> InterfaceKey {
        self.key
    }

    pub fn engine(&self) -> &Arc<TunnelEngine> {
        &self.engine
    }

    pub fn aggregator(&self) -> &Arc<MembershipAggregator> {
        &self.aggregator
    }

    pub fn channels(&self) -> &ChannelTree {
        &self.channels
    }

    /// Subscribe a sink to a channel on this interface
    pub fn join(
        &self,
        sink: Arc<dyn DatagramSink>,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), ChannelError> {
        self.channels.join(sink, group, source, port)
    }

    /// Unsubscribe a sink from a channel; unknown channels are ignored
    pub fn leave(
        &self,
        sink: SinkId,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), ChannelError> {
        self.channels.leave(sink, group, source, port)
    }

    /// Unsubscribe a sink from every channel
    pub fn leave_sink(&self, sink: SinkId) -> Result<(), ChannelError> {
        self.channels.leave_sink(sink)
    }

    /// Leave every group but keep the tunnel running
    pub fn leave_all(&self) -> Result<(), MembershipError> {
        self.channels.flush();
        self.aggregator.leave_all()
    }

    /// Register a sink for every complete datagram received
    pub fn add_output_channel(&self, sink: Arc<dyn PacketSink>) {
        let mut outputs = self.outputs.write();
        if outputs.iter().all(|s| s.id() != sink.id()) {
            outputs.push(sink);
        }
    }

    pub fn remove_output_channel(&self, sink: SinkId) -> bool {
        let mut outputs = self.outputs.write();
        let before = outputs.len();
        outputs.retain(|s| s.id() != sink);
        outputs.len() != before
    }

    /// Sink notified with fragment zero of unicast datagrams whose
    /// reassembly timed out
    pub fn set_timeout_sink(&self, sink: Option<Arc<dyn PacketSink>>) {
        *self.timeout_sink.write() = sink;
    }

    /// Feed one decapsulated packet through reassembly and delivery
    ///
    /// Returns the number of complete datagrams produced.
    pub fn ingest(&self, packet: IpPacket) -> Result<usize, ReassemblyError> {
        let completed = {
            let mut reassembler = self.reassembler.lock();
            let completed = reassembler.process(packet, Instant::now())?;
            if !reassembler.is_empty() {
                self.ensure_reaper();
            }
            completed
        };

        let count = completed.len();
        for datagram in completed {
            self.deliver(&datagram);
        }
        Ok(count)
    }

    pub fn stats(&self) -> InterfaceStats {
        let tunnel = self.engine.stats();
        let reassembly = self.reassembler.lock().stats();
        let channels: ChannelStats = self.channels.stats();
        InterfaceStats {
            phase: self.engine.phase(),
            reports_sent: self.aggregator.reports_sent(),
            send_refusals: tunnel.send_refusals,
            data_packets_received: tunnel.data_received,
            datagrams_reassembled: reassembly.completed,
            datagrams_delivered: channels.delivered,
            reassembly_timeouts: reassembly.timed_out,
            reassembly_overflows: self.counters.reassembly_overflows.load(Ordering::Relaxed),
            sink_evictions: channels.evictions
                + self.counters.output_evictions.load(Ordering::Relaxed),
            groups: channels.groups,
            channels: channels.channels,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Leave all groups, then stop the engine and drop all state
    ///
    /// Returns false when the interface was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.leave_all() {
            warn!("Leaving groups on {} failed: {}", self.key, e);
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.cancel();
        }
        self.aggregator.close();
        self.engine.close();
        self.reassembler.lock().close();
        self.outputs.write().clear();
        info!("Closed tunnel interface {}", self.key);
        true
    }

    fn deliver(&self, packet: &IpPacket) {
        self.deliver_outputs(packet);

        if packet.protocol() != PROTO_UDP || !packet.destination().is_multicast() {
            return;
        }
        match UdpDatagram::parse(packet) {
            Ok(datagram) => {
                self.channels.dispatch(&datagram);
            }
            Err(e) => trace!("Dropping malformed UDP datagram: {}", e),
        }
    }

    fn deliver_outputs(&self, packet: &IpPacket) {
        let outputs: Vec<Arc<dyn PacketSink>> = self.outputs.read().clone();
        for sink in outputs {
            match sink.deliver(packet) {
                Ok(()) => {}
                Err(SinkError::Disconnected) => {
                    self.counters.output_evictions.fetch_add(1, Ordering::Relaxed);
                    self.remove_output_channel(sink.id());
                }
                Err(SinkError::Fatal(reason)) => {
                    error!("Output channel {} failed: {}", sink.id(), reason);
                    self.remove_output_channel(sink.id());
                }
            }
        }
    }

    fn ensure_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.as_ref().map_or(false, TimerHandle::is_pending) {
            return;
        }
        let weak = self.self_ref.clone();
        *reaper = Some(self.scheduler.schedule(REAPER_INTERVAL, move || {
            if let Some(interface) = weak.upgrade() {
                interface.reap();
            }
        }));
    }

    fn reap(&self) {
        if self.is_closed() {
            return;
        }
        let (expired, pending) = {
            let mut reassembler = self.reassembler.lock();
            let expired = reassembler.evict_expired(Instant::now());
            (expired, !reassembler.is_empty())
        };
        *self.reaper.lock() = None;
        if pending {
            self.ensure_reaper();
        }

        if !expired.timed_out.is_empty() {
            debug!(
                "{} reassemblies timed out on {}",
                expired.timed_out.len(),
                self.key
            );
        }
        let timeout_sink = self.timeout_sink.read().clone();
        if let Some(sink) = timeout_sink {
            for packet in &expired.timed_out {
                if let Err(e) = sink.deliver(packet) {
                    debug!("Timeout sink refused packet: {}", e);
                }
            }
        }
        for datagram in expired.completed {
            self.deliver(&datagram);
        }
    }
}

impl TunnelListener for TunnelInterface {
    fn on_query(&self, query: MembershipQuery) {
        if let Err(e) = self.aggregator.on_query(&query) {
            error!("Answering query on {} failed: {}", self.key, e);
        }
    }

    fn on_data(&self, packet: IpPacket) {
        if let Err(e) = self.ingest(packet) {
            self.counters
                .reassembly_overflows
                .fetch_add(1, Ordering::Relaxed);
            warn!("Dropping fragment on {}: {}", self.key, e);
        }
    }
}

impl Shared for TunnelInterface {
    fn close(&self) {
        TunnelInterface::close(self);
    }
}
