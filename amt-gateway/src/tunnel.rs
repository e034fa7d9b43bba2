//! Tunnel handshake engine
//!
//! Drives one AMT tunnel (relay discovery address + address family) over a
//! UDP transport: retransmission timers, the receive loop, inbound dispatch
//! and the encapsulated send path for membership reports.

use crate::session::{teardown_message, HandshakePhase, QueryGrant, RequestRetry, TunnelSession};
use amt_io::socket::{AmtSocket, SocketError};
use amt_io::time::{Scheduler, TimerHandle};
use amt_protocol::ip::{AddressFamily, IpPacket, MAX_DATAGRAM_SIZE};
use amt_protocol::membership::{MembershipCodecError, MembershipQuery, MembershipReport};
use amt_protocol::message::{AmtMessage, AMT_PORT};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel is closed")]
    Closed,

    #[error("Address family mismatch (tunnel {expected}, packet {actual})")]
    FamilyMismatch {
        expected: AddressFamily,
        actual: AddressFamily,
    },

    #[error("Not a membership report: {0}")]
    InvalidReport(#[from] MembershipCodecError),

    #[error("Relay unreachable")]
    Unreachable,

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Failed to start receive thread: {0}")]
    Spawn(io::Error),
}

/// Outcome of an accepted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encapsulated and handed to the transport
    Sent,
    /// No query has been received yet; the packet was not sent or queued
    NotReady,
}

/// Tunnel timing and retry parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// UDP port relays listen on
    pub relay_port: u16,
    /// Interval between Relay Discovery retransmissions
    pub discovery_interval: Duration,
    /// Discovery transmissions before giving up, `None` for no limit
    pub discovery_retries: Option<u32>,
    /// Interval between Request retransmissions
    pub request_interval: Duration,
    /// Request retransmissions before restarting discovery
    pub request_retries: u32,
    /// Keepalive interval used until a query advertises one
    pub default_query_interval: Duration,
    /// Receive timeout of the receive loop (bounds `close` latency)
    pub receive_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            relay_port: AMT_PORT,
            discovery_interval: Duration::from_secs(2),
            discovery_retries: None,
            request_interval: Duration::from_secs(2),
            request_retries: 2,
            default_query_interval: Duration::from_secs(125),
            receive_timeout: Duration::from_millis(250),
        }
    }
}

/// Datagram transport used by the engine
///
/// Implemented by [`AmtSocket`]; tests substitute an in-memory transport.
pub trait TunnelTransport: Send + Sync {
    /// Direct subsequent sends to `peer` and only accept datagrams from it
    fn connect(&self, peer: SocketAddr) -> Result<(), SocketError>;

    fn send(&self, buf: &[u8]) -> Result<usize, SocketError>;

    /// Blocking receive bounded by the transport's read timeout
    fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError>;

    fn local_addr(&self) -> Result<SocketAddr, SocketError>;
}

impl TunnelTransport for AmtSocket {
    fn connect(&self, peer: SocketAddr) -> Result<(), SocketError> {
        AmtSocket::connect(self, peer)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        AmtSocket::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        AmtSocket::recv(self, buf)
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        AmtSocket::local_addr(self)
    }
}

/// Receiver of decapsulated relay traffic
pub trait TunnelListener: Send + Sync {
    fn on_query(&self, query: MembershipQuery);

    fn on_data(&self, packet: IpPacket);
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub updates_sent: u64,
    pub send_refusals: u64,
    pub discoveries_sent: u64,
    pub requests_sent: u64,
    pub queries_accepted: u64,
    pub data_received: u64,
    pub messages_dropped: u64,
    pub teardowns_sent: u64,
}

#[derive(Default)]
struct Counters {
    updates_sent: AtomicU64,
    send_refusals: AtomicU64,
    discoveries_sent: AtomicU64,
    requests_sent: AtomicU64,
    queries_accepted: AtomicU64,
    data_received: AtomicU64,
    messages_dropped: AtomicU64,
    teardowns_sent: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct Timers {
    discovery: Option<TimerHandle>,
    request: Option<TimerHandle>,
    keepalive: Option<TimerHandle>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for timer in [
            self.discovery.take(),
            self.request.take(),
            self.keepalive.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }
}

struct EngineState {
    session: TunnelSession,
    timers: Timers,
}

/// Handshake engine for one tunnel
pub struct TunnelEngine {
    discovery_address: IpAddr,
    family: AddressFamily,
    config: TunnelConfig,
    transport: Arc<dyn TunnelTransport>,
    scheduler: Scheduler,
    listener: Weak<dyn TunnelListener>,
    state: Mutex<EngineState>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    running: AtomicBool,
    counters: Counters,
    self_ref: Weak<TunnelEngine>,
}

impl TunnelEngine {
    /// Create an engine in `Disconnected`; call [`TunnelEngine::start`] to
    /// begin discovery and receiving
    pub fn new(
        discovery_address: IpAddr,
        family: AddressFamily,
        config: TunnelConfig,
        transport: Arc<dyn TunnelTransport>,
        scheduler: Scheduler,
        listener: Weak<dyn TunnelListener>,
    ) -> Arc<Self> {
        let session = TunnelSession::new(family, config.default_query_interval);
        Arc::new_cyclic(|self_ref| TunnelEngine {
            discovery_address,
            family,
            config,
            transport,
            scheduler,
            listener,
            state: Mutex::new(EngineState {
                session,
                timers: Timers::default(),
            }),
            receiver: Mutex::new(None),
            closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn discovery_address(&self) -> IpAddr {
        self.discovery_address
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn phase(&self) -> HandshakePhase {
        self.state.lock().session.phase()
    }

    /// Relay currently serving the tunnel
    pub fn relay(&self) -> Option<IpAddr> {
        self.state.lock().session.relay()
    }

    /// Whether the receive loop is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Local address used as the source of membership reports
    pub fn local_ip(&self) -> IpAddr {
        match self.transport.local_addr() {
            Ok(addr) if AddressFamily::of(&addr.ip()) == self.family => addr.ip(),
            _ => self.family.unspecified(),
        }
    }

    pub fn stats(&self) -> TunnelStats {
        let c = &self.counters;
        TunnelStats {
            updates_sent: c.updates_sent.load(Ordering::Relaxed),
            send_refusals: c.send_refusals.load(Ordering::Relaxed),
            discoveries_sent: c.discoveries_sent.load(Ordering::Relaxed),
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            queries_accepted: c.queries_accepted.load(Ordering::Relaxed),
            data_received: c.data_received.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            teardowns_sent: c.teardowns_sent.load(Ordering::Relaxed),
        }
    }

    /// Start discovery and the receive loop
    pub fn start(&self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let engine = match self.self_ref.upgrade() {
            Some(engine) => engine,
            None => return Err(TunnelError::Closed),
        };
        let handle = thread::Builder::new()
            .name(format!("amt-rx-{}", self.discovery_address))
            .spawn(move || engine.receive_loop())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                TunnelError::Spawn(e)
            })?;
        *self.receiver.lock() = Some(handle);

        let mut state = self.state.lock();
        if state.session.phase() == HandshakePhase::Disconnected {
            self.begin_discovery(&mut state);
        }
        Ok(())
    }

    /// Encapsulate a membership report and send it to the relay
    ///
    /// Refuses with [`SendOutcome::NotReady`] until a query has been
    /// received, starting discovery if none is in progress.
    pub fn send(&self, packet: &IpPacket) -> Result<SendOutcome, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        if packet.family() != self.family {
            return Err(TunnelError::FamilyMismatch {
                expected: self.family,
                actual: packet.family(),
            });
        }
        let report = MembershipReport::from_packet(packet)?;

        let mut state = self.state.lock();
        let message = match state.session.update_message(packet.clone()) {
            Some(message) => message,
            None => {
                if state.session.phase() == HandshakePhase::Disconnected {
                    self.begin_discovery(&mut state);
                }
                bump(&self.counters.send_refusals);
                debug!("Tunnel to {} not ready, report refused", self.discovery_address);
                return Ok(SendOutcome::NotReady);
            }
        };

        match self.transmit(&message) {
            Ok(()) => {
                bump(&self.counters.updates_sent);
                if report.describes_reception() {
                    self.schedule_keepalive(&mut state);
                }
                Ok(SendOutcome::Sent)
            }
            Err(e) if e.is_unreachable() => {
                warn!("Relay unreachable ({}), restarting discovery", e);
                self.begin_discovery(&mut state);
                Err(TunnelError::Unreachable)
            }
            Err(e) => Err(TunnelError::Socket(e)),
        }
    }

    /// Process one datagram received from the relay
    pub fn handle_datagram(&self, bytes: &[u8]) {
        let message = match AmtMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping undecodable relay message: {}", e);
                bump(&self.counters.messages_dropped);
                return;
            }
        };

        match message {
            AmtMessage::RelayAdvertisement { nonce, relay } => {
                self.handle_advertisement(nonce, relay)
            }
            AmtMessage::MembershipQuery {
                limited,
                mac,
                nonce,
                query,
                gateway,
            } => {
                let grant = QueryGrant {
                    mac,
                    nonce,
                    gateway,
                    limited,
                };
                self.handle_query(grant, &query)
            }
            AmtMessage::MulticastData { packet } => {
                bump(&self.counters.data_received);
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_data(packet);
                }
            }
            other => {
                debug!("Dropping unexpected {:?} from relay", other.message_type());
                bump(&self.counters.messages_dropped);
            }
        }
    }

    /// Cancel timers, stop the receive loop and forget the session
    ///
    /// Idempotent; the transport is released when the engine is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.timers.cancel_all();
            state.session.reset();
        }

        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Receive loop for {} panicked", self.discovery_address);
            }
        }
        info!("Tunnel to {} ({}) closed", self.discovery_address, self.family);
    }

    fn handle_advertisement(&self, nonce: u32, relay: IpAddr) {
        let mut state = self.state.lock();
        if let Err(e) = state.session.on_advertisement(nonce, relay) {
            debug!("Ignoring Relay Advertisement: {}", e);
            bump(&self.counters.messages_dropped);
            return;
        }
        if let Some(timer) = state.timers.discovery.take() {
            timer.cancel();
        }

        info!("Relay {} answered discovery via {}", relay, self.discovery_address);
        let peer = SocketAddr::new(relay, self.config.relay_port);
        if let Err(e) = self.transport.connect(peer) {
            warn!("Failed to connect to relay {}: {}", peer, e);
            self.begin_discovery(&mut state);
            return;
        }
        self.send_request(&mut state);
    }

    fn handle_query(&self, grant: QueryGrant, encapsulated: &IpPacket) {
        let query = match MembershipQuery::from_packet(encapsulated) {
            Ok(query) if query.family == self.family => query,
            Ok(query) => {
                debug!("Ignoring {} query on {} tunnel", query.family, self.family);
                bump(&self.counters.messages_dropped);
                return;
            }
            Err(e) => {
                debug!("Ignoring Membership Query with bad payload: {}", e);
                bump(&self.counters.messages_dropped);
                return;
            }
        };

        {
            let mut state = self.state.lock();
            let interval = Some(query.query_interval);
            let stale = match state.session.on_query(grant, interval) {
                Ok(stale) => stale,
                Err(e) => {
                    debug!("Ignoring Membership Query: {}", e);
                    bump(&self.counters.messages_dropped);
                    return;
                }
            };
            if let Some(timer) = state.timers.request.take() {
                timer.cancel();
            }
            bump(&self.counters.queries_accepted);

            if let Some(teardown) = stale.as_ref().and_then(teardown_message) {
                info!("Gateway address changed, tearing down previous session");
                match self.transmit(&teardown) {
                    Ok(()) => bump(&self.counters.teardowns_sent),
                    Err(e) => warn!("Failed to send Teardown: {}", e),
                }
            }
            if grant.limited {
                warn!("Relay {:?} reports it is at capacity", state.session.relay());
            }
            debug!(
                "Tunnel to {} established, query interval {:?}",
                self.discovery_address,
                state.session.query_interval()
            );
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.on_query(query);
        }
    }

    fn begin_discovery(&self, state: &mut EngineState) {
        state.timers.cancel_all();
        let message = state.session.start_discovery(rand::random());

        let target = SocketAddr::new(self.discovery_address, self.config.relay_port);
        if let Err(e) = self.transport.connect(target) {
            warn!("Failed to connect to discovery address {}: {}", target, e);
        }
        info!("Discovering relay via {}", target);
        self.send_discovery(state, &message);
    }

    fn send_discovery(&self, state: &mut EngineState, message: &AmtMessage) {
        match self.transmit(message) {
            Ok(()) => bump(&self.counters.discoveries_sent),
            // Retried by the discovery timer.
            Err(e) => debug!("Relay Discovery not sent: {}", e),
        }

        let weak = self.self_ref.clone();
        state.timers.discovery = Some(self.scheduler.schedule(
            self.config.discovery_interval,
            move || {
                if let Some(engine) = weak.upgrade() {
                    engine.on_discovery_timer();
                }
            },
        ));
    }

    fn on_discovery_timer(&self) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock();
        state.timers.discovery = None;
        match state.session.retry_discovery(self.config.discovery_retries) {
            Some(message) => {
                debug!("Retransmitting Relay Discovery to {}", self.discovery_address);
                self.send_discovery(&mut state, &message);
            }
            None if state.session.phase() == HandshakePhase::Disconnected => {
                warn!(
                    "No relay answered discovery via {}, giving up",
                    self.discovery_address
                );
            }
            None => {}
        }
    }

    fn send_request(&self, state: &mut EngineState) {
        let message = match state.session.start_request(rand::random()) {
            Some(message) => message,
            None => return,
        };
        self.send_request_message(state, &message);
    }

    fn send_request_message(&self, state: &mut EngineState, message: &AmtMessage) {
        match self.transmit(message) {
            Ok(()) => bump(&self.counters.requests_sent),
            Err(e) if e.is_unreachable() => {
                warn!("Relay unreachable ({}), restarting discovery", e);
                self.begin_discovery(state);
                return;
            }
            Err(e) => debug!("Request not sent: {}", e),
        }

        if let Some(timer) = state.timers.request.take() {
            timer.cancel();
        }
        let weak = self.self_ref.clone();
        state.timers.request = Some(self.scheduler.schedule(
            self.config.request_interval,
            move || {
                if let Some(engine) = weak.upgrade() {
                    engine.on_request_timer();
                }
            },
        ));
    }

    fn on_request_timer(&self) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock();
        state.timers.request = None;
        match state.session.retry_request(self.config.request_retries) {
            Some(RequestRetry::Resend(message)) => {
                debug!("Retransmitting Request");
                self.send_request_message(&mut state, &message);
            }
            Some(RequestRetry::Exhausted) => {
                warn!("Relay stopped answering requests, restarting discovery");
                self.begin_discovery(&mut state);
            }
            None => {}
        }
    }

    fn schedule_keepalive(&self, state: &mut EngineState) {
        if state
            .timers
            .keepalive
            .as_ref()
            .map_or(false, TimerHandle::is_pending)
        {
            return;
        }
        let weak = self.self_ref.clone();
        state.timers.keepalive = Some(self.scheduler.schedule(
            state.session.query_interval(),
            move || {
                if let Some(engine) = weak.upgrade() {
                    engine.on_keepalive_timer();
                }
            },
        ));
    }

    fn on_keepalive_timer(&self) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock();
        state.timers.keepalive = None;
        if state.session.phase() == HandshakePhase::Established {
            trace!("Refreshing tunnel to {}", self.discovery_address);
            self.send_request(&mut state);
        }
    }

    fn transmit(&self, message: &AmtMessage) -> Result<(), SocketError> {
        let bytes = message.encode();
        self.transport.send(&bytes)?;
        trace!("Sent {:?} ({} bytes)", message.message_type(), bytes.len());
        Ok(())
    }

    /// Restart discovery when a relay that was found stops answering
    fn on_receive_unreachable(&self, e: &SocketError) {
        let mut state = self.state.lock();
        match state.session.phase() {
            HandshakePhase::Requesting | HandshakePhase::Established => {
                warn!("Relay unreachable ({}), restarting discovery", e);
                self.begin_discovery(&mut state);
            }
            // Discovery retries on its own timer; Disconnected has given up.
            phase => trace!("Ignoring unreachable relay while {:?}", phase),
        }
    }

    fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 64];
        debug!("Receive loop for {} started", self.discovery_address);

        while !self.is_closed() {
            match self.transport.recv(&mut buf) {
                Ok(n) => self.handle_datagram(&buf[..n]),
                Err(e) if e.is_timeout() => continue,
                Err(e) if e.is_unreachable() => self.on_receive_unreachable(&e),
                Err(e) if e.is_interrupted() => {
                    debug!("Receive loop for {} interrupted", self.discovery_address);
                    break;
                }
                Err(e) => {
                    error!("Receive loop for {} failed: {}", self.discovery_address, e);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        debug!("Receive loop for {} stopped", self.discovery_address);
    }
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        self.state.get_mut().timers.cancel_all();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport and listener for engine tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::ErrorKind;

    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<AmtMessage>>,
        pub peers: Mutex<Vec<SocketAddr>>,
        pub fail_with: Mutex<Option<ErrorKind>>,
        pub inbound: Mutex<VecDeque<Vec<u8>>>,
    }

    impl MockTransport {
        pub fn take_sent(&self) -> Vec<AmtMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl TunnelTransport for MockTransport {
        fn connect(&self, peer: SocketAddr) -> Result<(), SocketError> {
            self.peers.lock().push(peer);
            Ok(())
        }

        fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
            if let Some(kind) = *self.fail_with.lock() {
                return Err(SocketError::Io(io::Error::from(kind)));
            }
            self.sent.lock().push(AmtMessage::decode(buf).unwrap());
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
            match self.inbound.lock().pop_front() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Err(SocketError::Io(io::Error::from(ErrorKind::WouldBlock)))
                }
            }
        }

        fn local_addr(&self) -> Result<SocketAddr, SocketError> {
            Ok("192.0.2.100:40000".parse().unwrap())
        }
    }

    #[derive(Default)]
    pub struct RecordingListener {
        pub queries: Mutex<Vec<MembershipQuery>>,
        pub data: Mutex<Vec<IpPacket>>,
    }

    impl TunnelListener for RecordingListener {
        fn on_query(&self, query: MembershipQuery) {
            self.queries.lock().push(query);
        }

        fn on_data(&self, packet: IpPacket) {
            self.data.lock().push(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockTransport, RecordingListener};
    use super::*;
    use amt_protocol::ip::UdpDatagram;
    use amt_protocol::membership::{GroupRecord, GroupRecordType};
    use amt_protocol::message::ResponseMac;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use std::io::ErrorKind;

    const MAC: ResponseMac = ResponseMac([9, 8, 7, 6, 5, 4]);

    struct Fixture {
        engine: Arc<TunnelEngine>,
        transport: Arc<MockTransport>,
        listener: Arc<RecordingListener>,
    }

    fn fixture() -> Fixture {
        fixture_with(TunnelConfig {
            discovery_interval: Duration::from_secs(600),
            request_interval: Duration::from_secs(600),
            ..TunnelConfig::default()
        })
    }

    fn fixture_with(config: TunnelConfig) -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<RecordingListener> = Arc::downgrade(&listener);
        let weak: Weak<dyn TunnelListener> = weak;
        let engine = TunnelEngine::new(
            "192.0.2.1".parse().unwrap(),
            AddressFamily::Ipv4,
            config,
            transport.clone(),
            Scheduler::new().unwrap(),
            weak,
        );
        Fixture {
            engine,
            transport,
            listener,
        }
    }

    fn report(record_type: GroupRecordType) -> IpPacket {
        MembershipReport::with_records(
            AddressFamily::Ipv4,
            vec![GroupRecord::new(
                record_type,
                "232.1.1.1".parse().unwrap(),
                &BTreeSet::new(),
            )],
        )
        .to_packet("0.0.0.0".parse().unwrap())
        .unwrap()
    }

    fn query_message(nonce: u32, gateway: Option<&str>) -> Vec<u8> {
        let query = MembershipQuery::general(AddressFamily::Ipv4, Duration::from_secs(10))
            .to_packet("192.0.2.1".parse().unwrap(), "224.0.0.1".parse().unwrap())
            .unwrap();
        AmtMessage::MembershipQuery {
            limited: false,
            mac: MAC,
            nonce,
            query,
            gateway: gateway.map(|g| g.parse().unwrap()),
        }
        .encode()
        .to_vec()
    }

    fn advertisement(nonce: u32) -> Vec<u8> {
        AmtMessage::RelayAdvertisement {
            nonce,
            relay: "198.51.100.1".parse().unwrap(),
        }
        .encode()
        .to_vec()
    }

    fn discovery_nonce(sent: &[AmtMessage]) -> u32 {
        sent.iter()
            .find_map(|m| match m {
                AmtMessage::RelayDiscovery { nonce } => Some(*nonce),
                _ => None,
            })
            .unwrap()
    }

    fn request_nonce(sent: &[AmtMessage]) -> u32 {
        sent.iter()
            .rev()
            .find_map(|m| match m {
                AmtMessage::Request { nonce, .. } => Some(*nonce),
                _ => None,
            })
            .unwrap()
    }

    fn establish(f: &Fixture, gateway: Option<&str>) -> u32 {
        f.engine.send(&report(GroupRecordType::ChangeToExcludeMode)).unwrap();
        let nonce = discovery_nonce(&f.transport.take_sent());
        f.engine.handle_datagram(&advertisement(nonce));
        let nonce = request_nonce(&f.transport.take_sent());
        f.engine.handle_datagram(&query_message(nonce, gateway));
        nonce
    }

    #[test]
    fn test_send_refused_then_accepted() {
        let f = fixture();
        let packet = report(GroupRecordType::ChangeToExcludeMode);
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);

        assert_eq!(f.engine.send(&packet).unwrap(), SendOutcome::NotReady);
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let nonce = discovery_nonce(&sent);

        // Refused again while discovering, without a second discovery
        assert_eq!(f.engine.send(&packet).unwrap(), SendOutcome::NotReady);
        assert!(f.transport.take_sent().is_empty());

        f.engine.handle_datagram(&advertisement(nonce));
        assert_eq!(f.engine.phase(), HandshakePhase::Requesting);
        assert_eq!(
            f.transport.peers.lock().last().copied(),
            Some("198.51.100.1:2268".parse().unwrap())
        );
        let request = request_nonce(&f.transport.take_sent());

        f.engine.handle_datagram(&query_message(request, None));
        assert_eq!(f.engine.phase(), HandshakePhase::Established);
        assert_eq!(f.listener.queries.lock().len(), 1);

        assert_eq!(f.engine.send(&packet).unwrap(), SendOutcome::Sent);
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            AmtMessage::MembershipUpdate {
                mac: MAC,
                nonce: request,
                report: packet,
            }
        );
        assert_eq!(f.engine.stats().send_refusals, 2);
        assert_eq!(f.engine.stats().updates_sent, 1);
    }

    #[test]
    fn test_nonce_fencing() {
        let f = fixture();
        f.engine.send(&report(GroupRecordType::ChangeToExcludeMode)).unwrap();
        let nonce = discovery_nonce(&f.transport.take_sent());

        f.engine.handle_datagram(&advertisement(nonce.wrapping_add(1)));
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);
        assert!(f.transport.take_sent().is_empty());

        f.engine.handle_datagram(&advertisement(nonce));
        let request = request_nonce(&f.transport.take_sent());

        f.engine
            .handle_datagram(&query_message(request.wrapping_add(1), None));
        assert_eq!(f.engine.phase(), HandshakePhase::Requesting);
        assert!(f.listener.queries.lock().is_empty());
        assert_eq!(f.engine.stats().messages_dropped, 2);
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let f = fixture();
        let v6 = MembershipReport::with_records(
            AddressFamily::Ipv6,
            vec![GroupRecord::new(
                GroupRecordType::ChangeToExcludeMode,
                "ff3e::1".parse().unwrap(),
                &BTreeSet::new(),
            )],
        )
        .to_packet("::".parse().unwrap())
        .unwrap();

        assert!(matches!(
            f.engine.send(&v6),
            Err(TunnelError::FamilyMismatch { .. })
        ));
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);
    }

    #[test]
    fn test_non_report_rejected() {
        let f = fixture();
        let data = UdpDatagram {
            source: "10.0.0.1".parse().unwrap(),
            source_port: 1,
            destination: "232.1.1.1".parse().unwrap(),
            destination_port: 2,
            payload: Bytes::from_static(b"x"),
        }
        .to_packet(8)
        .unwrap();

        assert!(matches!(
            f.engine.send(&data),
            Err(TunnelError::InvalidReport(_))
        ));
    }

    #[test]
    fn test_unreachable_restarts_discovery() {
        let f = fixture();
        establish(&f, None);
        assert_eq!(f.engine.phase(), HandshakePhase::Established);

        *f.transport.fail_with.lock() = Some(ErrorKind::ConnectionRefused);
        let result = f.engine.send(&report(GroupRecordType::ChangeToExcludeMode));
        assert!(matches!(result, Err(TunnelError::Unreachable)));
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);
        assert_eq!(
            f.transport.peers.lock().last().copied(),
            Some("192.0.2.1:2268".parse().unwrap())
        );

        *f.transport.fail_with.lock() = None;
        assert_eq!(
            f.engine
                .send(&report(GroupRecordType::ChangeToExcludeMode))
                .unwrap(),
            SendOutcome::NotReady
        );
    }

    #[test]
    fn test_request_retries_exhausted_restart_discovery() {
        let f = fixture();
        f.engine.send(&report(GroupRecordType::ChangeToExcludeMode)).unwrap();
        let discovery = discovery_nonce(&f.transport.take_sent());
        f.engine.handle_datagram(&advertisement(discovery));
        let request = request_nonce(&f.transport.take_sent());

        for _ in 0..2 {
            f.engine.on_request_timer();
            let sent = f.transport.take_sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(request_nonce(&sent), request);
            assert_eq!(f.engine.phase(), HandshakePhase::Requesting);
        }

        f.engine.on_request_timer();
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);
        let sent = f.transport.take_sent();
        assert!(matches!(sent.as_slice(), [AmtMessage::RelayDiscovery { .. }]));
        assert_eq!(
            f.transport.peers.lock().last().copied(),
            Some("192.0.2.1:2268".parse().unwrap())
        );
        assert_eq!(f.engine.stats().requests_sent, 3);
        assert_eq!(f.engine.stats().discoveries_sent, 2);
    }

    #[test]
    fn test_receive_unreachable_after_giving_up() {
        let f = fixture_with(TunnelConfig {
            discovery_interval: Duration::from_secs(600),
            discovery_retries: Some(1),
            request_interval: Duration::from_secs(600),
            ..TunnelConfig::default()
        });
        let unreachable = SocketError::Io(io::Error::from(ErrorKind::ConnectionRefused));

        f.engine.send(&report(GroupRecordType::ChangeToExcludeMode)).unwrap();
        f.transport.take_sent();
        f.engine.on_discovery_timer();
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);

        f.engine.on_receive_unreachable(&unreachable);
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);
        assert!(f.transport.take_sent().is_empty());

        // A relay that had answered is rediscovered
        let f = fixture();
        establish(&f, None);
        f.transport.take_sent();
        f.engine.on_receive_unreachable(&unreachable);
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);
        let sent = f.transport.take_sent();
        assert!(matches!(sent.as_slice(), [AmtMessage::RelayDiscovery { .. }]));
    }

    #[test]
    fn test_other_send_errors_surface() {
        let f = fixture();
        establish(&f, None);

        *f.transport.fail_with.lock() = Some(ErrorKind::PermissionDenied);
        let result = f.engine.send(&report(GroupRecordType::ChangeToExcludeMode));
        assert!(matches!(result, Err(TunnelError::Socket(_))));
        assert_eq!(f.engine.phase(), HandshakePhase::Established);
    }

    #[test]
    fn test_gateway_change_sends_teardown() {
        let f = fixture();
        let first = establish(&f, Some("203.0.113.5:4000"));
        f.transport.take_sent();

        // Keepalive request, answered from a different NAT mapping
        {
            let mut state = f.engine.state.lock();
            f.engine.send_request(&mut state);
        }
        let second = request_nonce(&f.transport.take_sent());
        f.engine
            .handle_datagram(&query_message(second, Some("203.0.113.5:4001")));

        let sent = f.transport.take_sent();
        assert_eq!(
            sent,
            vec![AmtMessage::Teardown {
                mac: MAC,
                nonce: first,
                gateway: "203.0.113.5:4000".parse().unwrap(),
            }]
        );
        assert_eq!(f.engine.stats().teardowns_sent, 1);
    }

    #[test]
    fn test_data_forwarded_to_listener() {
        let f = fixture();
        let packet = UdpDatagram {
            source: "10.0.0.1".parse().unwrap(),
            source_port: 1000,
            destination: "232.1.1.1".parse().unwrap(),
            destination_port: 5004,
            payload: Bytes::from_static(b"payload"),
        }
        .to_packet(16)
        .unwrap();

        f.engine.handle_datagram(
            &AmtMessage::MulticastData {
                packet: packet.clone(),
            }
            .encode(),
        );
        assert_eq!(*f.listener.data.lock(), vec![packet]);
    }

    #[test]
    fn test_garbage_dropped() {
        let f = fixture();
        f.engine.handle_datagram(&[0x0f, 0, 0]);
        f.engine.handle_datagram(&[]);
        assert_eq!(f.engine.stats().messages_dropped, 2);
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);
    }

    #[test]
    fn test_receive_loop_and_close() {
        let f = fixture();
        f.engine.start().unwrap();
        assert!(f.engine.is_running());
        assert_eq!(f.engine.phase(), HandshakePhase::Discovering);

        let nonce = discovery_nonce(&f.transport.take_sent());
        f.transport.inbound.lock().push_back(advertisement(nonce));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.engine.phase() != HandshakePhase::Requesting {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        f.engine.close();
        f.engine.close();
        assert!(f.engine.is_closed());
        assert!(!f.engine.is_running());
        assert_eq!(f.engine.phase(), HandshakePhase::Disconnected);
        assert!(matches!(
            f.engine.send(&report(GroupRecordType::ChangeToExcludeMode)),
            Err(TunnelError::Closed)
        ));
    }
}
