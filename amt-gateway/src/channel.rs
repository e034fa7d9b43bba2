//! Channel fan-out tree
//!
//! Multiplexes subscriber sinks over one tunnel interface. Subscriptions are
//! kept as `group -> port -> sinks` for any-source channels and
//! `group -> source -> port -> sinks` for source-specific ones. The interface
//! is joined when the first sink appears under a `(group)` or
//! `(group, source)` branch and left when the last one goes; empty branches
//! are pruned immediately.

use crate::aggregator::{MembershipControl, MembershipError};
use amt_protocol::ip::{AddressFamily, UdpDatagram};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Not a multicast group: {0}")]
    InvalidGroup(IpAddr),

    #[error("Invalid source {source_addr} for group {group}")]
    InvalidSource { group: IpAddr, source_addr: IpAddr },

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
}

/// Delivery failure reported by a sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink is gone; only it is removed
    #[error("Sink disconnected")]
    Disconnected,

    /// Unrecoverable failure; the whole tree is flushed
    #[error("Sink failed: {0}")]
    Fatal(String),
}

/// Identity of a subscriber sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkId(u64);

impl SinkId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SinkId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Receiver of datagrams for subscribed channels
pub trait DatagramSink: Send + Sync {
    fn id(&self) -> SinkId;

    fn deliver(&self, datagram: &UdpDatagram) -> Result<(), SinkError>;
}

/// Channel tree counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub groups: usize,
    pub channels: usize,
    pub delivered: u64,
    pub evictions: u64,
    pub flushes: u64,
}

type SinkSet = BTreeMap<SinkId, Arc<dyn DatagramSink>>;
type PortMap = BTreeMap<u16, SinkSet>;

#[derive(Default)]
struct GroupNode {
    any_source: PortMap,
    by_source: BTreeMap<IpAddr, PortMap>,
}

impl GroupNode {
    fn is_empty(&self) -> bool {
        self.any_source.is_empty() && self.by_source.is_empty()
    }

    fn ports(&self, source: Option<IpAddr>) -> Option<&PortMap> {
        match source {
            None => Some(&self.any_source),
            Some(source) => self.by_source.get(&source),
        }
    }

    /// Remove one sink from one channel; returns true when that left the
    /// `(group[, source])` branch empty
    fn remove(&mut self, sink: SinkId, source: Option<IpAddr>, port: u16) -> bool {
        let ports = match source {
            None => &mut self.any_source,
            Some(source) => match self.by_source.get_mut(&source) {
                Some(ports) => ports,
                None => return false,
            },
        };
        let sinks = match ports.get_mut(&port) {
            Some(sinks) => sinks,
            None => return false,
        };
        if sinks.remove(&sink).is_none() {
            return false;
        }
        if sinks.is_empty() {
            ports.remove(&port);
        }
        if !ports.is_empty() {
            return false;
        }
        if let Some(source) = source {
            self.by_source.remove(&source);
        }
        true
    }

    /// Every `(source, port)` the sink is subscribed under
    fn channels_of(&self, sink: SinkId) -> Vec<(Option<IpAddr>, u16)> {
        let any = self
            .any_source
            .iter()
            .filter(|(_, sinks)| sinks.contains_key(&sink))
            .map(|(port, _)| (None, *port));
        let specific = self.by_source.iter().flat_map(|(source, ports)| {
            ports
                .iter()
                .filter(|(_, sinks)| sinks.contains_key(&sink))
                .map(move |(port, _)| (Some(*source), *port))
        });
        any.chain(specific).collect()
    }

    fn channel_count(&self) -> usize {
        self.any_source.len() + self.by_source.values().map(BTreeMap::len).sum::<usize>()
    }
}

/// Fan-out tree for one tunnel interface
pub struct ChannelTree {
    control: Arc<dyn MembershipControl>,
    groups: Mutex<BTreeMap<IpAddr, GroupNode>>,
    delivered: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

impl ChannelTree {
    pub fn new(control: Arc<dyn MembershipControl>) -> Self {
        ChannelTree {
            control,
            groups: Mutex::new(BTreeMap::new()),
            delivered: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Subscribe `sink` to datagrams for `group` (from `source`, if given)
    /// addressed to `port`
    pub fn join(
        &self,
        sink: Arc<dyn DatagramSink>,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), ChannelError> {
        validate(group, source)?;
        let mut groups = self.groups.lock();

        let branch_empty = groups
            .get(&group)
            .and_then(|node| node.ports(source))
            .map_or(true, BTreeMap::is_empty);
        if branch_empty {
            self.control.join(group, source)?;
        }

        let node = groups.entry(group).or_default();
        let ports = match source {
            None => &mut node.any_source,
            Some(source) => node.by_source.entry(source).or_default(),
        };
        let id = sink.id();
        ports.entry(port).or_default().insert(id, sink);
        debug!("{} joined {}", id, describe(group, source, port));
        Ok(())
    }

    /// Unsubscribe `sink` from one channel; unknown channels are ignored
    pub fn leave(
        &self,
        sink: SinkId,
        group: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(), ChannelError> {
        let mut groups = self.groups.lock();
        let node = match groups.get_mut(&group) {
            Some(node) => node,
            None => return Ok(()),
        };
        let emptied = node.remove(sink, source, port);
        if node.is_empty() {
            groups.remove(&group);
        }
        if emptied {
            debug!("Last subscriber left {}", describe(group, source, port));
            self.control.leave(group, source)?;
        }
        Ok(())
    }

    /// Unsubscribe `sink` from every channel
    pub fn leave_sink(&self, sink: SinkId) -> Result<(), ChannelError> {
        let mut groups = self.groups.lock();
        let mut emptied = Vec::new();

        for (group, node) in groups.iter_mut() {
            for (source, port) in node.channels_of(sink) {
                if node.remove(sink, source, port) {
                    emptied.push((*group, source));
                }
            }
        }
        groups.retain(|_, node| !node.is_empty());

        let mut result = Ok(());
        for (group, source) in emptied {
            if let Err(e) = self.control.leave(group, source) {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Deliver a datagram to every sink subscribed to its channel
    ///
    /// Returns the number of successful deliveries. A disconnected sink is
    /// unsubscribed; a fatal sink error flushes the whole tree.
    pub fn dispatch(&self, datagram: &UdpDatagram) -> usize {
        let sinks: Vec<Arc<dyn DatagramSink>> = {
            let groups = self.groups.lock();
            let node = match groups.get(&datagram.destination) {
                Some(node) => node,
                None => return 0,
            };
            let mut matched = SinkSet::new();
            for source in [None, Some(datagram.source)] {
                if let Some(sinks) = node
                    .ports(source)
                    .and_then(|ports| ports.get(&datagram.destination_port))
                {
                    matched.extend(sinks.iter().map(|(id, sink)| (*id, Arc::clone(sink))));
                }
            }
            matched.into_values().collect()
        };

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        let mut fatal = false;
        for sink in sinks {
            match sink.deliver(datagram) {
                Ok(()) => delivered += 1,
                Err(SinkError::Disconnected) => disconnected.push(sink.id()),
                Err(SinkError::Fatal(reason)) => {
                    error!("{} failed: {}", sink.id(), reason);
                    fatal = true;
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);

        if fatal {
            self.flush();
        } else {
            for sink in disconnected {
                debug!("Evicting disconnected {}", sink);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.leave_sink(sink) {
                    warn!("Leave after evicting {} failed: {}", sink, e);
                }
            }
        }
        delivered
    }

    /// Drop every subscription, leaving each joined branch
    pub fn flush(&self) {
        let mut groups = self.groups.lock();
        let taken = std::mem::take(&mut *groups);
        self.flushes.fetch_add(1, Ordering::Relaxed);

        for (group, node) in taken {
            let sources = node.by_source.keys().copied().map(Some);
            let any = (!node.any_source.is_empty()).then_some(None);
            for source in any.into_iter().chain(sources) {
                if let Err(e) = self.control.leave(group, source) {
                    warn!("Leave of {} during flush failed: {}", group, e);
                }
            }
        }
    }

    /// Whether `sink` is subscribed to the given channel
    pub fn contains(&self, sink: SinkId, group: IpAddr, source: Option<IpAddr>, port: u16) -> bool {
        self.groups
            .lock()
            .get(&group)
            .and_then(|node| node.ports(source))
            .and_then(|ports| ports.get(&port))
            .map_or(false, |sinks| sinks.contains_key(&sink))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }

    pub fn stats(&self) -> ChannelStats {
        let groups = self.groups.lock();
        ChannelStats {
            groups: groups.len(),
            channels: groups.values().map(GroupNode::channel_count).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

fn validate(group: IpAddr, source: Option<IpAddr>) -> Result<(), ChannelError> {
    if !group.is_multicast() {
        return Err(ChannelError::InvalidGroup(group));
    }
    if let Some(source) = source {
        if AddressFamily::of(&source) != AddressFamily::of(&group)
            || source.is_multicast()
            || source.is_unspecified()
        {
            return Err(ChannelError::InvalidSource {
                group,
                source_addr: source,
            });
        }
    }
    Ok(())
}

fn describe(group: IpAddr, source: Option<IpAddr>, port: u16) -> String {
    match source {
        Some(source) => format!("({}, {}):{}", source, group, port),
        None => format!("(*, {}):{}", group, port),
    }
}
