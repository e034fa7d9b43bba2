//! IP fragment reassembly
//!
//! Reassembles fragmented IPv4 and IPv6 datagrams using the hole-descriptor
//! algorithm of RFC 815. Each in-progress datagram keeps a doubly-linked list
//! of holes (byte ranges still missing); the datagram is complete when the
//! list is empty. Holes live in a small side arena indexed by position, not
//! inside the payload buffer.
//!
//! The cache holds at most `max_cache_size` datagrams. Fragments of a new
//! datagram that arrive while the cache is full are parked in a pending
//! queue bounded by a byte budget and retried whenever a slot frees.

use crate::ip::{Fragment, IpError, IpPacket, MAX_DATAGRAM_SIZE};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound of the initial hole (the datagram end is unknown until the
/// last fragment arrives)
const HOLE_INFINITY: usize = usize::MAX;

/// Reassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Pending fragment budget exceeded ({pending} + {requested} > {budget} bytes)")]
    PendingBudgetExceeded {
        pending: usize,
        requested: usize,
        budget: usize,
    },

    #[error("IP error: {0}")]
    Ip(#[from] IpError),
}

/// Reassembly limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Maximum number of datagrams reassembled at once
    pub max_cache_size: usize,
    /// Byte budget of the pending-fragment queue
    pub pending_budget: usize,
    /// Age after which an incomplete datagram is evicted
    pub timeout: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            max_cache_size: 16,
            pending_budget: 64 * 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Identifies the datagram a fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub identification: u32,
    /// IPv4 only; IPv6 identifies datagrams by addresses and identification
    pub protocol: Option<u8>,
}

impl FragmentKey {
    /// Key of a fragment, `None` for unfragmented datagrams
    pub fn of(packet: &IpPacket) -> Option<Self> {
        let fragment = packet.fragment_info()?;
        let protocol = match packet.family() {
            crate::ip::AddressFamily::Ipv4 => Some(packet.protocol()),
            crate::ip::AddressFamily::Ipv6 => None,
        };
        Some(FragmentKey {
            source: packet.source(),
            destination: packet.destination(),
            identification: fragment.identification,
            protocol,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Hole {
    first: usize,
    last: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked hole list over an index arena
#[derive(Debug)]
struct HoleList {
    slots: Vec<Hole>,
    free: Vec<usize>,
    head: Option<usize>,
}

impl HoleList {
    fn new() -> Self {
        let mut list = HoleList {
            slots: Vec::with_capacity(4),
            free: Vec::new(),
            head: None,
        };
        list.insert_after(None, 0, HOLE_INFINITY);
        list
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.slots[idx].next;
        }
        count
    }

    /// Link a new hole after `prev` (or at the head) and return its index
    fn insert_after(&mut self, prev: Option<usize>, first: usize, last: usize) -> usize {
        let next = match prev {
            Some(p) => self.slots[p].next,
            None => self.head,
        };
        let hole = Hole {
            first,
            last,
            prev,
            next,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = hole;
                idx
            }
            None => {
                self.slots.push(hole);
                self.slots.len() - 1
            }
        };

        match prev {
            Some(p) => self.slots[p].next = Some(idx),
            None => self.head = Some(idx),
        }
        if let Some(n) = next {
            self.slots[n].prev = Some(idx);
        }
        idx
    }

    fn unlink(&mut self, idx: usize) -> Hole {
        let hole = self.slots[idx];
        match hole.prev {
            Some(p) => self.slots[p].next = hole.next,
            None => self.head = hole.next,
        }
        if let Some(n) = hole.next {
            self.slots[n].prev = hole.prev;
        }
        self.free.push(idx);
        hole
    }

    /// Account for fragment data covering `[first, last]`
    fn fill(&mut self, first: usize, last: usize, more_fragments: bool) {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let hole = self.slots[idx];
            cursor = hole.next;

            if first > hole.last || last < hole.first {
                continue;
            }

            self.unlink(idx);
            let mut anchor = hole.prev;
            if first > hole.first {
                anchor = Some(self.insert_after(anchor, hole.first, first - 1));
            }
            if last < hole.last && more_fragments {
                self.insert_after(anchor, last + 1, hole.last);
            }
        }
    }
}

/// One datagram under reassembly
#[derive(Debug)]
struct ReassemblyBuffer {
    data: Vec<u8>,
    holes: HoleList,
    created: Instant,
    /// Fragment zero, whose header becomes the header of the datagram
    first_fragment: Option<IpPacket>,
    total_len: Option<usize>,
}

impl ReassemblyBuffer {
    fn new(created: Instant) -> Self {
        ReassemblyBuffer {
            data: Vec::new(),
            holes: HoleList::new(),
            created,
            first_fragment: None,
            total_len: None,
        }
    }

    /// Add fragment data; returns false if the fragment was malformed
    fn add(&mut self, packet: &IpPacket, fragment: Fragment) -> bool {
        let payload = packet.payload();
        if payload.is_empty() {
            return false;
        }
        // Every fragment but the last must carry a multiple of 8 bytes.
        if fragment.more && payload.len() % 8 != 0 {
            return false;
        }

        let first = fragment.byte_offset();
        let last = first + payload.len() - 1;
        if last >= MAX_DATAGRAM_SIZE {
            return false;
        }
        if let Some(total) = self.total_len {
            if last >= total || (!fragment.more && last + 1 != total) {
                return false;
            }
        }

        if self.data.len() <= last {
            self.data.resize(last + 1, 0);
        }
        self.data[first..=last].copy_from_slice(&payload);

        if !fragment.more {
            self.total_len = Some(last + 1);
        }
        if fragment.offset == 0 && self.first_fragment.is_none() {
            self.first_fragment = Some(packet.clone());
        }

        self.holes.fill(first, last, fragment.more);
        true
    }

    fn is_complete(&self) -> bool {
        self.holes.is_empty()
    }

    fn assemble(&self) -> Option<Result<IpPacket, IpError>> {
        let first = self.first_fragment.as_ref()?;
        let total = self.total_len?;
        Some(IpPacket::reassembled(first, &self.data[..total]))
    }
}

/// Result of offering one fragment to the cache
#[derive(Debug)]
enum Admission {
    Complete(IpPacket),
    Started,
    Progress,
    Denied,
    Dropped,
}

/// Outcome of a reaper pass
#[derive(Debug, Default)]
pub struct Expired {
    /// Fragment zero of each evicted non-multicast datagram
    pub timed_out: Vec<IpPacket>,
    /// Datagrams completed from the pending queue once slots freed
    pub completed: Vec<IpPacket>,
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub timed_out: u64,
    pub denied: u64,
    pub dropped: u64,
}

/// Fragment reassembly cache
pub struct Reassembler {
    config: ReassemblyConfig,
    cache: HashMap<FragmentKey, ReassemblyBuffer>,
    pending: VecDeque<IpPacket>,
    pending_bytes: usize,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Reassembler {
            config,
            cache: HashMap::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Offer a datagram; returns every datagram completed as a result
    ///
    /// Unfragmented datagrams are returned immediately. A fragment of a new
    /// datagram arriving while the cache is full is queued, and an error is
    /// returned only if the queue's byte budget would be exceeded.
    pub fn process(
        &mut self,
        packet: IpPacket,
        now: Instant,
    ) -> Result<Vec<IpPacket>, ReassemblyError> {
        if !packet.is_fragment() {
            return Ok(vec![packet]);
        }

        let mut out = Vec::new();
        match self.admit(&packet, now) {
            Admission::Denied => self.enqueue(packet)?,
            Admission::Complete(datagram) => {
                out.push(datagram);
                self.retry_pending(now, &mut out);
            }
            Admission::Started => self.retry_pending(now, &mut out),
            Admission::Progress | Admission::Dropped => {}
        }
        Ok(out)
    }

    fn admit(&mut self, packet: &IpPacket, now: Instant) -> Admission {
        let (key, fragment) = match (FragmentKey::of(packet), packet.fragment_info()) {
            (Some(key), Some(fragment)) => (key, fragment),
            _ => return Admission::Dropped,
        };

        let started = !self.cache.contains_key(&key);
        if started && self.cache.len() >= self.config.max_cache_size {
            self.stats.denied += 1;
            return Admission::Denied;
        }

        let buffer = self
            .cache
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(now));

        if !buffer.add(packet, fragment) {
            trace!("Dropping malformed fragment {:?}", packet);
            self.stats.dropped += 1;
            if started {
                self.cache.remove(&key);
            }
            return Admission::Dropped;
        }

        if !buffer.is_complete() {
            return if started {
                Admission::Started
            } else {
                Admission::Progress
            };
        }

        let assembled = buffer.assemble();
        self.cache.remove(&key);
        match assembled {
            Some(Ok(datagram)) => {
                self.stats.completed += 1;
                Admission::Complete(datagram)
            }
            Some(Err(e)) => {
                debug!("Discarding reassembled datagram: {}", e);
                self.stats.dropped += 1;
                Admission::Dropped
            }
            None => {
                self.stats.dropped += 1;
                Admission::Dropped
            }
        }
    }

    fn enqueue(&mut self, packet: IpPacket) -> Result<(), ReassemblyError> {
        let requested = packet.len();
        if self.pending_bytes + requested > self.config.pending_budget {
            return Err(ReassemblyError::PendingBudgetExceeded {
                pending: self.pending_bytes,
                requested,
                budget: self.config.pending_budget,
            });
        }
        self.pending_bytes += requested;
        self.pending.push_back(packet);
        Ok(())
    }

    /// Re-offer pending fragments in arrival order, repeating while a pass
    /// completes a datagram (which frees a slot)
    fn retry_pending(&mut self, now: Instant, out: &mut Vec<IpPacket>) {
        loop {
            if self.pending.is_empty() {
                return;
            }

            let mut completed = false;
            let mut progressed = false;
            let mut still_pending = VecDeque::with_capacity(self.pending.len());

            while let Some(packet) = self.pending.pop_front() {
                match self.admit(&packet, now) {
                    Admission::Denied => {
                        still_pending.push_back(packet);
                        continue;
                    }
                    Admission::Complete(datagram) => {
                        out.push(datagram);
                        completed = true;
                    }
                    Admission::Started | Admission::Progress | Admission::Dropped => {}
                }
                progressed = true;
                self.pending_bytes -= packet.len();
            }

            self.pending = still_pending;
            if !progressed || !completed {
                return;
            }
        }
    }

    /// Evict datagrams older than the reassembly timeout
    pub fn evict_expired(&mut self, now: Instant) -> Expired {
        let timeout = self.config.timeout;
        let expired: Vec<FragmentKey> = self
            .cache
            .iter()
            .filter(|(_, buffer)| now.saturating_duration_since(buffer.created) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        let mut result = Expired::default();
        if expired.is_empty() {
            return result;
        }

        for key in expired {
            if let Some(buffer) = self.cache.remove(&key) {
                self.stats.timed_out += 1;
                debug!("Reassembly of {:?} timed out", key);
                if let Some(first) = buffer.first_fragment {
                    if !first.destination().is_multicast() {
                        result.timed_out.push(first);
                    }
                }
            }
        }

        self.retry_pending(now, &mut result.completed);
        result
    }

    /// Earliest instant at which a cached datagram expires
    pub fn next_expiry(&self) -> Option<Instant> {
        self.cache
            .values()
            .map(|buffer| buffer.created + self.config.timeout)
            .min()
    }

    /// Number of datagrams under reassembly
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of queued fragments waiting for a cache slot
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bytes held by the pending queue
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Discard every cached datagram and pending fragment
    pub fn close(&mut self) {
        self.cache.clear();
        self.pending.clear();
        self.pending_bytes = 0;
    }

    #[cfg(test)]
    fn hole_count(&self, key: &FragmentKey) -> Option<usize> {
        self.cache.get(key).map(|b| b.holes.len())
    }
}
