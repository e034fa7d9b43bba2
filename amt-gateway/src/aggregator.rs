//! Interface membership aggregator
//!
//! Holds the reception state of every group joined on one tunnel interface
//! and turns joins, leaves and relay queries into IGMPv3 / MLDv2 reports.
//!
//! Reception state per group is kept as the set of local requests that
//! produced it: an any-source join, the sources joined individually, and the
//! sources blocked while any-source is joined. The reported filter is
//!
//! - `EXCLUDE(blocked - joined sources)` while any-source is joined
//! - `INCLUDE(joined sources)` otherwise, and no filter at all when empty
//!
//! Leaving a source that was joined on its own drops only that request: while
//! the any-source join is held the source is still received through it. Only
//! leaving a source that was never joined on its own blocks it.
//!
//! State changes are reported immediately and then retransmitted
//! `robustness - 1` times at the unsolicited report interval (RFC 3376
//! section 5.1). Queries are answered either immediately or after a random
//! delay with per-group coalescing (RFC 3376 section 5.2).

use crate::tunnel::{SendOutcome, TunnelEngine, TunnelError};
use amt_io::time::{Scheduler, TimerHandle};
use amt_protocol::ip::{AddressFamily, IpPacket};
use amt_protocol::membership::{
    GroupRecord, GroupRecordType, MembershipCodecError, MembershipQuery, MembershipReport,
    DEFAULT_QUERY_INTERVAL, DEFAULT_ROBUSTNESS,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Membership errors
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Not a multicast group: {0}")]
    InvalidGroup(IpAddr),

    #[error("Invalid source {source_addr} for group {group}")]
    InvalidSource { group: IpAddr, source_addr: IpAddr },

    #[error("Address family mismatch (interface {expected}, group {actual})")]
    FamilyMismatch {
        expected: AddressFamily,
        actual: AddressFamily,
    },

    #[error("Interface is closed")]
    Closed,

    #[error("Report encoding failed: {0}")]
    Codec(#[from] MembershipCodecError),

    #[error("Report send failed: {0}")]
    Send(#[from] TunnelError),
}

/// Source filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Aggregate reception state reported for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    pub group: IpAddr,
    pub mode: FilterMode,
    pub sources: BTreeSet<IpAddr>,
}

impl SourceFilter {
    /// MODE_IS_INCLUDE / MODE_IS_EXCLUDE record describing this filter
    pub fn current_state_record(&self) -> GroupRecord {
        let record_type = match self.mode {
            FilterMode::Include => GroupRecordType::ModeIsInclude,
            FilterMode::Exclude => GroupRecordType::ModeIsExclude,
        };
        GroupRecord::new(record_type, self.group, &self.sources)
    }

    /// Answer to a group-and-source-specific query
    ///
    /// The queried sources this filter receives, as a MODE_IS_INCLUDE
    /// record; `None` when it receives none of them.
    pub fn query_response(&self, queried: &BTreeSet<IpAddr>) -> Option<GroupRecord> {
        let receiving: BTreeSet<IpAddr> = match self.mode {
            FilterMode::Include => queried.intersection(&self.sources).copied().collect(),
            FilterMode::Exclude => queried.difference(&self.sources).copied().collect(),
        };
        if receiving.is_empty() {
            return None;
        }
        Some(GroupRecord::new(
            GroupRecordType::ModeIsInclude,
            self.group,
            &receiving,
        ))
    }
}

/// How query responses are timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResponseMode {
    /// Respond synchronously on receipt
    Immediate,
    /// Respond after a uniform random delay up to the query's maximum
    /// response time, coalescing overlapping queries
    Randomized,
}

/// Aggregator parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Robustness variable used until a query carries one
    pub robustness: u8,
    /// Query interval used until a query carries one
    pub query_interval: Duration,
    /// Interval between state-change report retransmissions
    pub unsolicited_report_interval: Duration,
    pub response_mode: QueryResponseMode,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            robustness: DEFAULT_ROBUSTNESS,
            query_interval: DEFAULT_QUERY_INTERVAL,
            unsolicited_report_interval: Duration::from_secs(1),
            response_mode: QueryResponseMode::Randomized,
        }
    }
}

/// Outbound path for membership reports
pub trait ReportSender: Send + Sync {
    fn family(&self) -> AddressFamily;

    /// Source address for report packets
    fn local_ip(&self) -> IpAddr;

    fn send_report(&self, packet: &IpPacket) -> Result<SendOutcome, TunnelError>;
}

impl ReportSender for TunnelEngine {
    fn family(&self) -> AddressFamily {
        TunnelEngine::family(self)
    }

    fn local_ip(&self) -> IpAddr {
        TunnelEngine::local_ip(self)
    }

    fn send_report(&self, packet: &IpPacket) -> Result<SendOutcome, TunnelError> {
        self.send(packet)
    }
}

/// Interface-level join/leave, as driven by the channel tree
pub trait MembershipControl: Send + Sync {
    fn join(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError>;

    fn leave(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError>;
}

#[derive(Debug, Clone, Default)]
struct Reception {
    any_source: bool,
    joined: BTreeSet<IpAddr>,
    blocked: BTreeSet<IpAddr>,
}

impl Reception {
    fn filter(&self, group: IpAddr) -> Option<SourceFilter> {
        if self.any_source {
            Some(SourceFilter {
                group,
                mode: FilterMode::Exclude,
                sources: self.blocked.difference(&self.joined).copied().collect(),
            })
        } else if self.joined.is_empty() {
            None
        } else {
            Some(SourceFilter {
                group,
                mode: FilterMode::Include,
                sources: self.joined.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StateChange {
    Mode {
        mode: FilterMode,
        sources: BTreeSet<IpAddr>,
    },
    Sources {
        allow: BTreeSet<IpAddr>,
        block: BTreeSet<IpAddr>,
    },
}

impl StateChange {
    fn between(old: Option<&SourceFilter>, new: Option<&SourceFilter>) -> Option<Self> {
        let empty = BTreeSet::new();
        let (old_mode, old_sources) =
            old.map_or((FilterMode::Include, &empty), |f| (f.mode, &f.sources));
        let (new_mode, new_sources) =
            new.map_or((FilterMode::Include, &empty), |f| (f.mode, &f.sources));

        if old_mode != new_mode {
            return Some(StateChange::Mode {
                mode: new_mode,
                sources: new_sources.clone(),
            });
        }
        if old_sources == new_sources {
            return None;
        }

        let added: BTreeSet<IpAddr> = new_sources.difference(old_sources).copied().collect();
        let removed: BTreeSet<IpAddr> = old_sources.difference(new_sources).copied().collect();
        let (allow, block) = match new_mode {
            FilterMode::Include => (added, removed),
            FilterMode::Exclude => (removed, added),
        };
        Some(StateChange::Sources { allow, block })
    }

    /// Fold a later change into a pending one
    fn merge(&mut self, next: StateChange, current: Option<&SourceFilter>) {
        match next {
            next @ StateChange::Mode { .. } => *self = next,
            StateChange::Sources {
                allow: next_allow,
                block: next_block,
            } => match self {
                StateChange::Mode { sources, .. } => {
                    *sources = current.map(|f| f.sources.clone()).unwrap_or_default();
                }
                StateChange::Sources { allow, block } => {
                    let merged_allow = allow
                        .union(&next_allow)
                        .filter(|s| !next_block.contains(s))
                        .copied()
                        .collect();
                    let merged_block = block
                        .union(&next_block)
                        .filter(|s| !next_allow.contains(s))
                        .copied()
                        .collect();
                    *allow = merged_allow;
                    *block = merged_block;
                }
            },
        }
    }

    fn records(&self, group: IpAddr) -> Vec<GroupRecord> {
        match self {
            StateChange::Mode { mode, sources } => {
                let record_type = match mode {
                    FilterMode::Include => GroupRecordType::ChangeToIncludeMode,
                    FilterMode::Exclude => GroupRecordType::ChangeToExcludeMode,
                };
                vec![GroupRecord::new(record_type, group, sources)]
            }
            StateChange::Sources { allow, block } => {
                let mut records = Vec::with_capacity(2);
                if !allow.is_empty() {
                    records.push(GroupRecord::new(
                        GroupRecordType::AllowNewSources,
                        group,
                        allow,
                    ));
                }
                if !block.is_empty() {
                    records.push(GroupRecord::new(
                        GroupRecordType::BlockOldSources,
                        group,
                        block,
                    ));
                }
                records
            }
        }
    }
}

/// A scheduled timer tagged with the generation its callback carries
///
/// A callback whose generation no longer matches the armed one belongs to a
/// timer that was replaced while it was firing and must not touch the state.
struct Armed {
    generation: u64,
    timer: TimerHandle,
}

struct PendingStateChange {
    change: StateChange,
    retransmissions: u8,
    armed: Armed,
}

struct PendingGroupQuery {
    /// `None` answers for the whole group
    sources: Option<BTreeSet<IpAddr>>,
    armed: Armed,
}

struct AggregatorState {
    reception: BTreeMap<IpAddr, Reception>,
    state_changes: HashMap<IpAddr, PendingStateChange>,
    group_queries: HashMap<IpAddr, PendingGroupQuery>,
    general_query: Option<Armed>,
    generation: u64,
    robustness: u8,
    query_interval: Duration,
    closed: bool,
}

impl AggregatorState {
    fn filter(&self, group: &IpAddr) -> Option<SourceFilter> {
        self.reception.get(group).and_then(|r| r.filter(*group))
    }

    fn general_records(&self) -> Vec<GroupRecord> {
        self.reception
            .iter()
            .filter_map(|(group, reception)| reception.filter(*group))
            .map(|filter| filter.current_state_record())
            .collect()
    }

    fn group_records(
        &self,
        group: &IpAddr,
        sources: Option<&BTreeSet<IpAddr>>,
    ) -> Vec<GroupRecord> {
        let filter = match self.filter(group) {
            Some(filter) => filter,
            None => return Vec::new(),
        };
        match sources {
            None => vec![filter.current_state_record()],
            Some(queried) => filter.query_response(queried).into_iter().collect(),
        }
    }

    fn general_query_due(&self) -> Option<Duration> {
        self.general_query
            .as_ref()
            .map(|armed| &armed.timer)
            .filter(|timer| timer.is_pending())
            .map(TimerHandle::remaining)
    }

    fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Restore a group's reception and pending change after a failed report
    fn revert(
        &mut self,
        group: IpAddr,
        reception: Option<Reception>,
        pending: Option<(StateChange, u8)>,
    ) {
        match reception {
            Some(reception) => {
                self.reception.insert(group, reception);
            }
            None => {
                self.reception.remove(&group);
            }
        }
        match pending {
            Some((change, retransmissions)) => {
                if let Some(p) = self.state_changes.get_mut(&group) {
                    p.change = change;
                    p.retransmissions = retransmissions;
                }
            }
            None => {
                if let Some(p) = self.state_changes.remove(&group) {
                    p.armed.timer.cancel();
                }
            }
        }
    }

    fn cancel_timers(&mut self) {
        for pending in self.state_changes.values() {
            pending.armed.timer.cancel();
        }
        for pending in self.group_queries.values() {
            pending.armed.timer.cancel();
        }
        if let Some(armed) = self.general_query.take() {
            armed.timer.cancel();
        }
        self.state_changes.clear();
        self.group_queries.clear();
    }
}

/// Membership aggregator for one tunnel interface
pub struct MembershipAggregator {
    family: AddressFamily,
    config: MembershipConfig,
    sender: Arc<dyn ReportSender>,
    scheduler: Scheduler,
    state: Mutex<AggregatorState>,
    reports_sent: AtomicU64,
    self_ref: Weak<MembershipAggregator>,
}

impl MembershipAggregator {
    pub fn new(
        config: MembershipConfig,
        sender: Arc<dyn ReportSender>,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let state = AggregatorState {
            reception: BTreeMap::new(),
            state_changes: HashMap::new(),
            group_queries: HashMap::new(),
            general_query: None,
            generation: 0,
            robustness: config.robustness,
            query_interval: config.query_interval,
            closed: false,
        };
        Arc::new_cyclic(|self_ref| MembershipAggregator {
            family: sender.family(),
            config,
            sender,
            scheduler,
            state: Mutex::new(state),
            reports_sent: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Current filter for `group`
    pub fn filter(&self, group: &IpAddr) -> Option<SourceFilter> {
        self.state.lock().filter(group)
    }

    /// Every non-empty filter
    pub fn filters(&self) -> Vec<SourceFilter> {
        let state = self.state.lock();
        state
            .reception
            .iter()
            .filter_map(|(group, reception)| reception.filter(*group))
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().reception.len()
    }

    /// Robustness variable in effect
    pub fn robustness(&self) -> u8 {
        self.state.lock().robustness
    }

    /// Query interval in effect
    pub fn query_interval(&self) -> Duration {
        self.state.lock().query_interval
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports_sent.load(Ordering::Relaxed)
    }

    /// Join `group`, from any source or from `source` only
    pub fn join(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError> {
        self.validate(group, source)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(MembershipError::Closed);
        }

        let old = state.filter(&group);
        let previous = state.reception.get(&group).cloned();
        let pending = state
            .state_changes
            .get(&group)
            .map(|p| (p.change.clone(), p.retransmissions));

        let reception = state.reception.entry(group).or_default();
        match source {
            None => reception.any_source = true,
            Some(source) => {
                reception.joined.insert(source);
                reception.blocked.remove(&source);
            }
        }
        let new = reception.filter(group);

        let result = self.state_change(&mut state, group, old, new);
        if let Err(MembershipError::Send(e)) = &result {
            debug!("Join of {} not reported ({}), reverting", group, e);
            state.revert(group, previous, pending);
        }
        result
    }

    /// Leave `group` (any-source) or stop receiving `source`; leaving
    /// something never joined does nothing
    pub fn leave(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError> {
        self.validate(group, source)?;
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }

        let old = state.filter(&group);
        let reception = match state.reception.get_mut(&group) {
            Some(reception) => reception,
            None => return Ok(()),
        };
        match source {
            None => {
                reception.any_source = false;
                reception.blocked.clear();
            }
            Some(source) => {
                if !reception.joined.remove(&source) && reception.any_source {
                    reception.blocked.insert(source);
                }
            }
        }
        let new = reception.filter(group);
        if new.is_none() {
            state.reception.remove(&group);
        }
        self.state_change(&mut state, group, old, new)
    }

    /// Leave every group, reporting each change; the aggregator stays usable
    pub fn leave_all(&self) -> Result<(), MembershipError> {
        let mut state = self.state.lock();
        let groups: Vec<IpAddr> = state.reception.keys().copied().collect();
        let mut result = Ok(());
        for group in groups {
            let old = state.filter(&group);
            state.reception.remove(&group);
            if let Err(e) = self.state_change(&mut state, group, old, None) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Handle a query the relay sent through the tunnel
    pub fn on_query(&self, query: &MembershipQuery) -> Result<(), MembershipError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if query.robustness != 0 {
            state.robustness = query.robustness;
        }
        if !query.query_interval.is_zero() {
            state.query_interval = query.query_interval;
        }

        let queried: Option<BTreeSet<IpAddr>> = if query.sources.is_empty() {
            None
        } else {
            Some(query.sources.iter().copied().collect())
        };

        match self.config.response_mode {
            QueryResponseMode::Immediate => {
                let records = match query.group {
                    None => state.general_records(),
                    Some(group) => state.group_records(&group, queried.as_ref()),
                };
                self.send_records(records)
            }
            QueryResponseMode::Randomized => {
                let delay = random_delay(query.max_response_delay);
                match query.group {
                    None => self.defer_general_response(&mut state, delay),
                    Some(group) => self.defer_group_response(&mut state, group, queried, delay),
                }
                Ok(())
            }
        }
    }

    /// Cancel every timer and forget all state without reporting
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.cancel_timers();
        state.reception.clear();
    }

    fn validate(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError> {
        let actual = AddressFamily::of(&group);
        if actual != self.family {
            return Err(MembershipError::FamilyMismatch {
                expected: self.family,
                actual,
            });
        }
        if !group.is_multicast() {
            return Err(MembershipError::InvalidGroup(group));
        }
        if let Some(source) = source {
            if AddressFamily::of(&source) != actual
                || source.is_multicast()
                || source.is_unspecified()
            {
                return Err(MembershipError::InvalidSource {
                    group,
                    source_addr: source,
                });
            }
        }
        Ok(())
    }

    fn state_change(
        &self,
        state: &mut AggregatorState,
        group: IpAddr,
        old: Option<SourceFilter>,
        new: Option<SourceFilter>,
    ) -> Result<(), MembershipError> {
        let change = match StateChange::between(old.as_ref(), new.as_ref()) {
            Some(change) => change,
            None => return Ok(()),
        };
        trace!("Group {} state change {:?}", group, change);

        let records = match state.state_changes.get_mut(&group) {
            Some(pending) => {
                pending.change.merge(change, new.as_ref());
                pending.change.records(group)
            }
            None => {
                let records = change.records(group);
                let retransmissions = state.robustness.saturating_sub(1);
                if retransmissions > 0 {
                    let armed = self.schedule_retransmission(state, group);
                    state.state_changes.insert(
                        group,
                        PendingStateChange {
                            change,
                            retransmissions,
                            armed,
                        },
                    );
                }
                records
            }
        };

        self.send_records(records)
    }

    fn schedule_retransmission(&self, state: &mut AggregatorState, group: IpAddr) -> Armed {
        let generation = state.next_generation();
        let weak = self.self_ref.clone();
        let timer = self
            .scheduler
            .schedule(self.config.unsolicited_report_interval, move || {
                if let Some(aggregator) = weak.upgrade() {
                    aggregator.on_retransmission_timer(group, generation);
                }
            });
        Armed { generation, timer }
    }

    fn on_retransmission_timer(&self, group: IpAddr, generation: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let (records, remaining) = match state.state_changes.get_mut(&group) {
            Some(pending) if pending.armed.generation == generation => {
                pending.retransmissions = pending.retransmissions.saturating_sub(1);
                (pending.change.records(group), pending.retransmissions)
            }
            _ => return,
        };
        if remaining == 0 {
            state.state_changes.remove(&group);
        } else {
            let armed = self.schedule_retransmission(&mut state, group);
            if let Some(pending) = state.state_changes.get_mut(&group) {
                pending.armed = armed;
            }
        }

        debug!("Retransmitting state change for {} ({} left)", group, remaining);
        if let Err(e) = self.send_records(records) {
            error!("State change report for {} failed: {}", group, e);
        }
    }

    fn defer_general_response(&self, state: &mut AggregatorState, delay: Duration) {
        if state.general_query_due().map_or(false, |due| due <= delay) {
            return;
        }
        if let Some(armed) = state.general_query.take() {
            armed.timer.cancel();
        }

        let generation = state.next_generation();
        let weak = self.self_ref.clone();
        let timer = self.scheduler.schedule(delay, move || {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.on_general_query_timer(generation);
            }
        });
        state.general_query = Some(Armed { generation, timer });
    }

    fn defer_group_response(
        &self,
        state: &mut AggregatorState,
        group: IpAddr,
        queried: Option<BTreeSet<IpAddr>>,
        delay: Duration,
    ) {
        if state.general_query_due().map_or(false, |due| due <= delay) {
            trace!("General response already due, ignoring query for {}", group);
            return;
        }

        let pending_timer = state
            .group_queries
            .get(&group)
            .map(|pending| pending.armed.timer.clone())
            .filter(TimerHandle::is_pending);
        match pending_timer {
            Some(timer) => {
                let rearm = delay < timer.remaining();
                let armed = if rearm {
                    timer.cancel();
                    Some(self.schedule_group_query(state, group, delay))
                } else {
                    None
                };
                if let Some(pending) = state.group_queries.get_mut(&group) {
                    pending.sources = match (pending.sources.take(), queried) {
                        (Some(mut held), Some(queried)) => {
                            held.extend(queried);
                            Some(held)
                        }
                        _ => None,
                    };
                    if let Some(armed) = armed {
                        pending.armed = armed;
                    }
                }
            }
            None => {
                let armed = self.schedule_group_query(state, group, delay);
                state.group_queries.insert(
                    group,
                    PendingGroupQuery {
                        sources: queried,
                        armed,
                    },
                );
            }
        }
    }

    fn schedule_group_query(
        &self,
        state: &mut AggregatorState,
        group: IpAddr,
        delay: Duration,
    ) -> Armed {
        let generation = state.next_generation();
        let weak = self.self_ref.clone();
        let timer = self.scheduler.schedule(delay, move || {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.on_group_query_timer(group, generation);
            }
        });
        Armed { generation, timer }
    }

    fn on_general_query_timer(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let current = state
            .general_query
            .as_ref()
            .map_or(false, |armed| armed.generation == generation);
        if !current {
            return;
        }
        state.general_query = None;
        let records = state.general_records();
        if let Err(e) = self.send_records(records) {
            error!("General query response failed: {}", e);
        }
    }

    fn on_group_query_timer(&self, group: IpAddr, generation: u64) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let current = state
            .group_queries
            .get(&group)
            .map_or(false, |pending| pending.armed.generation == generation);
        if !current {
            return;
        }
        let pending = match state.group_queries.remove(&group) {
            Some(pending) => pending,
            None => return,
        };
        let records = state.group_records(&group, pending.sources.as_ref());
        if let Err(e) = self.send_records(records) {
            error!("Query response for {} failed: {}", group, e);
        }
    }

    fn send_records(&self, records: Vec<GroupRecord>) -> Result<(), MembershipError> {
        if records.is_empty() {
            return Ok(());
        }
        let packet = MembershipReport::with_records(self.family, records)
            .to_packet(self.sender.local_ip())?;

        match self.sender.send_report(&packet) {
            Ok(SendOutcome::Sent) => {
                self.reports_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(SendOutcome::NotReady) => {
                debug!("Tunnel not ready, report dropped");
                Ok(())
            }
            Err(TunnelError::Unreachable) => {
                debug!("Relay unreachable, report dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    fn pending_query_sources(&self, group: &IpAddr) -> Option<Option<BTreeSet<IpAddr>>> {
        self.state
            .lock()
            .group_queries
            .get(group)
            .map(|pending| pending.sources.clone())
    }
}

impl MembershipControl for MembershipAggregator {
    fn join(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError> {
        MembershipAggregator::join(self, group, source)
    }

    fn leave(&self, group: IpAddr, source: Option<IpAddr>) -> Result<(), MembershipError> {
        MembershipAggregator::leave(self, group, source)
    }
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
