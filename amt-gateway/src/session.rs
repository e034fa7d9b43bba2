//! Tunnel handshake state
//!
//! Pure state machine for one AMT tunnel: relay discovery, request, and the
//! query that establishes the session. No I/O happens here; the tunnel engine
//! feeds inbound messages in and transmits whatever this module builds.
//!
//! ```text
//! Disconnected -> Discovering -> Requesting -> Established
//!                      ^              |             |
//!                      +-- retries ---+  keepalive  |
//!                                     ^-------------+
//! ```

use amt_protocol::ip::{AddressFamily, IpPacket};
use amt_protocol::message::{AmtMessage, ResponseMac};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Unexpected {message} in phase {phase}")]
    UnexpectedMessage {
        message: &'static str,
        phase: HandshakePhase,
    },

    #[error("Nonce mismatch (expected {expected:#010x}, received {received:#010x})")]
    NonceMismatch { expected: u32, received: u32 },
}

/// Handshake phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    /// No discovery outstanding
    Disconnected,
    /// Relay Discovery sent, waiting for an Advertisement
    Discovering,
    /// Request sent, waiting for a Membership Query
    Requesting,
    /// A query has been accepted and updates may be sent
    Established,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakePhase::Disconnected => "disconnected",
            HandshakePhase::Discovering => "discovering",
            HandshakePhase::Requesting => "requesting",
            HandshakePhase::Established => "established",
        };
        f.write_str(name)
    }
}

/// What the relay handed out in its last accepted Membership Query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryGrant {
    pub mac: ResponseMac,
    /// Request nonce the query echoed
    pub nonce: u32,
    /// Gateway address as observed by the relay, when reported
    pub gateway: Option<SocketAddr>,
    /// The relay will not accept further updates
    pub limited: bool,
}

/// Result of retrying the outstanding Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRetry {
    Resend(AmtMessage),
    Exhausted,
}

/// Handshake state of one tunnel
#[derive(Debug, Clone)]
pub struct TunnelSession {
    family: AddressFamily,
    phase: HandshakePhase,
    discovery_nonce: Option<u32>,
    discovery_attempts: u32,
    relay: Option<IpAddr>,
    request_nonce: Option<u32>,
    request_attempts: u32,
    last_query: Option<QueryGrant>,
    query_interval: Duration,
    default_query_interval: Duration,
}

impl TunnelSession {
    pub fn new(family: AddressFamily, default_query_interval: Duration) -> Self {
        TunnelSession {
            family,
            phase: HandshakePhase::Disconnected,
            discovery_nonce: None,
            discovery_attempts: 0,
            relay: None,
            request_nonce: None,
            request_attempts: 0,
            last_query: None,
            query_interval: default_query_interval,
            default_query_interval,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Relay address learned from the last accepted Advertisement
    pub fn relay(&self) -> Option<IpAddr> {
        self.relay
    }

    pub fn last_query(&self) -> Option<&QueryGrant> {
        self.last_query.as_ref()
    }

    /// Interval the relay expects between refreshes
    pub fn query_interval(&self) -> Duration {
        self.query_interval
    }

    /// Updates can be sent once a query has been accepted
    pub fn can_send(&self) -> bool {
        self.last_query.is_some()
    }

    /// Forget everything and return to `Disconnected`
    pub fn reset(&mut self) {
        *self = TunnelSession::new(self.family, self.default_query_interval);
    }

    /// Drop the session and start discovering with `nonce`
    pub fn start_discovery(&mut self, nonce: u32) -> AmtMessage {
        self.reset();
        self.phase = HandshakePhase::Discovering;
        self.discovery_nonce = Some(nonce);
        self.discovery_attempts = 1;
        AmtMessage::RelayDiscovery { nonce }
    }

    /// Retransmit the outstanding discovery, or give up once `limit`
    /// transmissions have been made
    pub fn retry_discovery(&mut self, limit: Option<u32>) -> Option<AmtMessage> {
        if self.phase != HandshakePhase::Discovering {
            return None;
        }
        let nonce = self.discovery_nonce?;
        if limit.map_or(false, |limit| self.discovery_attempts >= limit) {
            self.reset();
            return None;
        }
        self.discovery_attempts += 1;
        Some(AmtMessage::RelayDiscovery { nonce })
    }

    pub fn discovery_attempts(&self) -> u32 {
        self.discovery_attempts
    }

    /// Accept an Advertisement answering the outstanding discovery
    pub fn on_advertisement(&mut self, nonce: u32, relay: IpAddr) -> Result<(), HandshakeError> {
        if self.phase != HandshakePhase::Discovering {
            return Err(HandshakeError::UnexpectedMessage {
                message: "Relay Advertisement",
                phase: self.phase,
            });
        }
        let expected = self.discovery_nonce.unwrap_or_default();
        if nonce != expected {
            return Err(HandshakeError::NonceMismatch {
                expected,
                received: nonce,
            });
        }

        self.relay = Some(relay);
        self.discovery_nonce = None;
        self.discovery_attempts = 0;
        Ok(())
    }

    /// Send a Request with `nonce`, either after discovery or as a keepalive
    /// from `Established`
    pub fn start_request(&mut self, nonce: u32) -> Option<AmtMessage> {
        match self.phase {
            HandshakePhase::Discovering if self.relay.is_some() => {}
            HandshakePhase::Requesting | HandshakePhase::Established => {}
            _ => return None,
        }
        self.phase = HandshakePhase::Requesting;
        self.request_nonce = Some(nonce);
        self.request_attempts = 1;
        Some(AmtMessage::Request {
            nonce,
            family: self.family,
        })
    }

    /// Retransmit the outstanding Request, at most `limit` extra times
    pub fn retry_request(&mut self, limit: u32) -> Option<RequestRetry> {
        if self.phase != HandshakePhase::Requesting {
            return None;
        }
        let nonce = self.request_nonce?;
        if self.request_attempts > limit {
            return Some(RequestRetry::Exhausted);
        }
        self.request_attempts += 1;
        Some(RequestRetry::Resend(AmtMessage::Request {
            nonce,
            family: self.family,
        }))
    }

    /// Accept a Membership Query answering the outstanding Request
    ///
    /// Returns the previous grant when the relay now sees the gateway at a
    /// different address; that session must be torn down.
    pub fn on_query(
        &mut self,
        grant: QueryGrant,
        query_interval: Option<Duration>,
    ) -> Result<Option<QueryGrant>, HandshakeError> {
        if !matches!(
            self.phase,
            HandshakePhase::Requesting | HandshakePhase::Established
        ) {
            return Err(HandshakeError::UnexpectedMessage {
                message: "Membership Query",
                phase: self.phase,
            });
        }
        let expected = self.request_nonce.unwrap_or_default();
        if grant.nonce != expected {
            return Err(HandshakeError::NonceMismatch {
                expected,
                received: grant.nonce,
            });
        }

        let stale = self.last_query.filter(|previous| {
            matches!(
                (previous.gateway, grant.gateway),
                (Some(old), Some(new)) if old != new
            )
        });

        self.last_query = Some(grant);
        self.query_interval = query_interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(self.default_query_interval);
        self.request_attempts = 0;
        self.phase = HandshakePhase::Established;
        Ok(stale)
    }

    /// Membership Update carrying `report`, authenticated by the last query
    pub fn update_message(&self, report: IpPacket) -> Option<AmtMessage> {
        let grant = self.last_query.as_ref()?;
        Some(AmtMessage::MembershipUpdate {
            mac: grant.mac,
            nonce: grant.nonce,
            report,
        })
    }
}

/// Teardown for a session the relay knew under a previous gateway address
pub fn teardown_message(grant: &QueryGrant) -> Option<AmtMessage> {
    grant.gateway.map(|gateway| AmtMessage::Teardown {
        mac: grant.mac,
        nonce: grant.nonce,
        gateway,
    })
}
