//! End-to-end tests against an in-process relay over loopback UDP

mod common;

use amt::gateway::{HandshakePhase, QueryResponseMode};
use amt::{DatagramSink, Gateway, GatewayConfig, SinkError, SinkId, UdpDatagram};
use amt_protocol::membership::GroupRecordType;
use amt_protocol::message::AmtMessage;
use bytes::Bytes;
use common::{FakeRelay, RELAY_MAC};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Collector {
    id: SinkId,
    payloads: Mutex<Vec<Bytes>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Collector {
            id: SinkId::next(),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().clone()
    }
}

impl DatagramSink for Collector {
    fn id(&self) -> SinkId {
        self.id
    }

    fn deliver(&self, datagram: &UdpDatagram) -> Result<(), SinkError> {
        self.payloads.lock().push(datagram.payload.clone());
        Ok(())
    }
}

fn gateway_for(relay: &FakeRelay) -> Gateway {
    let mut config = GatewayConfig::default();
    config.tunnel.relay_port = relay.port();
    config.tunnel.discovery_interval = Duration::from_millis(200);
    config.tunnel.request_interval = Duration::from_millis(200);
    config.tunnel.receive_timeout = Duration::from_millis(20);
    config.membership.unsolicited_report_interval = Duration::from_millis(200);
    config.membership.response_mode = QueryResponseMode::Immediate;
    Gateway::new(config).unwrap()
}

fn multicast(group: &str, port: u16, payload: Vec<u8>) -> amt::IpPacket {
    UdpDatagram {
        source: "10.1.1.1".parse().unwrap(),
        source_port: 4000,
        destination: group.parse().unwrap(),
        destination_port: port,
        payload: Bytes::from(payload),
    }
    .to_packet(16)
    .unwrap()
}

fn reports_group(relay: &FakeRelay, group: IpAddr, record_type: GroupRecordType) -> bool {
    relay.reports().iter().any(|report| {
        report
            .records
            .iter()
            .any(|r| r.group == group && r.record_type == record_type)
    })
}

#[test]
fn test_join_receive_leave() {
    let relay = FakeRelay::start();
    let gateway = gateway_for(&relay);
    let group: IpAddr = "232.1.1.1".parse().unwrap();
    let sink = Collector::new();

    let subscription = gateway
        .subscribe(relay.ip(), sink.clone(), group, None, 5000)
        .unwrap();

    // Handshake completes and the relay's query is answered with our state
    assert!(relay.wait_for(WAIT, |r| reports_group(
        r,
        group,
        GroupRecordType::ModeIsExclude
    )));
    assert_eq!(
        subscription.interface().engine().phase(),
        HandshakePhase::Established
    );

    // Updates carry the MAC from the relay's query
    assert!(relay.received().iter().any(|m| matches!(
        m,
        AmtMessage::MembershipUpdate { mac, .. } if *mac == RELAY_MAC
    )));

    relay.send_data(multicast("232.1.1.1", 5000, b"hello".to_vec()));
    relay.send_data(multicast("232.1.1.1", 5001, b"other port".to_vec()));
    relay.send_data(multicast("232.9.9.9", 5000, b"other group".to_vec()));
    assert!(relay.wait_for(WAIT, |_| !sink.payloads().is_empty()));

    let big: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    let mut fragments = multicast("232.1.1.1", 5000, big.clone()).fragment(9, 1000);
    fragments.reverse();
    for fragment in fragments {
        relay.send_data(fragment);
    }
    assert!(relay.wait_for(WAIT, |_| sink.payloads().len() == 2));
    assert_eq!(
        sink.payloads(),
        vec![Bytes::from_static(b"hello"), Bytes::from(big)]
    );

    let interface = subscription.interface().value().clone();
    drop(subscription);
    assert!(relay.wait_for(WAIT, |r| reports_group(
        r,
        group,
        GroupRecordType::ChangeToIncludeMode
    )));
    assert!(interface.engine().is_closed());
    assert!(gateway.interfaces().is_empty());
}

#[test]
fn test_source_specific_join() {
    let relay = FakeRelay::start();
    let gateway = gateway_for(&relay);
    let group: IpAddr = "232.2.2.2".parse().unwrap();
    let source: IpAddr = "10.1.1.1".parse().unwrap();
    let sink = Collector::new();

    let _subscription = gateway
        .subscribe(relay.ip(), sink.clone(), group, Some(source), 6000)
        .unwrap();

    assert!(relay.wait_for(WAIT, |r| r.reports().iter().any(|report| {
        report.records.iter().any(|rec| {
            rec.group == group
                && rec.record_type == GroupRecordType::ModeIsInclude
                && rec.sources == vec![source]
        })
    })));

    relay.send_data(multicast("232.2.2.2", 6000, b"ssm".to_vec()));
    assert!(relay.wait_for(WAIT, |_| sink.payloads().len() == 1));
}

#[test]
fn test_unanswered_requests_retransmit_until_relay_answers() {
    let relay = FakeRelay::start();
    relay.ignore_requests(true);
    let gateway = gateway_for(&relay);
    let sink = Collector::new();

    let subscription = gateway
        .subscribe(relay.ip(), sink, "232.3.3.3".parse().unwrap(), None, 5000)
        .unwrap();

    // Requests go unanswered, so no report ever reaches the relay
    assert!(relay.wait_for(WAIT, |r| {
        r.received()
            .iter()
            .filter(|m| matches!(m, AmtMessage::Request { .. }))
            .count()
            >= 2
    }));
    assert!(relay.reports().is_empty());
    assert_ne!(
        subscription.interface().engine().phase(),
        HandshakePhase::Established
    );

    relay.ignore_requests(false);
    assert!(relay.wait_for(WAIT, |r| !r.reports().is_empty()));
    assert!(subscription.interface().stats().send_refusals >= 1);
}
