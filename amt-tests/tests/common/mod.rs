//! In-process AMT relay over loopback UDP

#![allow(dead_code)]

use amt_protocol::ip::AddressFamily;
use amt_protocol::membership::{MembershipQuery, MembershipReport};
use amt_protocol::message::{AmtMessage, ResponseMac};
use amt_protocol::IpPacket;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const RELAY_MAC: ResponseMac = ResponseMac([1, 2, 3, 4, 5, 6]);

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<(SocketAddr, AmtMessage)>>,
    gateway: Mutex<Option<SocketAddr>>,
    stop: AtomicBool,
    ignore_requests: AtomicBool,
}

/// Answers Discovery with its own address and Requests with a general query
pub struct FakeRelay {
    socket: UdpSocket,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl FakeRelay {
    pub fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let shared = Arc::new(Shared::default());

        let thread = {
            let socket = socket.try_clone().unwrap();
            let shared = shared.clone();
            thread::spawn(move || serve(socket, shared))
        };

        FakeRelay {
            socket,
            shared,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr().ip()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Stop answering Requests, as a relay that lost state would
    pub fn ignore_requests(&self, ignore: bool) {
        self.shared.ignore_requests.store(ignore, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<AmtMessage> {
        self.shared
            .received
            .lock()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Decoded membership reports in arrival order
    pub fn reports(&self) -> Vec<MembershipReport> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                AmtMessage::MembershipUpdate { report, .. } => {
                    MembershipReport::from_packet(&report).ok()
                }
                _ => None,
            })
            .collect()
    }

    /// Poll until `check` holds or `timeout` passes
    pub fn wait_for<F>(&self, timeout: Duration, mut check: F) -> bool
    where
        F: FnMut(&FakeRelay) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check(self)
    }

    /// Encapsulate `packet` as Multicast Data toward the gateway
    pub fn send_data(&self, packet: IpPacket) {
        let gateway = self.shared.gateway.lock().expect("no gateway seen yet");
        let bytes = AmtMessage::MulticastData { packet }.encode();
        self.socket.send_to(&bytes, gateway).unwrap();
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(socket: UdpSocket, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 65536];
    let relay_ip = match socket.local_addr() {
        Ok(addr) => addr.ip(),
        Err(_) => return,
    };

    while !shared.stop.load(Ordering::SeqCst) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(_) => return,
        };
        let message = match AmtMessage::decode(&buf[..n]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        *shared.gateway.lock() = Some(from);
        shared.received.lock().push((from, message.clone()));

        let reply = match message {
            AmtMessage::RelayDiscovery { nonce } => Some(AmtMessage::RelayAdvertisement {
                nonce,
                relay: relay_ip,
            }),
            AmtMessage::Request { nonce, family } => {
                if shared.ignore_requests.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(general_query(nonce, family))
                }
            }
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = socket.send_to(&reply.encode(), from);
        }
    }
}

fn general_query(nonce: u32, family: AddressFamily) -> AmtMessage {
    let (source, destination): (IpAddr, IpAddr) = match family {
        AddressFamily::Ipv4 => (
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1)),
        ),
        AddressFamily::Ipv6 => (
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)),
        ),
    };
    let query = MembershipQuery::general(family, Duration::from_millis(100))
        .to_packet(source, destination)
        .unwrap();
    AmtMessage::MembershipQuery {
        limited: false,
        mac: RELAY_MAC,
        nonce,
        query,
        gateway: None,
    }
}
