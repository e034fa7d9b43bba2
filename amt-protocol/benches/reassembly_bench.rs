use amt_protocol::ip::{IpPacket, UdpDatagram};
use amt_protocol::message::AmtMessage;
use amt_protocol::reassembly::{Reassembler, ReassemblyConfig};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::net::IpAddr;
use std::time::Instant;

fn datagram(src: &str, dst: &str, len: usize) -> IpPacket {
    UdpDatagram {
        source: src.parse::<IpAddr>().unwrap(),
        source_port: 5000,
        destination: dst.parse::<IpAddr>().unwrap(),
        destination_port: 5004,
        payload: Bytes::from(vec![0xa5u8; len]),
    }
    .to_packet(64)
    .unwrap()
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");

    for (name, src, dst) in [
        ("ipv4", "10.0.0.1", "232.1.1.1"),
        ("ipv6", "2001:db8::1", "ff3e::8000:1"),
    ] {
        let packet = datagram(src, dst, 8 * 1024);
        let fragments = packet.fragment(42, 1400);
        group.throughput(Throughput::Bytes(packet.len() as u64));

        group.bench_with_input(BenchmarkId::new("in_order", name), &fragments, |b, frags| {
            b.iter(|| {
                let mut reassembler = Reassembler::new(ReassemblyConfig::default());
                let now = Instant::now();
                let mut done = Vec::new();
                for fragment in frags {
                    done.extend(reassembler.process(fragment.clone(), now).unwrap());
                }
                black_box(done);
            });
        });

        let mut reversed = fragments.clone();
        reversed.reverse();
        group.bench_with_input(BenchmarkId::new("reversed", name), &reversed, |b, frags| {
            b.iter(|| {
                let mut reassembler = Reassembler::new(ReassemblyConfig::default());
                let now = Instant::now();
                let mut done = Vec::new();
                for fragment in frags {
                    done.extend(reassembler.process(fragment.clone(), now).unwrap());
                }
                black_box(done);
            });
        });
    }

    group.finish();
}

fn bench_data_message_decode(c: &mut Criterion) {
    let packet = datagram("10.0.0.1", "232.1.1.1", 1316);
    let bytes = AmtMessage::MulticastData { packet }.encode().freeze();

    c.bench_function("multicast_data_decode", |b| {
        b.iter(|| {
            let message = AmtMessage::decode(black_box(&bytes)).unwrap();
            black_box(message);
        });
    });
}

criterion_group!(benches, bench_reassemble, bench_data_message_decode);
criterion_main!(benches);
