// benches/bgp_codec_bench.rs

//! BGP wire codec benchmarks.
//!
//! Measures encode/decode throughput for the message shapes the failover
//! speaker actually emits: an OPEN with a multiprotocol capability, and
//! UPDATEs carrying a growing batch of IPv4 NLRI.

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};
use quorumlb::core::bgp::attribute::{Attribute, AsPathSegment, AsPathSegmentType, NextHopValue, Origin};
use quorumlb::core::bgp::codec::BgpCodec;
use quorumlb::core::bgp::message::{Message, OpenMessage, OptionalParameter, Prefix, UpdateMessage, BGP_VERSION};
use std::net::Ipv4Addr;
use tokio_util::codec::{Decoder, Encoder};

fn sample_open() -> Message {
    Message::Open(OpenMessage {
        version: BGP_VERSION,
        my_asn: 65000,
        hold_time: 180,
        bgp_identifier: Ipv4Addr::new(192, 0, 2, 1),
        optional_parameters: vec![OptionalParameter::multiprotocol(1, 1), OptionalParameter::multiprotocol(2, 1)],
    })
}

fn sample_update(prefix_count: usize) -> Message {
    let nlri: Vec<Prefix> = (0..prefix_count)
        .map(|i| Prefix::from_ipv4(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8), 32))
        .collect();
    Message::Update(UpdateMessage {
        withdrawn_routes: vec![],
        path_attributes: vec![
            Attribute::Origin(Origin::Igp),
            Attribute::AsPath(vec![AsPathSegment { segment_type: AsPathSegmentType::Sequence, asns: vec![65000] }]),
            Attribute::NextHop(NextHopValue::Explicit(Ipv4Addr::new(192, 0, 2, 1))),
        ],
        nlri,
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("bgp_encode");

    group.bench_function("open", |b| {
        let mut codec = BgpCodec;
        b.iter(|| {
            let mut buf = BytesMut::new();
            codec.encode(sample_open(), &mut buf).unwrap();
        });
    });

    for &count in &[1usize, 50, 500] {
        group.bench_function(format!("update_{count}_prefixes"), |b| {
            let mut codec = BgpCodec;
            b.iter(|| {
                let mut buf = BytesMut::new();
                codec.encode(sample_update(count), &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("bgp_decode");

    for &count in &[1usize, 50, 500] {
        let mut encoded = BytesMut::new();
        BgpCodec.encode(sample_update(count), &mut encoded).unwrap();

        group.bench_function(format!("update_{count}_prefixes"), |b| {
            b.iter(|| {
                let mut buf = encoded.clone();
                let mut codec = BgpCodec;
                let _ = codec.decode(&mut buf).unwrap().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
