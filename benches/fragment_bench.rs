//! Fragmentation and tunnel framing benchmarks.
//!
//! Covers the per-connection work done before the first byte leaves the
//! gateway: locating the SNI, planning chunks, re-framing records, and the
//! frame codec used on every relayed packet.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bepass::fragment::{plan_chunks, split_boundary, tls, FragmentConfig};
use bepass::tunnel::{Frame, StreamKind, TargetAddr};

/// A Client Hello of realistic size with the SNI after a padding extension.
fn client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    let mut extensions = vec![0x00, 0x15, 0x00, 0xc8];
    extensions.extend_from_slice(&[0u8; 200]);
    extensions.extend_from_slice(&[0x00, 0x00]);
    extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    extensions.push(0x00);
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

fn bench_split_boundary(c: &mut Criterion) {
    let hello = client_hello("www.example.com");

    let mut group = c.benchmark_group("split_boundary");
    group.throughput(Throughput::Bytes(hello.len() as u64));

    group.bench_function("client_hello", |b| {
        b.iter(|| black_box(split_boundary(black_box(&hello))))
    });
    group.bench_function("not_tls", |b| {
        let data = vec![0x47u8; hello.len()];
        b.iter(|| black_box(split_boundary(black_box(&data))))
    });

    group.finish();
}

fn bench_plan_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_chunks");

    for (bsl, asl) in [(1, 1), (10, 20), (64, 128)] {
        let config = FragmentConfig::new(bsl, asl, Duration::ZERO);
        group.bench_function(format!("bsl_{}_asl_{}", bsl, asl), |b| {
            b.iter(|| black_box(plan_chunks(517, 120, &config)))
        });
    }

    group.finish();
}

fn bench_record_split(c: &mut Criterion) {
    let hello = client_hello("www.example.com");
    let offset = split_boundary(&hello);

    c.bench_function("split_handshake_record_64", |b| {
        b.iter(|| black_box(tls::split_handshake_record(&hello, 64, Some(offset))))
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let payload = vec![0u8; 16 * 1024];
    let data = Frame::stream_data(7, &payload);
    let encoded = data.encode();

    let mut group = c.benchmark_group("frame_codec");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encode_16k", |b| b.iter(|| black_box(data.encode())));
    group.bench_function("decode_16k", |b| {
        b.iter(|| black_box(Frame::decode(&encoded).unwrap()))
    });
    group.bench_function("open_domain", |b| {
        let target = TargetAddr::Domain("www.example.com".into(), 443);
        b.iter(|| black_box(Frame::stream_open(1, StreamKind::Tcp, &target).unwrap().encode()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_split_boundary,
    bench_plan_chunks,
    bench_record_split,
    bench_frame_codec
);
criterion_main!(benches);
