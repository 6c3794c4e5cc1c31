// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire codec benchmarks.
//
// Run with:
//   cargo bench --bench wire_codec
//
// Groups:
//   encode — Frame -> bytes, at tiny/small/medium-fragment sizes
//   decode — bytes -> Frame, same sizes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use open_mx_core::wire::{self, Body, DataBody, DataHeader, Frame, MediumFragBody};

const SIZES: &[(&str, usize)] = &[("tiny_32", 32), ("small_128", 128), ("medium_frag_4096", 4096)];

fn header(length: u16) -> DataHeader {
    DataHeader {
        dst_ep: 0,
        src_ep: 0,
        src_gen: 0,
        length,
        lib_seqnum: 42,
        lib_piggyack: 41,
        match_a: 0x1234_5678,
        match_b: 0x9abc_def0,
        session: 7,
    }
}

fn tiny_frame(size: usize) -> Frame {
    Frame {
        dst_src_peer_index: 1,
        body: Body::Tiny(DataBody {
            header: header(size as u16),
            data: vec![0xAB; size],
        }),
    }
}

fn medium_frag_frame(size: usize) -> Frame {
    Frame {
        dst_src_peer_index: 1,
        body: Body::MediumFrag(MediumFragBody {
            header: header(size as u16),
            frag_length: size as u16,
            frag_seqnum: 3,
            frag_pipeline: 3,
            data: vec![0xCD; size],
        }),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for &(label, size) in SIZES {
        let frame = if label.starts_with("medium") {
            medium_frag_frame(size)
        } else {
            tiny_frame(size)
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &frame, |b, frame| {
            let mut buf = Vec::new();
            b.iter(|| {
                wire::encode(black_box(frame), &mut buf);
                black_box(buf.len())
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for &(label, size) in SIZES {
        let frame = if label.starts_with("medium") {
            medium_frag_frame(size)
        } else {
            tiny_frame(size)
        };
        let mut buf = Vec::new();
        wire::encode(&frame, &mut buf);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &buf, |b, buf| {
            b.iter(|| wire::decode(black_box(buf), u16::MAX).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
