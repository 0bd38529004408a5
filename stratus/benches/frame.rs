//! Frame codec benchmarks.
//!
//! Measures encode/decode throughput of the length-prefixed JSON codec,
//! including the multi-frame and chunked-input paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ntex_bytes::BytesMut;
use ntex_codec::Decoder;
use serde_json::json;
use stratus::JsonCodec;

fn bench_encode(c: &mut Criterion) {
    let codec = JsonCodec::new();
    let value = json!({"pattern": "sum", "data": {"a": 1, "b": 2}, "id": "0123456789abcdef"});

    c.bench_function("frame_encode", |b| {
        b.iter(|| {
            let frame = codec.encode_value(black_box(&value)).unwrap();
            black_box(frame);
        });
    });
}

fn bench_decode(c: &mut Criterion) {
    let value = json!({"id": "0123456789abcdef", "response": {"ok": true}});
    let frame = JsonCodec::new().encode_value(&value).unwrap();

    c.bench_function("frame_decode", |b| {
        let codec = JsonCodec::new();
        b.iter(|| {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&frame);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            black_box(decoded);
        });
    });
}

fn bench_decode_batched(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_batched");

    for count in [10, 100] {
        let mut wire = Vec::new();
        let codec = JsonCodec::new();
        for i in 0..count {
            let frame = codec.encode_value(&json!({"seq": i})).unwrap();
            wire.extend_from_slice(&frame);
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let codec = JsonCodec::new();
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&wire);
                for _ in 0..count {
                    let decoded = codec.decode(&mut buf).unwrap().unwrap();
                    black_box(decoded);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_batched);
criterion_main!(benches);
