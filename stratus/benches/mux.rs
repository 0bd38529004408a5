//! Multiplexer benchmarks.
//!
//! Measures call registration, response dispatch, and concurrent
//! outstanding calls.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use serde_json::json;
use stratus::{Multiplexer, PacketId, ResponsePacket};
use tokio::runtime::Runtime;

fn bench_register_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("mux_register_dispatch", |b| {
        let mux = Arc::new(Multiplexer::new());

        b.to_async(&rt).iter(|| {
            let mux = Arc::clone(&mux);
            async move {
                let id = PacketId::random();
                let mut stream = mux.register(&id, None);

                mux.dispatch(ResponsePacket::terminal_value(
                    black_box(id),
                    json!("response"),
                ));

                let value = stream.next().await.unwrap().unwrap();
                black_box(value);
            }
        });
    });
}

fn bench_concurrent_pending(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("mux_concurrent_pending");

    for count in [10, 100, 1000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let mux = Arc::new(Multiplexer::new());

                let calls: Vec<_> = (0..count)
                    .map(|_| {
                        let id = PacketId::random();
                        let stream = mux.register(&id, None);
                        (id, stream)
                    })
                    .collect();

                for (id, _) in &calls {
                    mux.dispatch(ResponsePacket::terminal_value(id.clone(), json!("ok")));
                }

                for (_, mut stream) in calls {
                    let value = stream.next().await.unwrap().unwrap();
                    black_box(value);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_register_dispatch, bench_concurrent_pending);
criterion_main!(benches);
