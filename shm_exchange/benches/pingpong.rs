//! Benchmark for exchange round-trip latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shm_exchange::{ExchangeThread, Reply, SharedExchange};
use std::time::{Duration, Instant};
use uuid::Uuid;

const PAYLOAD_SIZE: usize = 32;

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_exchange");
    group.throughput(Throughput::Elements(1));

    group.bench_function("echo_32b", |b| {
        let instance = format!("bench_{}", Uuid::now_v7().simple());
        let server = SharedExchange::create(&instance, 1);
        let listener = ExchangeThread::new(server, |exchange, size| exchange.respond(size));
        let client = SharedExchange::open(&instance, 1);

        b.iter(|| {
            let ptr = client.obtain(PAYLOAD_SIZE).unwrap();
            unsafe { std::ptr::write_bytes(ptr, 0xAB, PAYLOAD_SIZE) };
            let reply = client
                .send_request(Instant::now() + Duration::from_secs(5))
                .unwrap();
            black_box(matches!(reply, Reply::Inline(_)));
        });

        drop(client);
        drop(listener);
    });

    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
