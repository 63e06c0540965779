//! Benchmarks for ringlb dispatch components.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ringlb::hashing::HashRing;
use ringlb::health::{ProbeHistory, SAMPLE_SIZE};
use std::time::{Duration, Instant};

fn ten_node_ring() -> HashRing {
    let ring = HashRing::new();
    for i in 0..10 {
        ring.add(&format!("10.0.0.{}:9000", i), 1);
    }
    ring
}

fn benchmark_ring_get(c: &mut Criterion) {
    let ring = ten_node_ring();

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            black_box(ring.get(&format!("192.168.1.{}:{}", i % 251, 10000 + i % 50000)));
        })
    });
    group.finish();
}

fn benchmark_ring_membership_change(c: &mut Criterion) {
    let ring = ten_node_ring();

    c.bench_function("ring_add_remove", |b| {
        b.iter(|| {
            ring.add("10.0.0.99:9000", 1);
            ring.remove("10.0.0.99:9000");
        })
    });
}

fn benchmark_history_record(c: &mut Criterion) {
    // A full buffer exercises the worst-case O(S) statistics recompute.
    let mut history = ProbeHistory::new();
    let now = Instant::now();
    for i in 0..SAMPLE_SIZE {
        history.record_success(Duration::from_micros(900 + (i % 100) as u64), now);
    }

    c.bench_function("history_record_success", |b| {
        b.iter(|| {
            history.record_success(black_box(Duration::from_micros(950)), now);
        })
    });
}

criterion_group!(
    benches,
    benchmark_ring_get,
    benchmark_ring_membership_change,
    benchmark_history_record
);
criterion_main!(benches);
