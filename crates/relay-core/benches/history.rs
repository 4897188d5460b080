//! History log benchmarks for relay-core.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_core::{ChannelHistory, HistoryRetention};
use relay_proto::{NodeId, Publication};
use std::time::Duration;
use tokio::time::Instant;

fn bench_append(c: &mut Criterion) {
    let retention = HistoryRetention {
        max_entries: 1000,
        lifetime: Duration::from_secs(60),
    };
    let origin = NodeId::new("bench");
    let now = Instant::now();

    let mut group = c.benchmark_group("history_append");
    group.throughput(Throughput::Elements(1));
    group.bench_function("append_64B", |b| {
        let mut history = ChannelHistory::new();
        b.iter(|| {
            let p = Publication::new("bench", vec![0u8; 64], origin.clone());
            black_box(history.append(p, &retention, now))
        })
    });
    group.finish();
}

fn bench_recover(c: &mut Criterion) {
    let retention = HistoryRetention {
        max_entries: 1000,
        lifetime: Duration::from_secs(60),
    };
    let origin = NodeId::new("bench");
    let now = Instant::now();

    let mut history = ChannelHistory::new();
    for _ in 0..1000 {
        let p = Publication::new("bench", vec![0u8; 64], origin.clone());
        history.append(p, &retention, now);
    }

    c.bench_function("recover_tail_100", |b| {
        b.iter(|| black_box(history.recover(900, &retention, now)))
    });
}

criterion_group!(benches, bench_append, bench_recover);
criterion_main!(benches);
