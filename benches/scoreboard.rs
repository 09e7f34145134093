use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;

use keyspan::scoring::{Counters, ScoreBoard};

fn seal_counters(n: usize) -> (HashMap<String, Counters>, Counters) {
    let mut counters = HashMap::with_capacity(n);
    let mut total = Counters::default();
    for i in 0..n {
        let c = Counters {
            normal_ops: (i as u64 * 7919) % 10_000 + 1,
            admin_ops: i as u64 % 3,
            elapsed_nanos: (i as u64 * 104_729) % 50_000_000,
            bytes_read: (i as u64 * 31) % (1 << 20),
            bytes_written: (i as u64 * 17) % (1 << 20),
        };
        total.merge(&c);
        counters.insert(format!("idx{}#{}", i % 16, i), c);
    }
    (counters, total)
}

fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("scoreboard_compute");
    for n in [16usize, 256, 4096] {
        let (counters, total) = seal_counters(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| ScoreBoard::compute(black_box(&counters), black_box(&total)))
        });
    }
    group.finish();
}

fn bench_ascending_scan(c: &mut Criterion) {
    let (counters, total) = seal_counters(4096);
    let board = ScoreBoard::compute(&counters, &total);
    c.bench_function("scoreboard_warm_band_scan", |b| {
        b.iter(|| {
            board
                .ascending()
                .filter(|s| s.fractional_rank > 0.3 && s.fractional_rank < 0.8)
                .count()
        })
    });
}

criterion_group!(benches, bench_compute, bench_ascending_scan);
criterion_main!(benches);
