//! Scheduler overhead: fork/join on recursive fib and parallel-for sweeps.
//! Criterion drives from the main thread, which is worker 0 of the global
//! scheduler, so these measure the real stealing paths.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};

fn fib_seq(i: u64) -> u64 {
    if i <= 1 { 1 } else { fib_seq(i - 1) + fib_seq(i - 2) }
}

fn fib_par(i: u64) -> u64 {
    if i < 18 {
        return fib_seq(i);
    }
    let mut l = 0;
    let mut r = 0;
    parpool::pardo(|| l = fib_par(i - 1), || r = fib_par(i - 2));
    l + r
}

fn bench_fib(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib");
    group.sample_size(10);
    group.bench_function("par_30", |b| b.iter(|| fib_par(black_box(30))));
    group.bench_function("seq_30", |b| b.iter(|| fib_seq(black_box(30))));
    group.finish();
}

fn bench_parfor(c: &mut Criterion) {
    let mut group = c.benchmark_group("parfor_sum");
    for n in [10_000usize, 1_000_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("par", n), &n, |b, &n| {
            b.iter(|| {
                let sum = AtomicU64::new(0);
                parpool::parfor(0, n, |i| {
                    sum.fetch_add(i as u64, Ordering::Relaxed);
                });
                sum.load(Ordering::Relaxed)
            });
        });
        group.bench_with_input(BenchmarkId::new("seq", n), &n, |b, &n| {
            b.iter(|| (0..n as u64).map(black_box).sum::<u64>());
        });
    }
    group.finish();
}

fn bench_pardo_overhead(c: &mut Criterion) {
    c.bench_function("pardo_empty", |b| {
        b.iter(|| parpool::pardo(|| black_box(()), || black_box(())));
    });
}

criterion_group!(benches, bench_fib, bench_parfor, bench_pardo_overhead);
criterion_main!(benches);
