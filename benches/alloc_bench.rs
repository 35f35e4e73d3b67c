//! Allocator throughput: the pool's raw and tagged paths against the system
//! allocator, through the same `GlobalAlloc` interface.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use parpool::PoolAlloc;
use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;

static POOL: PoolAlloc = PoolAlloc;

/// Allocate + deallocate a single object of `layout`.
unsafe fn alloc_dealloc(allocator: &dyn GlobalAlloc, layout: Layout) {
    let ptr = unsafe { allocator.alloc(layout) };
    assert!(!ptr.is_null());
    unsafe { allocator.dealloc(black_box(ptr), layout) };
}

/// Allocate N objects, then free them all (LIFO order).
unsafe fn alloc_n_then_free(allocator: &dyn GlobalAlloc, layout: Layout, n: usize) {
    let mut ptrs = Vec::with_capacity(n);
    for _ in 0..n {
        let ptr = unsafe { allocator.alloc(layout) };
        assert!(!ptr.is_null());
        ptrs.push(ptr);
    }
    for ptr in ptrs.into_iter().rev() {
        unsafe { allocator.dealloc(ptr, layout) };
    }
}

fn bench_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_dealloc");
    for size in [8usize, 64, 512, 4096, 65536] {
        let layout = Layout::from_size_align(size, 8).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("pool", size), &layout, |b, &layout| {
            b.iter(|| unsafe { alloc_dealloc(&POOL, layout) });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &layout, |b, &layout| {
            b.iter(|| unsafe { alloc_dealloc(&System, layout) });
        });
    }
    group.finish();
}

fn bench_batched(c: &mut Criterion) {
    const BATCH: usize = 1000;
    let mut group = c.benchmark_group("alloc_1000_then_free");
    for size in [64usize, 1024] {
        let layout = Layout::from_size_align(size, 8).unwrap();
        group.throughput(Throughput::Elements(BATCH as u64));
        group.bench_with_input(BenchmarkId::new("pool", size), &layout, |b, &layout| {
            b.iter(|| unsafe { alloc_n_then_free(&POOL, layout, BATCH) });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &layout, |b, &layout| {
            b.iter(|| unsafe { alloc_n_then_free(&System, layout, BATCH) });
        });
    }
    group.finish();
}

fn bench_tagged(c: &mut Criterion) {
    let mut group = c.benchmark_group("tagged");
    for size in [24usize, 100, 1024, 65536] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = parpool::alloc_tagged(black_box(size));
                assert!(!p.is_null());
                unsafe { parpool::free_tagged(p) };
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single, bench_batched, bench_tagged);
criterion_main!(benches);
