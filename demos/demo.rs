use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn fib_seq(i: u64) -> u64 {
    if i <= 1 { 1 } else { fib_seq(i - 1) + fib_seq(i - 2) }
}

fn fib(i: u64) -> u64 {
    if i < 20 {
        return fib_seq(i);
    }
    let mut l = 0;
    let mut r = 0;
    parpool::pardo(|| l = fib(i - 1), || r = fib(i - 2));
    l + r
}

fn main() {
    println!("parpool demo");
    println!("============\n");

    println!("workers: {}", parpool::num_workers());

    // Data-parallel loop over a big array.
    const N: usize = 50_000_000;
    let mut a = vec![0u64; N];
    let start = Instant::now();
    {
        let base = a.as_mut_ptr() as usize;
        parpool::parfor(0, N, move |i| unsafe {
            *(base as *mut u64).add(i) = i as u64;
        });
    }
    let init_ms = start.elapsed().as_millis();
    let sum = AtomicU64::new(0);
    let start = Instant::now();
    parpool::parfor(0, N, |i| {
        sum.fetch_add(a[i], Ordering::Relaxed);
    });
    println!(
        "parfor:  init {N} elements in {init_ms} ms, sum {} in {} ms",
        sum.load(Ordering::Relaxed),
        start.elapsed().as_millis()
    );

    // Fork/join recursion.
    let start = Instant::now();
    let f = fib(38);
    println!("pardo:   fib(38) = {f} in {} ms", start.elapsed().as_millis());

    // Tagged allocation: the size rides in a header.
    let p = parpool::alloc_tagged(100_000);
    assert!(!p.is_null());
    unsafe {
        p.write_bytes(0xEE, 100_000);
        parpool::free_tagged(p);
    }
    println!("tagged:  100000-byte round trip ok");

    // Raw allocation churn across buckets.
    let start = Instant::now();
    for round in 0..1_000_000usize {
        let size = [16usize, 64, 256, 1024][round % 4];
        let q = parpool::allocate(size);
        assert!(!q.is_null());
        unsafe { parpool::deallocate(q, size) };
    }
    println!(
        "pool:    1M alloc/free cycles in {} ms\n",
        start.elapsed().as_millis()
    );

    parpool::print_stats();
    parpool::clear();

    #[cfg(feature = "stats")]
    {
        let snap = parpool::stats::snapshot();
        println!(
            "\nsteals: {} / {} attempts, parks: {}, wakes: {}",
            snap.steal_count, snap.steal_attempts, snap.park_count, snap.wake_count
        );
    }
}
