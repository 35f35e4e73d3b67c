//! Scheduler and allocator statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The deque fences and pool locks
//! provide the ordering guarantees for correctness; these counters are
//! purely for monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = parpool::stats::snapshot();
//! println!("steals: {}", snap.steal_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Scheduler ----
    /// Jobs pushed onto a worker deque.
    pub spawn_count: AtomicU64,
    /// Attempts to pop the top of another worker's deque.
    pub steal_attempts: AtomicU64,
    /// Steal attempts that returned a job.
    pub steal_count: AtomicU64,
    /// Times a worker attached a lifeline and went to sleep.
    pub park_count: AtomicU64,
    /// Semaphore posts issued while waking a child list.
    pub wake_count: AtomicU64,

    // ---- Small buckets ----
    /// Blocks handed out by the per-worker free lists.
    pub small_alloc_count: AtomicU64,
    /// Blocks returned to the per-worker free lists.
    pub small_free_count: AtomicU64,
    /// Refills of a worker free list from the shared pool.
    pub refill_count: AtomicU64,

    // ---- Large buckets / OS ----
    /// Large allocations served from a cached slab.
    pub large_cache_hits: AtomicU64,
    /// Large allocations that had to go to the system.
    pub large_cache_misses: AtomicU64,
    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            spawn_count: AtomicU64::new(0),
            steal_attempts: AtomicU64::new(0),
            steal_count: AtomicU64::new(0),
            park_count: AtomicU64::new(0),
            wake_count: AtomicU64::new(0),
            small_alloc_count: AtomicU64::new(0),
            small_free_count: AtomicU64::new(0),
            refill_count: AtomicU64::new(0),
            large_cache_hits: AtomicU64::new(0),
            large_cache_misses: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all statistics counters.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent activity may race between loads.
/// For monitoring purposes this is always sufficient.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Jobs pushed onto a worker deque.
    pub spawn_count: u64,
    /// Attempts to pop the top of another worker's deque.
    pub steal_attempts: u64,
    /// Steal attempts that returned a job.
    pub steal_count: u64,
    /// Times a worker attached a lifeline and went to sleep.
    pub park_count: u64,
    /// Semaphore posts issued while waking a child list.
    pub wake_count: u64,
    /// Blocks handed out by the per-worker free lists.
    pub small_alloc_count: u64,
    /// Blocks returned to the per-worker free lists.
    pub small_free_count: u64,
    /// Refills of a worker free list from the shared pool.
    pub refill_count: u64,
    /// Large allocations served from a cached slab.
    pub large_cache_hits: u64,
    /// Large allocations that had to go to the system.
    pub large_cache_misses: u64,
    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: u64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        spawn_count: s.spawn_count.load(Ordering::Relaxed),
        steal_attempts: s.steal_attempts.load(Ordering::Relaxed),
        steal_count: s.steal_count.load(Ordering::Relaxed),
        park_count: s.park_count.load(Ordering::Relaxed),
        wake_count: s.wake_count.load(Ordering::Relaxed),
        small_alloc_count: s.small_alloc_count.load(Ordering::Relaxed),
        small_free_count: s.small_free_count.load(Ordering::Relaxed),
        refill_count: s.refill_count.load(Ordering::Relaxed),
        large_cache_hits: s.large_cache_hits.load(Ordering::Relaxed),
        large_cache_misses: s.large_cache_misses.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
    }
}
