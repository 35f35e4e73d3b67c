//! Pool allocator: a vector of size buckets over two storage strategies.
//!
//! Sizes below the large threshold get a [`BlockAllocator`] each (per-worker
//! free lists, no locks on the fast path). Sizes at or above it get a shared
//! lock-free stack that caches previously used slabs for reuse. Requests
//! beyond the largest bucket go straight to the system allocator, with
//! pages faulted in parallel so they spread across the NUMA nodes of the
//! workers that will touch them.
//!
//! Callers supply the size on both sides (`allocate(n)` / `deallocate(p, n)`);
//! the size-tagged wrapper in `allocator` stores it in a header for callers
//! that cannot.

use crate::block_allocator::BlockAllocator;
use crate::concurrent_stack::ConcurrentStack;
use crate::config::LARGE_THRESHOLD;
use crate::platform;
use crate::stat;
use core::sync::atomic::{AtomicI64, Ordering};

/// First-touch stride: one transparent huge page.
const TOUCH_STRIDE: usize = 1 << 21;

pub struct PoolAllocator {
    sizes: Box<[usize]>,
    num_small: usize,
    max_small: usize,
    max_size: usize,
    small: Box<[BlockAllocator]>,
    large: Box<[ConcurrentStack]>,
    /// Bytes currently obtained from the system for the large buckets and
    /// the oversize path, including cached slabs.
    large_allocated: AtomicI64,
}

impl PoolAllocator {
    /// Build a pool over the given bucket sizes.
    ///
    /// Sizes must be at least 8 and strictly increasing; anything else is a
    /// configuration error and panics.
    pub fn new(sizes: &[usize]) -> Self {
        assert!(!sizes.is_empty(), "bucket size vector must not be empty");
        let mut prev = 0;
        for &s in sizes {
            assert!(s >= 8, "bucket sizes must be at least 8, got {s}");
            assert!(
                s > prev,
                "bucket sizes must strictly increase ({s} after {prev})"
            );
            prev = s;
        }
        let num_small = sizes.iter().take_while(|&&s| s < LARGE_THRESHOLD).count();
        let max_small = if num_small > 0 { sizes[num_small - 1] } else { 0 };
        let max_size = sizes[sizes.len() - 1];
        Self {
            sizes: sizes.into(),
            num_small,
            max_small,
            max_size,
            small: sizes[..num_small]
                .iter()
                .map(|&s| BlockAllocator::new(s))
                .collect(),
            large: (num_small..sizes.len())
                .map(|_| ConcurrentStack::new())
                .collect(),
            large_allocated: AtomicI64::new(0),
        }
    }

    /// Largest size served by any bucket; beyond this the pool passes
    /// through to the system.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Largest size served by the per-worker small buckets.
    #[inline]
    pub fn max_small(&self) -> usize {
        self.max_small
    }

    /// Bytes currently held from the system on the large path (live and
    /// cached slabs both count; `clear` releases the cached ones).
    #[inline]
    pub fn large_allocated(&self) -> i64 {
        self.large_allocated.load(Ordering::Relaxed)
    }

    /// The bucket size a request for `n` bytes is served with, or `None`
    /// beyond the largest bucket.
    pub fn bucket_size(&self, n: usize) -> Option<usize> {
        if n > self.max_size {
            return None;
        }
        if self.num_small > 0 && n <= self.max_small {
            return Some(self.sizes[self.small_bucket(n)]);
        }
        Some(self.sizes[self.large_bucket(n)])
    }

    /// Allocate `n` bytes.
    ///
    /// Small requests return blocks aligned to the bucket's natural
    /// alignment (at least 8) and may return null under memory exhaustion;
    /// large requests are 64-byte aligned and abort on exhaustion.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        if self.num_small == 0 || n > self.max_small {
            return self.allocate_large(n);
        }
        self.small[self.small_bucket(n)].alloc()
    }

    /// Release `n` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(n)` on this pool with the same `n`,
    /// and must not be released twice.
    pub unsafe fn deallocate(&self, ptr: *mut u8, n: usize) {
        if n > self.max_size {
            unsafe { platform::page_dealloc(ptr, n) };
            self.large_allocated.fetch_sub(n as i64, Ordering::Relaxed);
        } else if self.num_small == 0 || n > self.max_small {
            let b = self.large_bucket(n);
            // Cache for reuse; `clear` gives it back to the system.
            unsafe { self.large[b - self.num_small].push(ptr) };
        } else {
            unsafe { self.small[self.small_bucket(n)].free(ptr) };
        }
    }

    /// Release every cached large slab back to the system. Idempotent.
    /// Must not run concurrently with other operations on this pool.
    pub fn clear(&self) {
        for b in self.num_small..self.sizes.len() {
            while let Some(p) = self.large[b - self.num_small].pop() {
                self.large_allocated
                    .fetch_sub(self.sizes[b] as i64, Ordering::Relaxed);
                unsafe { platform::page_dealloc(p, self.sizes[b]) };
            }
        }
    }

    /// Pre-warm the large cache with one slab big enough for `bytes`.
    /// No-op beyond the largest bucket or when there are no large buckets.
    pub fn reserve(&self, bytes: usize) {
        if self.num_small == self.sizes.len() {
            return;
        }
        let n = bytes.max(self.max_small + 1);
        if n > self.max_size {
            return;
        }
        let b = self.large_bucket(n);
        let size = self.sizes[b];
        let slab = unsafe { platform::page_alloc(size) };
        if slab.is_null() {
            eprintln!("parpool: reserve failed for size {size}");
            return;
        }
        self.large_allocated
            .fetch_add(size as i64, Ordering::Relaxed);
        unsafe { self.large[b - self.num_small].push(slab) };
    }

    /// Print per-bucket occupancy to stderr.
    pub fn print_stats(&self) {
        let mut total_allocated: usize = 0;
        let mut total_used: usize = 0;
        for (i, alloc) in self.small.iter().enumerate() {
            let size = self.sizes[i];
            let allocated = alloc.num_allocated_blocks();
            let used = alloc.num_used_blocks();
            total_allocated += allocated * size;
            total_used += used * size;
            eprintln!("size = {size}, allocated = {allocated}, used = {used}");
        }
        let large = self.large_allocated();
        eprintln!("large allocated = {large}");
        eprintln!(
            "total bytes allocated = {}",
            total_allocated as i64 + large
        );
        eprintln!("total bytes used = {total_used}");
    }

    /// Smallest small bucket with `sizes[b] >= n`. The bucket count is tiny,
    /// so a linear scan beats anything clever.
    #[inline]
    fn small_bucket(&self, n: usize) -> usize {
        let mut b = 0;
        while n > self.sizes[b] {
            b += 1;
        }
        b
    }

    /// Smallest large bucket with `sizes[b] >= n`.
    #[inline]
    fn large_bucket(&self, n: usize) -> usize {
        let mut b = self.num_small;
        while n > self.sizes[b] {
            b += 1;
        }
        b
    }

    fn allocate_large(&self, n: usize) -> *mut u8 {
        if n <= self.max_size {
            let b = self.large_bucket(n);
            if let Some(p) = self.large[b - self.num_small].pop() {
                stat!(large_cache_hits);
                return p;
            }
            stat!(large_cache_misses);
            // Allocate the full bucket size so the slab can serve any
            // request of this bucket when it comes back through the cache.
            let size = self.sizes[b];
            let slab = unsafe { platform::page_alloc(size) };
            if slab.is_null() {
                eprintln!("parpool: system allocation failed for size {size}");
                std::process::abort();
            }
            self.large_allocated
                .fetch_add(size as i64, Ordering::Relaxed);
            first_touch(slab, size);
            return slab;
        }
        // Beyond the largest bucket: straight to the system.
        stat!(large_cache_misses);
        let ptr = unsafe { platform::page_alloc(n) };
        if ptr.is_null() {
            eprintln!("parpool: system allocation failed for size {n}");
            std::process::abort();
        }
        self.large_allocated.fetch_add(n as i64, Ordering::Relaxed);
        first_touch(ptr, n);
        ptr
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Fault the pages of a fresh region in parallel, one byte per huge-page
/// stride, so each page is first touched by the worker likely to use it.
/// Sequential when no scheduler is running yet: an allocation must not
/// spawn the worker pool as a side effect.
fn first_touch(ptr: *mut u8, n: usize) {
    let addr = ptr as usize;
    let touch = move |i: usize| unsafe {
        ((addr + i * TOUCH_STRIDE) as *mut u8).write_volatile(0);
    };
    match crate::scheduler::Scheduler::try_global() {
        Some(sched) => sched.parfor(0, n / TOUCH_STRIDE, touch, 0, false),
        None => {
            for i in 0..n / TOUCH_STRIDE {
                touch(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sizes() -> Vec<usize> {
        // Powers of two through both regimes: 16 .. 2 MiB.
        (4..=21).map(|i| 1usize << i).collect()
    }

    #[test]
    fn test_bucket_selection_boundaries() {
        let pool = PoolAllocator::new(&test_sizes());
        assert_eq!(pool.bucket_size(1), Some(16));
        assert_eq!(pool.bucket_size(16), Some(16));
        assert_eq!(pool.bucket_size(17), Some(32));
        assert_eq!(pool.bucket_size(4096), Some(4096));
        assert_eq!(pool.bucket_size(4097), Some(8192));
        assert_eq!(pool.bucket_size(1 << 16), Some(1 << 16));
        assert_eq!(pool.bucket_size((1 << 16) + 1), Some(1 << 17));
        assert_eq!(pool.bucket_size(1 << 21), Some(1 << 21));
        assert_eq!(pool.bucket_size((1 << 21) + 1), None);
    }

    #[test]
    fn test_small_alloc_round_trip() {
        let pool = PoolAllocator::new(&test_sizes());
        for n in [1usize, 8, 16, 100, 1000, 60000] {
            let p = pool.allocate(n);
            assert!(!p.is_null(), "allocate({n}) failed");
            assert_eq!(p as usize % 8, 0);
            unsafe {
                p.write_bytes(0xA5, n);
                pool.deallocate(p, n);
            }
        }
    }

    #[test]
    fn test_large_slabs_are_cached_and_cleared() {
        let pool = PoolAllocator::new(&test_sizes());
        let n = 100_000; // bucket 2^17
        let p = pool.allocate(n);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert_eq!(pool.large_allocated(), 1 << 17);
        unsafe { pool.deallocate(p, n) };
        // Still cached.
        assert_eq!(pool.large_allocated(), 1 << 17);
        // Same bucket reuses the cached slab.
        let q = pool.allocate((1 << 16) + 500);
        assert_eq!(q, p);
        unsafe { pool.deallocate(q, (1 << 16) + 500) };
        pool.clear();
        assert_eq!(pool.large_allocated(), 0);
        // Idempotent.
        pool.clear();
        assert_eq!(pool.large_allocated(), 0);
    }

    #[test]
    fn test_oversize_goes_to_system_and_back() {
        let pool = PoolAllocator::new(&test_sizes());
        let n = (1 << 22) + 123;
        let p = pool.allocate(n);
        assert!(!p.is_null());
        assert_eq!(pool.large_allocated(), n as i64);
        unsafe {
            *p = 1;
            *p.add(n - 1) = 2;
            pool.deallocate(p, n);
        }
        assert_eq!(pool.large_allocated(), 0);
    }

    #[test]
    fn test_reserve_pre_warms_cache() {
        let pool = PoolAllocator::new(&test_sizes());
        pool.reserve(200_000); // bucket 2^18
        assert_eq!(pool.large_allocated(), 1 << 18);
        let p = pool.allocate(150_000);
        assert!(!p.is_null());
        // Served from the reserved slab, not a fresh one.
        assert_eq!(pool.large_allocated(), 1 << 18);
        unsafe { pool.deallocate(p, 150_000) };
        pool.clear();
        assert_eq!(pool.large_allocated(), 0);
    }

    #[test]
    #[should_panic(expected = "at least 8")]
    fn test_rejects_tiny_bucket() {
        PoolAllocator::new(&[4, 16, 32]);
    }

    #[test]
    #[should_panic(expected = "strictly increase")]
    fn test_rejects_unsorted_buckets() {
        PoolAllocator::new(&[16, 16, 32]);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_rejects_empty_buckets() {
        PoolAllocator::new(&[]);
    }
}
