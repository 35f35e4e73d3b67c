//! Process-wide default allocator, size-tagged wrapper, and the
//! `GlobalAlloc` adapter.
//!
//! The default instance is a [`PoolAllocator`] over power-of-two buckets
//! from 16 bytes up to 1/64th of physical memory, created on first use.
//! Creating it allocates (bucket tables, worker lists), so a three-state
//! gate routes the building thread's own allocations to the system
//! allocator while everyone else briefly spins; that bootstrap metadata
//! lives for the whole process and is never handed back.
//!
//! Two calling conventions sit on top:
//! - raw: [`allocate`]`(n)` / [`deallocate`]`(p, n)`: the caller tracks
//!   sizes, nothing is added to the block;
//! - tagged: [`alloc_tagged`]`(n)` / [`free_tagged`]`(p)`: the length goes
//!   into a header of 8, 16, or 64 bytes directly before the returned
//!   address, chosen so the block keeps a useful alignment.
//!
//! [`PoolAlloc`] adapts the raw path to `core::alloc::GlobalAlloc` for
//! container use.

use crate::config::{LARGE_ALIGN, SEQ_THRESHOLD};
use crate::platform;
use crate::pool_allocator::PoolAllocator;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::alloc::System;

const UNINIT: u8 = 0;
const BUILDING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);
static POOL: AtomicPtr<PoolAllocator> = AtomicPtr::new(ptr::null_mut());

std::thread_local! {
    static BOOTSTRAP: Cell<bool> = const { Cell::new(false) };
}

/// True while the calling thread is building the default pool. Uses
/// `try_with` so a query during thread teardown degrades to `false`.
#[inline]
fn bootstrapping() -> bool {
    BOOTSTRAP.try_with(|b| b.get()).unwrap_or(false)
}

/// Smallest `k` with `2^k >= n`.
fn log2_up(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Bucket sizes of the default instance: powers of two from 2^4 up to
/// 2^ceil(log2(mem/64)).
fn default_sizes() -> Vec<usize> {
    let log_min = 4;
    let log_max = log2_up(platform::memory_size() / 64).max(log_min + 1);
    (log_min..=log_max).map(|i| 1usize << i).collect()
}

/// The process-wide pool allocator, created on first use.
pub fn default_allocator() -> &'static PoolAllocator {
    if STATE.load(Ordering::Acquire) == READY {
        return unsafe { &*POOL.load(Ordering::Relaxed) };
    }
    init_slow()
}

#[cold]
fn init_slow() -> &'static PoolAllocator {
    loop {
        match STATE.compare_exchange(UNINIT, BUILDING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                BOOTSTRAP.set(true);
                let pool: &'static PoolAllocator =
                    Box::leak(Box::new(PoolAllocator::new(&default_sizes())));
                BOOTSTRAP.set(false);
                POOL.store(
                    ptr::from_ref::<PoolAllocator>(pool) as *mut PoolAllocator,
                    Ordering::Release,
                );
                STATE.store(READY, Ordering::Release);
                return pool;
            }
            Err(READY) => return unsafe { &*POOL.load(Ordering::Acquire) },
            // Another thread is building; wait it out.
            Err(_) => core::hint::spin_loop(),
        }
    }
}

/// Allocate `n` bytes from the default pool. The caller must pass the same
/// `n` to [`deallocate`].
pub fn allocate(n: usize) -> *mut u8 {
    default_allocator().allocate(n)
}

/// Release memory obtained from [`allocate`].
///
/// # Safety
/// `ptr` must come from `allocate(n)` with the same `n`, exactly once.
pub unsafe fn deallocate(ptr: *mut u8, n: usize) {
    unsafe { default_allocator().deallocate(ptr, n) }
}

/// Release the default pool's cached large slabs back to the system.
pub fn clear() {
    default_allocator().clear();
}

/// Print the default pool's per-bucket occupancy to stderr.
pub fn print_stats() {
    default_allocator().print_stats();
}

/// Pre-warm the default pool's large cache for a `bytes`-sized request.
pub fn reserve(bytes: usize) {
    default_allocator().reserve(bytes);
}

/// Header width for a tagged allocation of `n` bytes.
///
/// Chosen so the header never degrades a block's useful alignment: requests
/// that aren't 16-byte multiples get the minimal 8, cache-line-sized and
/// kilobyte-plus requests pay a full 64.
#[inline]
pub fn header_size(n: usize) -> usize {
    if n >= 1024 {
        64
    } else if n % 16 != 0 {
        8
    } else if n % 64 != 0 {
        16
    } else {
        64
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "system-alloc")] {
        /// Allocate `n` bytes with a size header (system-allocator build).
        pub fn alloc_tagged(n: usize) -> *mut u8 {
            let h = header_size(n);
            let Ok(layout) = Layout::from_size_align(n + h, LARGE_ALIGN) else {
                return ptr::null_mut();
            };
            let base = unsafe { System.alloc(layout) };
            if base.is_null() {
                return base;
            }
            unsafe {
                let p = base.add(h);
                (p as *mut usize).sub(1).write(n);
                p
            }
        }

        /// Free a tagged allocation (system-allocator build).
        ///
        /// # Safety
        /// `ptr` must come from [`alloc_tagged`], exactly once.
        pub unsafe fn free_tagged(ptr: *mut u8) {
            let n = unsafe { (ptr as *const usize).sub(1).read() };
            let h = header_size(n);
            let Ok(layout) = Layout::from_size_align(n + h, LARGE_ALIGN) else {
                return;
            };
            unsafe { System.dealloc(ptr.sub(h), layout) };
        }
    } else {
        /// Allocate `n` bytes, storing `n` in the machine word directly
        /// before the returned address so [`free_tagged`] needs no size.
        pub fn alloc_tagged(n: usize) -> *mut u8 {
            let h = header_size(n);
            let base = default_allocator().allocate(n + h);
            if base.is_null() {
                return base;
            }
            unsafe {
                let p = base.add(h);
                (p as *mut usize).sub(1).write(n);
                p
            }
        }

        /// Free a tagged allocation, reading the length from its header.
        ///
        /// # Safety
        /// `ptr` must come from [`alloc_tagged`], exactly once.
        pub unsafe fn free_tagged(ptr: *mut u8) {
            let n = unsafe { (ptr as *const usize).sub(1).read() };
            let h = header_size(n);
            unsafe { default_allocator().deallocate(ptr.sub(h), n + h) };
        }
    }
}

/// Allocate an uninitialized array of `len` `T` slots via the tagged path.
/// Exhaustion is fatal here: array callers have no recovery story.
///
/// Element alignments above 16 are only supported when the byte length is a
/// 64-byte multiple (the header protocol cannot place the data more finely).
pub fn new_array_uninit<T>(len: usize) -> *mut T {
    let Some(bytes) = len.checked_mul(size_of::<T>()) else {
        eprintln!("parpool: array of {len} elements overflows");
        std::process::abort();
    };
    let align = align_of::<T>();
    assert!(
        align <= 16 || bytes % 64 == 0,
        "unsupported element alignment {align} for {bytes}-byte array"
    );
    let p = alloc_tagged(bytes) as *mut T;
    if p.is_null() {
        eprintln!("parpool: cannot allocate {bytes} bytes");
        std::process::abort();
    }
    p
}

/// Allocate an array of `len` default-constructed `T`s, constructing in
/// parallel above the sequential threshold.
pub fn new_array<T: Default + Send>(len: usize) -> *mut T {
    let p = new_array_uninit::<T>(len);
    let addr = p as usize;
    let init = move |i: usize| unsafe {
        ((addr as *mut T).add(i)).write(T::default());
    };
    if len > SEQ_THRESHOLD {
        crate::fork_join::parfor(0, len, init);
    } else {
        for i in 0..len {
            init(i);
        }
    }
    p
}

/// Drop `len` elements (in parallel above the sequential threshold, when
/// dropping does anything) and free the array.
///
/// # Safety
/// `ptr` must come from [`new_array`]/[`new_array_uninit`] with the same
/// `len`, all elements initialized, and must not be used afterwards.
pub unsafe fn delete_array<T: Send>(ptr: *mut T, len: usize) {
    if std::mem::needs_drop::<T>() {
        let addr = ptr as usize;
        let drop_one = move |i: usize| unsafe {
            ptr::drop_in_place((addr as *mut T).add(i));
        };
        if len > SEQ_THRESHOLD {
            crate::fork_join::parfor(0, len, drop_one);
        } else {
            for i in 0..len {
                drop_one(i);
            }
        }
    }
    unsafe { free_tagged(ptr as *mut u8) };
}

/// `GlobalAlloc` over the default pool, for container-style use:
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: parpool::PoolAlloc = parpool::PoolAlloc;
/// ```
///
/// Alignments beyond the pool's 64-byte guarantee pass through to the
/// system allocator.
pub struct PoolAlloc;

unsafe impl GlobalAlloc for PoolAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        if layout.align() > LARGE_ALIGN || bootstrapping() {
            return unsafe { System.alloc(layout) };
        }
        // Padding the request to the alignment puts it in a bucket whose
        // natural alignment covers it.
        default_allocator().allocate(size.max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = layout.size();
        if size == 0 {
            return;
        }
        if layout.align() > LARGE_ALIGN || bootstrapping() {
            return unsafe { System.dealloc(ptr, layout) };
        }
        unsafe { default_allocator().deallocate(ptr, size.max(layout.align())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_header_size_table() {
        assert_eq!(header_size(1), 8);
        assert_eq!(header_size(8), 8);
        assert_eq!(header_size(15), 8);
        assert_eq!(header_size(16), 16);
        assert_eq!(header_size(32), 16);
        assert_eq!(header_size(64), 64);
        assert_eq!(header_size(100), 8);
        assert_eq!(header_size(128), 64);
        assert_eq!(header_size(960), 64);
        assert_eq!(header_size(1000), 8);
        assert_eq!(header_size(1024), 64);
        assert_eq!(header_size(1_000_000), 64);
    }

    #[test]
    fn test_default_allocator_is_singleton() {
        let a = default_allocator() as *const PoolAllocator;
        let b = default_allocator() as *const PoolAllocator;
        assert_eq!(a, b);
    }

    #[test]
    fn test_tagged_round_trip() {
        for n in [1usize, 8, 16, 100, 1024, 5000, 70_000] {
            let p = alloc_tagged(n);
            assert!(!p.is_null());
            // The header word carries the logical size.
            let stored = unsafe { (p as *const usize).sub(1).read() };
            assert_eq!(stored, n);
            unsafe {
                p.write_bytes(0x5A, n);
                free_tagged(p);
            }
        }
    }

    #[test]
    fn test_new_array_default_initialized() {
        let n = 500;
        let p = new_array::<u64>(n);
        for i in 0..n {
            assert_eq!(unsafe { p.add(i).read() }, 0);
        }
        unsafe { delete_array(p, n) };
    }

    #[test]
    fn test_new_array_parallel_path() {
        // Above the sequential threshold, construction goes through the
        // scheduler.
        let n = 10_000;
        let p = new_array::<u32>(n);
        for i in 0..n {
            assert_eq!(unsafe { p.add(i).read() }, 0);
        }
        unsafe { delete_array(p, n) };
    }

    #[test]
    fn test_delete_array_drops_every_element() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Default for Counted {
            fn default() -> Self {
                Counted
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let n = 3000;
        let p = new_array::<Counted>(n);
        unsafe { delete_array(p, n) };
        assert_eq!(DROPS.load(Ordering::Relaxed), n);
    }

    #[test]
    fn test_global_alloc_adapter() {
        let a = PoolAlloc;
        for (size, align) in [(1usize, 1usize), (24, 8), (100, 64), (4096, 16)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let p = unsafe { a.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "size {size} align {align}");
            unsafe {
                p.write_bytes(0xC3, size);
                a.dealloc(p, layout);
            }
        }
    }

    #[test]
    fn test_global_alloc_zero_size() {
        let a = PoolAlloc;
        let layout = Layout::from_size_align(0, 8).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert_eq!(p as usize, 8);
        unsafe { a.dealloc(p, layout) };
    }

    #[test]
    fn test_global_alloc_over_aligned_passes_through() {
        let a = PoolAlloc;
        let layout = Layout::from_size_align(256, 256).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);
        unsafe { a.dealloc(p, layout) };
    }

    #[test]
    fn test_raw_path_round_trip() {
        let p = allocate(777);
        assert!(!p.is_null());
        unsafe {
            p.write_bytes(0x11, 777);
            deallocate(p, 777);
        }
    }
}
