//! Fixed-size block allocator with per-worker free lists.
//!
//! One instance manages blocks of a single size. The fast paths (alloc and
//! free on a worker thread) touch only the calling worker's list and need no
//! synchronization: a block is always freed to the *current* worker's list,
//! whoever allocated it, so every list stays single-writer and residency is
//! rebalanced through the shared pool.
//!
//! When a worker list runs dry it refills a batch from the shared pool:
//! first from blocks other workers flushed back, then by carving the current
//! slab, then from a fresh slab. Lists that grow past a bound flush a batch
//! back. Threads outside the worker pool take the shared pool directly.

use crate::config::REFILL_COUNT;
use crate::platform;
use crate::scheduler;
use crate::stat;
use crate::sync::SpinMutex;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;

/// Free lists longer than this flush a batch back to the shared pool.
const LOCAL_LIST_MAX: usize = 4 * REFILL_COUNT;

/// Target bytes of blocks per slab (rounded up to whole blocks).
const SLAB_TARGET_BYTES: usize = 1 << 18;

/// Intrusive free-list node; occupies the first word of a free block.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Intrusive list of every slab this allocator obtained, for teardown.
#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
}

/// A worker-private free list. `head` is only ever touched by the owning
/// worker; `length` is owner-written but racily readable for diagnostics.
struct LocalList {
    head: UnsafeCell<*mut FreeBlock>,
    length: AtomicUsize,
}

// SAFETY: `head` is only accessed by the owning worker thread, and the
// blocks it links are slab memory with no thread affinity.
unsafe impl Send for LocalList {}
unsafe impl Sync for LocalList {}

impl LocalList {
    fn new() -> Self {
        Self {
            head: UnsafeCell::new(ptr::null_mut()),
            length: AtomicUsize::new(0),
        }
    }
}

struct GlobalPool {
    /// Shared free list (flushed batches, non-worker frees).
    free: *mut FreeBlock,
    free_len: usize,
    /// Carving position in the most recent slab.
    cursor: *mut u8,
    cursor_remaining: usize,
    /// All slabs ever obtained, newest first.
    slabs: *mut SlabHeader,
}

// SAFETY: only accessed through the enclosing SpinMutex; the pointers target
// OS-allocated memory that is not thread-bound.
unsafe impl Send for GlobalPool {}

pub struct BlockAllocator {
    block_size: usize,
    blocks_per_slab: usize,
    slab_bytes: usize,
    local: Box<[CachePadded<LocalList>]>,
    global: SpinMutex<GlobalPool>,
    /// Total blocks carved out of slabs so far.
    blocks_allocated: AtomicUsize,
}

impl BlockAllocator {
    /// A block allocator for blocks of `block_size` bytes (rounded up to a
    /// multiple of 8 so the intrusive link always fits and stays aligned).
    pub fn new(block_size: usize) -> Self {
        assert!(block_size >= 8, "block size must be at least 8");
        let block_size = (block_size + 7) & !7;
        let blocks_per_slab = (SLAB_TARGET_BYTES / block_size).max(REFILL_COUNT);
        // One extra block-sized prefix holds the slab header and keeps every
        // block aligned to the block size's natural alignment.
        let slab_bytes = (blocks_per_slab + 1) * block_size;
        Self {
            block_size,
            blocks_per_slab,
            slab_bytes,
            local: (0..crate::config::MAX_WORKERS)
                .map(|_| CachePadded::new(LocalList::new()))
                .collect(),
            global: SpinMutex::new(GlobalPool {
                free: ptr::null_mut(),
                free_len: 0,
                cursor: ptr::null_mut(),
                cursor_remaining: 0,
                slabs: ptr::null_mut(),
            }),
            blocks_allocated: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hand out one block, aligned to the block size's natural alignment
    /// (at least 8). Returns null if the system refuses more memory; the
    /// failure is also reported on stderr.
    #[inline]
    pub fn alloc(&self) -> *mut u8 {
        if let Some(id) = scheduler::try_worker_id() {
            debug_assert!(id < self.local.len());
            let list = &self.local[id];
            let head = unsafe { *list.head.get() };
            if !head.is_null() {
                unsafe { *list.head.get() = (*head).next };
                list.length.fetch_sub(1, Ordering::Relaxed);
                stat!(small_alloc_count);
                return head as *mut u8;
            }
            return self.refill(list);
        }
        self.alloc_shared()
    }

    /// Return a block to the calling worker's free list. Any thread may free
    /// any block of this allocator; ownership is not tracked per block.
    ///
    /// # Safety
    /// `ptr` must have come from `alloc` on this allocator and must not be
    /// freed twice.
    #[inline]
    pub unsafe fn free(&self, ptr: *mut u8) {
        stat!(small_free_count);
        let block = ptr as *mut FreeBlock;
        if let Some(id) = scheduler::try_worker_id() {
            debug_assert!(id < self.local.len());
            let list = &self.local[id];
            unsafe {
                (*block).next = *list.head.get();
                *list.head.get() = block;
            }
            let len = list.length.fetch_add(1, Ordering::Relaxed) + 1;
            if len > LOCAL_LIST_MAX {
                self.flush_excess(list);
            }
            return;
        }
        let mut pool = self.global.lock();
        unsafe { (*block).next = pool.free };
        pool.free = block;
        pool.free_len += 1;
    }

    /// Total blocks carved from slabs so far.
    pub fn num_allocated_blocks(&self) -> usize {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Blocks currently in caller hands (racy, diagnostics only).
    pub fn num_used_blocks(&self) -> usize {
        let shared_free = {
            let pool = self.global.lock();
            pool.free_len + pool.cursor_remaining
        };
        let local_free: usize = self
            .local
            .iter()
            .map(|l| l.length.load(Ordering::Relaxed))
            .sum();
        self.num_allocated_blocks()
            .saturating_sub(shared_free + local_free)
    }

    /// Refill the caller's list with one batch and hand out the first block.
    #[cold]
    fn refill(&self, list: &LocalList) -> *mut u8 {
        stat!(refill_count);
        let mut pool = self.global.lock();
        let Some(result) = self.take_block(&mut pool) else {
            return ptr::null_mut();
        };
        let mut taken = 0;
        while taken + 1 < REFILL_COUNT {
            let Some(block) = self.take_block(&mut pool) else {
                break;
            };
            unsafe {
                let b = block as *mut FreeBlock;
                (*b).next = *list.head.get();
                *list.head.get() = b;
            }
            taken += 1;
        }
        drop(pool);
        list.length.fetch_add(taken, Ordering::Relaxed);
        stat!(small_alloc_count);
        result
    }

    /// Serve a thread that has no worker identity straight from the pool.
    #[cold]
    fn alloc_shared(&self) -> *mut u8 {
        let mut pool = self.global.lock();
        match self.take_block(&mut pool) {
            Some(p) => {
                stat!(small_alloc_count);
                p
            }
            None => ptr::null_mut(),
        }
    }

    /// One block out of the pool: shared free list, then the slab cursor,
    /// then a fresh slab. Caller holds the pool lock.
    fn take_block(&self, pool: &mut GlobalPool) -> Option<*mut u8> {
        if !pool.free.is_null() {
            let b = pool.free;
            pool.free = unsafe { (*b).next };
            pool.free_len -= 1;
            return Some(b as *mut u8);
        }
        if pool.cursor_remaining == 0 && !self.grow(pool) {
            return None;
        }
        let p = pool.cursor;
        pool.cursor = unsafe { p.add(self.block_size) };
        pool.cursor_remaining -= 1;
        Some(p)
    }

    fn grow(&self, pool: &mut GlobalPool) -> bool {
        let slab = unsafe { platform::page_alloc(self.slab_bytes) };
        if slab.is_null() {
            eprintln!(
                "parpool: slab allocation failed for block size {}",
                self.block_size
            );
            return false;
        }
        let header = slab as *mut SlabHeader;
        unsafe { (*header).next = pool.slabs };
        pool.slabs = header;
        // Blocks start one block in; the prefix holds the header.
        pool.cursor = unsafe { slab.add(self.block_size) };
        pool.cursor_remaining = self.blocks_per_slab;
        self.blocks_allocated
            .fetch_add(self.blocks_per_slab, Ordering::Relaxed);
        true
    }

    /// Move one refill batch from an over-full worker list back to the pool.
    #[cold]
    fn flush_excess(&self, list: &LocalList) {
        let mut head = unsafe { *list.head.get() };
        let mut batch: *mut FreeBlock = ptr::null_mut();
        let mut tail: *mut FreeBlock = ptr::null_mut();
        let mut moved = 0;
        while moved < REFILL_COUNT && !head.is_null() {
            let next = unsafe { (*head).next };
            unsafe { (*head).next = batch };
            if tail.is_null() {
                tail = head;
            }
            batch = head;
            head = next;
            moved += 1;
        }
        unsafe { *list.head.get() = head };
        list.length.fetch_sub(moved, Ordering::Relaxed);
        if batch.is_null() {
            return;
        }
        let mut pool = self.global.lock();
        unsafe { (*tail).next = pool.free };
        pool.free = batch;
        pool.free_len += moved;
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        // Slabs go back to the OS wholesale; any block still in caller
        // hands becomes invalid with them.
        let mut slab = self.global.lock().slabs;
        while !slab.is_null() {
            let next = unsafe { (*slab).next };
            unsafe { platform::page_dealloc(slab as *mut u8, self.slab_bytes) };
            slab = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, StealPolicy};

    #[test]
    fn test_rounds_block_size_up() {
        let a = BlockAllocator::new(9);
        assert_eq!(a.block_size(), 16);
        let b = BlockAllocator::new(8);
        assert_eq!(b.block_size(), 8);
    }

    #[test]
    fn test_shared_path_alloc_free() {
        // Test threads have no worker identity, so this exercises the
        // shared fallback.
        let a = BlockAllocator::new(64);
        let p = a.alloc();
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe { a.free(p) };
        assert_eq!(a.num_used_blocks(), 0);
    }

    #[test]
    fn test_worker_path_reuses_lifo() {
        let sched = Scheduler::spawn(1, StealPolicy::Backoff);
        let a = BlockAllocator::new(32);
        let p1 = a.alloc();
        assert!(!p1.is_null());
        unsafe { a.free(p1) };
        let p2 = a.alloc();
        assert_eq!(p1, p2, "free list should be LIFO");
        unsafe { a.free(p2) };
        sched.destroy();
    }

    #[test]
    fn test_many_blocks_distinct() {
        let sched = Scheduler::spawn(1, StealPolicy::Backoff);
        let a = BlockAllocator::new(48);
        let mut ptrs: Vec<*mut u8> = (0..1000).map(|_| a.alloc()).collect();
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 1000);
        for &p in &ptrs {
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0); // 48 = 16 * 3
            unsafe { a.free(p) };
        }
        assert_eq!(a.num_used_blocks(), 0);
        sched.destroy();
    }

    #[test]
    fn test_used_blocks_accounting() {
        let a = BlockAllocator::new(128);
        assert_eq!(a.num_allocated_blocks(), 0);
        let p = a.alloc();
        assert!(a.num_allocated_blocks() > 0);
        assert_eq!(a.num_used_blocks(), 1);
        unsafe { a.free(p) };
        assert_eq!(a.num_used_blocks(), 0);
    }

    #[test]
    fn test_cross_thread_free() {
        let a = std::sync::Arc::new(BlockAllocator::new(256));
        let ptrs: Vec<usize> = (0..100).map(|_| a.alloc() as usize).collect();
        let a2 = std::sync::Arc::clone(&a);
        std::thread::spawn(move || {
            for p in ptrs {
                unsafe { a2.free(p as *mut u8) };
            }
        })
        .join()
        .unwrap();
        assert_eq!(a.num_used_blocks(), 0);
    }
}
