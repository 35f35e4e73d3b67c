//! parpool: a work-stealing fork/join scheduler coupled with a thread-aware
//! pool allocator.
//!
//! The scheduler runs a fixed set of worker threads over per-worker
//! lock-free deques with random stealing; idle workers attach a "lifeline"
//! to a busier peer and sleep until that peer next picks up work. The
//! allocator builds per-worker free lists for small sizes and shared
//! cached-slab buckets for large sizes on top of the worker identity the
//! scheduler exposes.
//!
//! # Usage
//!
//! ```ignore
//! let mut sums = vec![0u64; 1_000_000];
//! parpool::parfor(0, sums.len(), |i| {
//!     // per-index work
//! });
//!
//! let mut left = 0u64;
//! let mut right = 0u64;
//! parpool::pardo(|| left = expensive_a(), || right = expensive_b());
//! ```
//!
//! Raw allocation with caller-tracked sizes goes through
//! [`allocate`]/[`deallocate`]; [`alloc_tagged`]/[`free_tagged`] prepend a
//! size header so the caller does not have to remember the length.

pub mod allocator;
pub mod block_allocator;
pub mod config;
pub mod fork_join;
mod concurrent_stack;
mod deque;
mod job;
mod macros;
pub mod platform;
pub mod pool_allocator;
pub mod random_set;
pub mod scheduler;
#[cfg(feature = "stats")]
pub mod stats;
pub mod status_word;
pub mod sync;

pub use allocator::{
    PoolAlloc, alloc_tagged, allocate, clear, deallocate, default_allocator, delete_array,
    free_tagged, header_size, new_array, new_array_uninit, print_stats, reserve,
};
pub use fork_join::{num_workers, pardo, pardo_with, parfor, parfor_with};
pub use pool_allocator::PoolAllocator;
pub use scheduler::{Scheduler, StealPolicy, worker_id};
