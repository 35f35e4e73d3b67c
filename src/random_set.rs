//! Concurrent flag set with random sampling.
//!
//! One flag per worker, marking workers that are currently parked. The
//! semaphore handshake carries the parking protocol's correctness; this set
//! only lets diagnostics and fairness heuristics pick a random parked
//! worker cheaply.

use crate::scheduler::advance_seed;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

pub struct ConcurrentRandomSet {
    flags: Box<[CachePadded<AtomicBool>]>,
}

impl ConcurrentRandomSet {
    pub fn new(len: usize, init: bool) -> Self {
        Self {
            flags: (0..len)
                .map(|_| CachePadded::new(AtomicBool::new(init)))
                .collect(),
        }
    }

    #[inline]
    pub fn add(&self, i: usize) {
        self.flags[i].store(true, Ordering::Release);
    }

    #[inline]
    pub fn remove(&self, i: usize) {
        self.flags[i].store(false, Ordering::Release);
    }

    #[inline]
    pub fn contains(&self, i: usize) -> bool {
        self.flags[i].load(Ordering::Acquire)
    }

    /// Number of set flags (racy, diagnostics only).
    pub fn count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| f.load(Ordering::Relaxed))
            .count()
    }

    /// Pick a random member, advancing `seed` per probe.
    ///
    /// Spins until it hits a set flag: the caller must ensure at least one
    /// element is present for the duration of the call, otherwise this never
    /// returns.
    pub fn sample(&self, seed: &AtomicU64) -> usize {
        debug_assert!(
            self.flags.iter().any(|f| f.load(Ordering::Relaxed)),
            "sample called on an empty set"
        );
        loop {
            let r = (advance_seed(seed) % self.flags.len() as u64) as usize;
            if self.flags[r].load(Ordering::Acquire) {
                return r;
            }
        }
    }
}
