//! Fork/join and parallel-for surface.
//!
//! `pardo` forks two closures and joins both; `parfor` maps a closure over
//! an index range by recursive splitting. Both come in a plain form that
//! uses the process-wide scheduler and a `_with` form exposing the
//! conservative-wait flag (and, for `parfor`, an explicit granularity).
//!
//! The right-hand side of a fork goes onto the local deque where any worker
//! can steal it; the left-hand side runs inline. If nobody stole the right
//! job by the time the left returns, it is popped back and run inline too.
//! That is the common case, and it makes an unstolen fork nearly free.

use crate::config::PROBE_TICKS;
use crate::job::StackJob;
use crate::scheduler::Scheduler;
use std::time::Instant;

/// Run `left` and `right`, potentially in parallel, returning when both
/// have completed. All writes they made are visible to the caller.
pub fn pardo<L, R>(left: L, right: R)
where
    L: FnOnce(),
    R: FnOnce() + Send,
{
    Scheduler::global().pardo(left, right, false);
}

/// [`pardo`] with an explicit conservative flag. Conservative waiting only
/// yields instead of scheduling other jobs, which is required when user
/// locks are held across the join.
pub fn pardo_with<L, R>(left: L, right: R, conservative: bool)
where
    L: FnOnce(),
    R: FnOnce() + Send,
{
    Scheduler::global().pardo(left, right, conservative);
}

/// Run `body(i)` for every `i` in `lo..hi`, potentially in parallel.
/// A no-op when `hi <= lo`. Granularity is chosen automatically by probing.
pub fn parfor<F>(lo: usize, hi: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    Scheduler::global().parfor(lo, hi, body, 0, false);
}

/// [`parfor`] with explicit granularity (0 means probe) and conservative
/// flag.
pub fn parfor_with<F>(lo: usize, hi: usize, body: F, granularity: usize, conservative: bool)
where
    F: Fn(usize) + Sync,
{
    Scheduler::global().parfor(lo, hi, body, granularity, conservative);
}

/// Number of workers in the process-wide scheduler.
pub fn num_workers() -> usize {
    Scheduler::global().num_workers()
}

impl Scheduler {
    /// Two-way fork/join on this scheduler.
    pub fn pardo<L, R>(&self, left: L, right: R, conservative: bool)
    where
        L: FnOnce(),
        R: FnOnce() + Send,
    {
        // Threads outside this scheduler's pool have no deque to spawn
        // onto; they run the fork sequentially.
        let Some(id) = self.worker_here() else {
            left();
            right();
            return;
        };

        let right_job = StackJob::new(right);
        // SAFETY: this frame joins the job (inline pop, or waiting on its
        // done flag) before returning, so the reference cannot dangle.
        unsafe { self.spawn_job(id, right_job.as_job_ref()) };
        left();
        match self.try_pop(id) {
            // Nobody stole it; run the right side inline. Under the strict
            // push/pop nesting of fork/join this is exactly the job pushed
            // above.
            Some(job) => unsafe { job.execute() },
            // A thief has it; keep scheduling (or just yield) until the
            // thief reports completion.
            None => self.wait(id, &|| right_job.is_done(), conservative),
        }
    }

    /// Data-parallel for over `lo..hi` on this scheduler.
    ///
    /// `granularity` is the number of iterations worth running sequentially;
    /// 0 means measure: run doubling chunks until they cost about
    /// `PROBE_TICKS` nanoseconds, then split the rest of the range with a
    /// floor of `len / (128 * workers)`.
    pub fn parfor<F>(&self, lo: usize, hi: usize, body: F, granularity: usize, conservative: bool)
    where
        F: Fn(usize) + Sync,
    {
        if hi <= lo {
            return;
        }
        if granularity == 0 {
            let done = self.probe_granularity(lo, hi, &body);
            let gran = done.max((hi - lo) / (128 * self.num_workers())).max(1);
            if lo + done < hi {
                self.parfor_split(lo + done, hi, &body, gran, conservative);
            }
        } else {
            self.parfor_split(lo, hi, &body, granularity, conservative);
        }
    }

    /// Run doubling-size chunks sequentially from the front of the range
    /// until they take long enough to hide scheduling overhead. Returns how
    /// many iterations were consumed.
    fn probe_granularity<F: Fn(usize)>(&self, lo: usize, hi: usize, body: &F) -> usize {
        let mut done = 0;
        let mut size = 1;
        loop {
            let chunk = size.min(hi - lo - done);
            let start = Instant::now();
            for i in 0..chunk {
                body(lo + done + i);
            }
            let ticks = start.elapsed().as_nanos() as u64;
            done += chunk;
            size *= 2;
            if ticks >= PROBE_TICKS || done >= hi - lo {
                return done;
            }
        }
    }

    fn parfor_split<F>(&self, lo: usize, hi: usize, body: &F, granularity: usize, conservative: bool)
    where
        F: Fn(usize) + Sync,
    {
        if hi - lo <= granularity {
            for i in lo..hi {
                body(i);
            }
        } else {
            let len = hi - lo;
            // Split off-center so power-of-two ranges don't alias on
            // set-associative caches.
            let mid = lo + (9 * (len + 1)) / 16;
            self.pardo(
                || self.parfor_split(lo, mid, body, granularity, conservative),
                || self.parfor_split(mid, hi, body, granularity, conservative),
                conservative,
            );
        }
    }
}
