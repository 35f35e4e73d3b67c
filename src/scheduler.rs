//! Worker pool and stealing core.
//!
//! A fixed set of worker threads shares an array of deques (two per worker,
//! so the pool can be oversubscribed later without resizing). Each worker
//! works off the bottom of its own deque and steals the top of a randomly
//! hashed victim when it runs dry.
//!
//! Two victim-search policies are available. [`StealPolicy::Backoff`] sweeps
//! deques in bounded rounds with a short sleep between rounds.
//! [`StealPolicy::Lifeline`] (the default) adds elastic parking: an idle
//! worker that fails a steal may attach itself as a child of the victim,
//! provided the victim is not busy and holds a strictly higher random
//! priority, and then sleep on its own semaphore. A worker that picks up a
//! job sets its busy bit and posts the semaphore of every child attached up
//! to that instant, so no wakeup is lost and two mutually-idle workers can
//! never park on each other.
//!
//! The thread that constructs a scheduler becomes worker 0; helpers get ids
//! `1..N` in a thread-local written once on thread start.

use crate::config::MAX_WORKERS;
use crate::deque::Deque;
use crate::job::JobRef;
use crate::random_set::ConcurrentRandomSet;
use crate::stat;
use crate::status_word::AtomicStatusWord;
use crate::sync::Semaphore;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::CachePadded;
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

pub(crate) const NO_WORKER: usize = usize::MAX;

/// Which scheduler the current thread works for, and as which id.
#[derive(Clone, Copy)]
struct WorkerSlot {
    sched: usize,
    id: usize,
}

thread_local! {
    static WORKER: Cell<WorkerSlot> = const {
        Cell::new(WorkerSlot {
            sched: 0,
            id: NO_WORKER,
        })
    };
}

/// Worker id of the calling thread, in `[0, num_workers)`.
///
/// The constructing thread is worker 0. Threads unknown to any scheduler
/// also report 0; allocator code that needs to tell them apart uses
/// [`try_worker_id`].
pub fn worker_id() -> usize {
    let w = WORKER.get();
    if w.id == NO_WORKER { 0 } else { w.id }
}

/// Worker id of the calling thread within the process-wide scheduler, or
/// `None` for any other thread.
///
/// The allocator's per-worker free lists key off this: ids of the
/// process-wide pool are unique per live thread, which keeps each list
/// single-writer. Workers of privately spawned schedulers take the shared
/// fallback instead.
pub(crate) fn try_worker_id() -> Option<usize> {
    let w = WORKER.get();
    if w.id == NO_WORKER {
        return None;
    }
    match GLOBAL.get() {
        Some(&g) => (core::ptr::from_ref::<Scheduler>(g) as usize == w.sched).then_some(w.id),
        None => None,
    }
}

/// splitmix64 finalizer; cheap stateless hashing for victim selection.
#[inline]
pub(crate) fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Advance a per-worker RNG state and return the new value.
///
/// The seed is owner-written; the atomic is only there so diagnostics can
/// read it from other threads.
#[inline]
pub(crate) fn advance_seed(seed: &AtomicU64) -> u64 {
    let next = mix64(seed.load(Ordering::Relaxed));
    seed.store(next, Ordering::Relaxed);
    next
}

/// Victim-search strategy used when a worker's own deque is empty.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StealPolicy {
    /// Bounded random-steal sweeps with a nanosleep between rounds.
    Backoff,
    /// Random stealing plus elastic parking on per-worker semaphores.
    #[default]
    Lifeline,
}

/// Per-worker scheduling state, padded to its own cache lines.
struct ProcData {
    /// RNG state for victim selection and priorities.
    seed: AtomicU64,
    /// busy bit, priority, head of the parked-children list.
    status: AtomicStatusWord,
    /// Parking spot. The single blocking primitive in the scheduler.
    sem: Semaphore,
    /// Next-pointers of the children list, indexed by worker id. A slot
    /// holding this worker's own id is the list terminator.
    children: Box<[AtomicUsize]>,
}

impl ProcData {
    fn new(id: usize, num_threads: usize) -> Self {
        let seed = mix64(id as u64).wrapping_add(1);
        Self {
            seed: AtomicU64::new(seed),
            status: AtomicStatusWord::new(seed, id),
            sem: Semaphore::new(),
            children: (0..num_threads).map(|_| AtomicUsize::new(id)).collect(),
        }
    }
}

pub struct Scheduler {
    deques: Box<[Deque]>,
    data: Box<[CachePadded<ProcData>]>,
    /// Flags of currently parked workers; diagnostics only.
    parked: ConcurrentRandomSet,
    policy: StealPolicy,
    num_threads: usize,
    num_deques: usize,
    finished_flag: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

static GLOBAL: OnceLock<&'static Scheduler> = OnceLock::new();

/// Aborts the process if the guarded scope unwinds. A job that panics would
/// otherwise tear a worker out of the pool and strand its joiners.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        eprintln!("parpool: job panicked on a worker thread, aborting");
        std::process::abort();
    }
}

impl Scheduler {
    /// The process-wide scheduler, created on first use with the thread
    /// count from `NUM_THREADS` (or hardware concurrency) and the lifeline
    /// policy. The first caller becomes worker 0.
    pub fn global() -> &'static Scheduler {
        *GLOBAL.get_or_init(|| Scheduler::spawn(Self::threads_from_env(), StealPolicy::default()))
    }

    /// The process-wide scheduler if it already exists; never creates it.
    /// For callers that must not spawn threads as a side effect (the
    /// allocator's first-touch loop).
    pub(crate) fn try_global() -> Option<&'static Scheduler> {
        GLOBAL.get().copied()
    }

    fn threads_from_env() -> usize {
        match std::env::var("NUM_THREADS") {
            Ok(s) => {
                let n: usize = s
                    .trim()
                    .parse()
                    .unwrap_or_else(|_| panic!("NUM_THREADS must be a positive integer, got {s:?}"));
                assert!(n >= 1, "NUM_THREADS must be at least 1");
                assert!(n <= MAX_WORKERS, "NUM_THREADS must be at most {MAX_WORKERS}");
                n
            }
            Err(_) => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_WORKERS),
        }
    }

    /// Start a scheduler with `num_threads` workers. The calling thread
    /// becomes worker 0; `num_threads - 1` helper threads are spawned.
    ///
    /// The scheduler is leaked to give the helpers a `'static` borrow; a
    /// process uses a bounded number of schedulers, normally exactly one.
    pub fn spawn(num_threads: usize, policy: StealPolicy) -> &'static Scheduler {
        assert!(
            num_threads >= 1 && num_threads <= MAX_WORKERS,
            "worker count {} out of range 1..={}",
            num_threads,
            MAX_WORKERS
        );
        let num_deques = 2 * num_threads;
        let sched = Scheduler {
            deques: (0..num_deques).map(|_| Deque::new()).collect(),
            data: (0..num_threads)
                .map(|i| CachePadded::new(ProcData::new(i, num_threads)))
                .collect(),
            parked: ConcurrentRandomSet::new(num_threads, false),
            policy,
            num_threads,
            num_deques,
            finished_flag: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        };
        let sched: &'static Scheduler = Box::leak(Box::new(sched));

        sched.set_worker_here(0);
        let mut handles = Vec::with_capacity(num_threads - 1);
        for i in 1..num_threads {
            let handle = thread::Builder::new()
                .name(format!("parpool-worker-{i}"))
                .spawn(move || {
                    sched.set_worker_here(i);
                    sched.start(i, &|| false, true);
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => panic!("failed to spawn worker thread {i}: {e}"),
            }
        }
        *sched.handles.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        sched
    }

    fn set_worker_here(&'static self, id: usize) {
        WORKER.set(WorkerSlot {
            sched: core::ptr::from_ref::<Scheduler>(self) as usize,
            id,
        });
    }

    /// Id of the calling thread within *this* scheduler, if it is one of
    /// its workers.
    pub(crate) fn worker_here(&self) -> Option<usize> {
        let w = WORKER.get();
        (w.id != NO_WORKER && w.sched == core::ptr::from_ref::<Scheduler>(self) as usize)
            .then_some(w.id)
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_threads
    }

    #[inline]
    pub fn steal_policy(&self) -> StealPolicy {
        self.policy
    }

    /// Number of workers currently parked on a lifeline (racy, diagnostics
    /// only; always 0 under the backoff policy).
    pub fn parked_workers(&self) -> usize {
        self.parked.count()
    }

    /// Shut down: drain every worker out of its scheduling loop and join
    /// the helper threads. All spawned work must already be complete.
    /// Idempotent.
    pub fn destroy(&self) {
        self.finished_flag.store(true, Ordering::SeqCst);
        // Parked workers only wake through their semaphore.
        for d in self.data.iter() {
            d.sem.post();
        }
        let handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            if h.join().is_err() {
                eprintln!("parpool: worker thread exited abnormally");
            }
        }
    }

    /// Push a job onto worker `id`'s deque.
    ///
    /// # Safety
    /// The caller must be worker `id` of this scheduler and must keep the
    /// job alive until it has executed.
    pub(crate) unsafe fn spawn_job(&self, id: usize, job: JobRef) {
        stat!(spawn_count);
        unsafe { self.deques[id].push_bottom(job) };
    }

    /// Pop worker `id`'s most recent spawn, if no thief got there first.
    /// Must be called by worker `id` itself.
    pub(crate) fn try_pop(&self, id: usize) -> Option<JobRef> {
        debug_assert_eq!(self.worker_here(), Some(id));
        // SAFETY: a worker only ever pops the bottom of its own deque.
        unsafe { self.deques[id].pop_bottom() }
    }

    /// Wait until `finished()` holds. The non-conservative path keeps
    /// scheduling other jobs meanwhile; the conservative path only yields,
    /// which is safe when user locks span the wait (a stolen job could need
    /// the same lock).
    pub(crate) fn wait<F: Fn() -> bool>(&self, id: usize, finished: &F, conservative: bool) {
        if conservative {
            while !finished() {
                thread::yield_now();
            }
        } else {
            self.start(id, finished, false);
        }
    }

    /// Scheduling loop: run jobs until `finished()` holds or the scheduler
    /// shuts down. `can_park` permits lifeline parking and is only set for
    /// the workers' top-level loops. A worker inside a `pardo` wait must
    /// keep polling its predicate, since nothing posts a semaphore when a
    /// stolen right-hand job completes.
    fn start<F: Fn() -> bool>(&self, id: usize, finished: &F, can_park: bool) {
        loop {
            let Some(job) = self.get_job(id, finished, can_park) else {
                return;
            };
            let guard = AbortOnPanic;
            unsafe { job.execute() };
            core::mem::forget(guard);
        }
    }

    #[inline]
    fn is_finished<F: Fn() -> bool>(&self, finished: &F) -> bool {
        finished() || self.finished_flag.load(Ordering::SeqCst)
    }

    /// Find a job: local deque first, then the policy's steal loop.
    fn get_job<F: Fn() -> bool>(&self, id: usize, finished: &F, can_park: bool) -> Option<JobRef> {
        if self.is_finished(finished) {
            return None;
        }
        if let Some(job) = self.try_pop(id) {
            return Some(job);
        }
        match self.policy {
            StealPolicy::Backoff => self.steal_loop_backoff(id, finished),
            StealPolicy::Lifeline => self.steal_loop_lifeline(id, finished, can_park),
        }
    }

    /// Hash out a pseudo-random victim deque.
    #[inline]
    fn steal_target(&self, id: usize) -> usize {
        let h = mix64(id as u64).wrapping_add(advance_seed(&self.data[id].seed));
        (h % self.num_deques as u64) as usize
    }

    fn steal_loop_backoff<F: Fn() -> bool>(&self, id: usize, finished: &F) -> Option<JobRef> {
        loop {
            // By the coupon collector's problem, this many attempts should
            // touch every deque.
            for _ in 0..=self.num_deques * 100 {
                if self.is_finished(finished) {
                    return None;
                }
                let target = self.steal_target(id);
                if target == id {
                    continue;
                }
                stat!(steal_attempts);
                if let Some(job) = self.deques[target].pop_top() {
                    stat!(steal_count);
                    return Some(job);
                }
            }
            // Nothing found anywhere; take a breather.
            thread::sleep(Duration::from_nanos((self.num_deques * 100) as u64));
        }
    }

    fn steal_loop_lifeline<F: Fn() -> bool>(
        &self,
        id: usize,
        finished: &F,
        can_park: bool,
    ) -> Option<JobRef> {
        let me = &self.data[id];
        // Entering the steal loop: drop the busy bit, re-randomize the
        // priority, and reset the child list to empty.
        me.status.clear(advance_seed(&me.seed), id);
        loop {
            if self.is_finished(finished) {
                // Leaving to resume an interrupted job (or to shut down)
                // counts as becoming busy: children must not sleep through
                // it.
                self.become_busy_and_wake(id);
                return None;
            }
            let target = self.steal_target(id);
            if target == id {
                continue;
            }
            stat!(steal_attempts);
            if let Some(job) = self.deques[target].pop_top() {
                stat!(steal_count);
                self.become_busy_and_wake(id);
                return Some(job);
            }
            // Failed steal: maybe this victim is worth a lifeline. The
            // upper half of the deque array has no owning worker to attach
            // to.
            if !can_park || target >= self.num_threads {
                continue;
            }
            let t = &self.data[target];
            let t_status = t.status.load();
            let my_status = me.status.load();
            if !t_status.busy() && t_status.priority() > my_status.priority() {
                // Publish our link first. If the exchange loses, the slot
                // is never read.
                t.children[id].store(t_status.head(), Ordering::Relaxed);
                if t.status.cas_head(t_status, id) {
                    stat!(park_count);
                    self.parked.add(id);
                    me.sem.wait();
                    self.parked.remove(id);
                }
                // On failure the victim changed under us; start over.
            }
        }
    }

    /// Raise the busy bit and wake every child attached before it went up.
    fn become_busy_and_wake(&self, id: usize) {
        let me = &self.data[id];
        let before = me.status.set_busy();
        let mut idx = before.head();
        while idx != id {
            debug_assert!(idx < self.num_threads);
            stat!(wake_count);
            self.data[idx].sem.post();
            idx = me.children[idx].load(Ordering::Relaxed);
        }
    }

    /// Walk a worker's current child list (racy, test introspection).
    #[cfg(test)]
    fn children_of(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut idx = self.data[id].status.load().head();
        while idx != id && out.len() <= self.num_threads {
            out.push(idx);
            idx = self.data[id].children[idx].load(Ordering::Relaxed);
        }
        out
    }
}
