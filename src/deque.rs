//! Bounded lock-free work-stealing deque (Arora, Blumofe, Plaxton).
//!
//! One deque per worker. Only the owner pushes and pops the bottom; any
//! worker may pop the top. The `age` word packs (tag, top) into a single
//! atomic so a thief's claim linearizes at one compare-exchange, and the tag
//! increments whenever a bottom pop races a thief, which defeats ABA on the
//! top index.
//!
//! Capacity is fixed at build time (`deque_capacity` in the tuning file);
//! overflowing it means the program exceeded the supported number of
//! unfinished spawns per worker and is a fatal error.

use crate::config::DEQUE_CAPACITY;
use crate::job::{JobHeader, JobRef};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering, fence};

const TAG_SHIFT: u32 = 32;
const TOP_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[inline]
const fn pack(tag: u32, top: u32) -> u64 {
    ((tag as u64) << TAG_SHIFT) | top as u64
}

#[inline]
const fn tag(age: u64) -> u32 {
    (age >> TAG_SHIFT) as u32
}

#[inline]
const fn top(age: u64) -> u32 {
    (age & TOP_MASK) as u32
}

pub(crate) struct Deque {
    /// Packed (tag:32 | top:32). The linearization point for stealing.
    age: AtomicU64,
    /// Bottom index. Written only by the owner, read by thieves.
    bot: AtomicUsize,
    /// Job slots. Single-word atomic so racy reads can never tear; a stale
    /// read is always discarded by a failed `age` compare-exchange.
    slots: Box<[AtomicPtr<JobHeader>]>,
}

impl Deque {
    pub(crate) fn new() -> Self {
        Self {
            age: AtomicU64::new(pack(0, 0)),
            bot: AtomicUsize::new(0),
            slots: (0..DEQUE_CAPACITY)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
        }
    }

    /// Push a job at the bottom.
    ///
    /// # Safety
    /// Must only be called by the owning worker.
    pub(crate) unsafe fn push_bottom(&self, job: JobRef) {
        let b = self.bot.load(Ordering::Relaxed);
        self.slots[b].store(job.as_ptr(), Ordering::Relaxed);
        if b + 1 == DEQUE_CAPACITY {
            panic!(
                "work deque overflow: more than {} unfinished spawns on one worker",
                DEQUE_CAPACITY - 1
            );
        }
        self.bot.store(b + 1, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    /// Pop the most recently pushed job, contending with thieves for the
    /// last one.
    ///
    /// # Safety
    /// Must only be called by the owning worker.
    pub(crate) unsafe fn pop_bottom(&self) -> Option<JobRef> {
        let b = self.bot.load(Ordering::Relaxed);
        if b == 0 {
            return None;
        }
        let b = b - 1;
        self.bot.store(b, Ordering::Relaxed);
        // Store-load barrier: the decrement must be visible before we look
        // at `age`, and we must see any thief's claim.
        fence(Ordering::SeqCst);
        let ptr = self.slots[b].load(Ordering::Relaxed);
        let job = unsafe { JobRef::from_ptr(ptr) };
        let age = self.age.load(Ordering::SeqCst);
        if b as u64 > top(age) as u64 {
            return Some(job);
        }
        // The deque held at most one job and thieves may be after it.
        self.bot.store(0, Ordering::Relaxed);
        let new_age = pack(tag(age).wrapping_add(1), 0);
        if b as u64 == top(age) as u64
            && self
                .age
                .compare_exchange(age, new_age, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Some(job);
        }
        // A thief won; reset the age for the now-empty deque.
        self.age.store(new_age, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        None
    }

    /// Steal the oldest job. Any worker may call this; failure means either
    /// an empty deque or a lost race, and the caller simply retries
    /// elsewhere.
    pub(crate) fn pop_top(&self) -> Option<JobRef> {
        let age = self.age.load(Ordering::SeqCst);
        let b = self.bot.load(Ordering::Acquire);
        let t = top(age);
        if b as u64 <= t as u64 {
            return None;
        }
        // Read the slot before claiming it; if the claim fails the value is
        // discarded, and the tag guarantees a successful claim saw a slot
        // written for this exact (tag, top).
        let ptr = self.slots[t as usize].load(Ordering::Relaxed);
        debug_assert!(!ptr.is_null());
        let new_age = pack(tag(age), t + 1);
        if self
            .age
            .compare_exchange(age, new_age, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(unsafe { JobRef::from_ptr(ptr) })
        } else {
            None
        }
    }

    /// Number of jobs currently in the deque (racy, diagnostics only).
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let b = self.bot.load(Ordering::Relaxed);
        let t = top(self.age.load(Ordering::Relaxed)) as usize;
        b.saturating_sub(t)
    }
}
