//! Synchronization primitives for the scheduler and allocator.
//!
//! The allocator cannot take a `std::sync::Mutex` on its metadata paths:
//! when registered as the global allocator, a mutex that allocates would
//! recurse. Its shared pools use the allocation-free [`SpinMutex`] here.
//! The scheduler's only blocking primitive is the counting [`Semaphore`]
//! that idle workers park on.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A test-and-set spin mutex.
///
/// Const-constructible and allocation-free, so it can guard allocator
/// metadata from inside allocation calls. Critical sections under it are
/// short (free-list splices and slab carving), which is what makes
/// spinning acceptable.
pub struct SpinMutex<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire, spinning until the mutex is free. Released when the guard
    /// drops.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.contend();
        }
        SpinMutexGuard { mutex: self }
    }

    /// Wait out the current holder without hammering the cache line with
    /// exchanges.
    #[cold]
    fn contend(&self) {
        while self.held.load(Ordering::Relaxed) {
            core::hint::spin_loop();
        }
    }
}

/// RAII guard for [`SpinMutex`]. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.held.store(false, Ordering::Release);
    }
}

/// A counting semaphore.
///
/// Workers park on their own semaphore when they attach a lifeline; the
/// target posts it when it next becomes busy. `post` before `wait` is
/// remembered, so a wakeup issued while the other side is still on its way
/// to sleep is never lost.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter if any.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        drop(count);
        self.available.notify_one();
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_spinmutex_guards_value() {
        let mutex = SpinMutex::new(42u64);
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 42);
        }
        *mutex.lock() = 100;
        assert_eq!(*mutex.lock(), 100);
    }

    #[test]
    fn test_spinmutex_releases_on_drop() {
        let mutex = SpinMutex::new(());
        drop(mutex.lock());
        // A second lock on the same thread must not spin forever.
        drop(mutex.lock());
    }

    #[test]
    fn test_spinmutex_mutual_exclusion() {
        let mutex = Arc::new(SpinMutex::new(0u64));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let m = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), num_threads * iterations);
    }

    #[test]
    fn test_semaphore_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        // Permit posted before wait is not lost.
        sem.wait();
    }

    #[test]
    fn test_semaphore_wakes_sleeper() {
        let sem = Arc::new(Semaphore::new());
        let s = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            s.wait();
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_semaphore_counts_permits() {
        let sem = Arc::new(Semaphore::new());
        for _ in 0..5 {
            sem.post();
        }
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let s = Arc::clone(&sem);
                std::thread::spawn(move || s.wait())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
