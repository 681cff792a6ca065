use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{hint, thread};
use std::ops::{Deref, DerefMut};

/// Spins before falling back to `yield_now` between lock attempts.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Non-reentrant spin-wait mutex for very short critical sections.
///
/// Each pool owns one. Critical sections are O(1) list manipulation except
/// for the occasional decommit during a trim pass, so waiters spin on a
/// relaxed load and only yield after [`SPINS_BEFORE_YIELD`] failed rounds.
/// A panic while the lock is held does not poison it.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialised by `locked`.
unsafe impl<T: Send> Send for SpinMutex<T> {}
// Safety: access to `value` is serialised by `locked`.
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinMutexGuard { mutex: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    #[cfg(test)]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinMutexGuard { mutex: self })
    }

    #[cfg(all(test, not(loom)))]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

// Safety: a shared guard only hands out `&T`.
unsafe impl<T: Sync> Sync for SpinMutexGuard<'_, T> {}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the lock is held.
        crate::sync::unsafe_cell_get!(self.mutex.value)
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the lock is held and `&mut self` makes the
        // borrow unique.
        crate::sync::unsafe_cell_get_mut!(self.mutex.value)
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;

    #[test]
    fn test_lock_unlock() {
        let mutex = SpinMutex::new(5u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 6);
        assert_eq!(mutex.into_inner(), 6);
    }

    #[test]
    fn test_guard_shared_across_threads() {
        let mutex = SpinMutex::new(vec![1u32, 2, 3]);
        let guard = mutex.lock();
        let total: u32 = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2).map(|_| s.spawn(|| guard.iter().sum::<u32>())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(total, 12);
    }

    #[test]
    fn test_try_lock_while_held() {
        let mutex = SpinMutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_contended_increments() {
        let mutex = Arc::new(SpinMutex::new(0usize));
        let threads = 8;
        let iters = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let m = mutex.clone();
                crate::sync::thread::spawn(move || {
                    for _ in 0..iters {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*mutex.lock(), threads * iters);
    }

    #[test]
    fn test_panic_while_held_does_not_poison() {
        let mutex = Arc::new(SpinMutex::new(1u8));
        let m = mutex.clone();
        let result = std::thread::spawn(move || {
            let _guard = m.lock();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(*mutex.lock(), 1);
    }
}
