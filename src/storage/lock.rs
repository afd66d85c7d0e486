//! Append lock variants
//!
//! Appends are serialized by exactly one lock. Two interchangeable
//! implementations sit behind one guard-based API: a parking mutex (parks
//! the thread on contention) and a spin lock (busy-waits with a pause
//! hint, lower wakeup latency under very low contention).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

pub enum AppendLock {
    Mutex(Mutex<()>),
    Spin(AtomicBool),
}

impl AppendLock {
    pub fn new(use_mutex: bool) -> Self {
        if use_mutex {
            Self::Mutex(Mutex::new(()))
        } else {
            Self::Spin(AtomicBool::new(false))
        }
    }

    /// Acquire the lock; released when the guard drops
    pub fn lock(&self) -> AppendLockGuard<'_> {
        match self {
            Self::Mutex(mutex) => AppendLockGuard::Mutex(mutex.lock()),
            Self::Spin(flag) => {
                while flag
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
                AppendLockGuard::Spin(flag)
            }
        }
    }
}

pub enum AppendLockGuard<'a> {
    Mutex(MutexGuard<'a, ()>),
    Spin(&'a AtomicBool),
}

impl Drop for AppendLockGuard<'_> {
    fn drop(&mut self) {
        // the mutex guard unlocks itself
        if let AppendLockGuard::Spin(flag) = self {
            flag.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn hammer(lock: Arc<AppendLock>, counter: Arc<parking_lot::Mutex<u64>>) {
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.lock();
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }

    #[test]
    fn test_mutex_variant_serializes() {
        hammer(
            Arc::new(AppendLock::new(true)),
            Arc::new(parking_lot::Mutex::new(0)),
        );
    }

    #[test]
    fn test_spin_variant_serializes() {
        hammer(
            Arc::new(AppendLock::new(false)),
            Arc::new(parking_lot::Mutex::new(0)),
        );
    }
}
