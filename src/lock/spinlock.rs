//! Spin locks
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, NewRawLock, RawLock};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinLock {
    /// Name of lock for debugging.
    #[allow(dead_code)]
    name: &'static str,

    locked: AtomicBool,
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
        }
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock.
    /// Loops (spins) until the lock is acquired.
    ///
    /// To ensure that all stores done in one critical section are visible in the
    /// next critical section's loads, the exchange uses `Acquire` ordering, paired
    /// with a `Release` store in `release()`.
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Releases the lock.
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl NewRawLock for RawSpinLock {
    fn raw(name: &'static str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SpinLock::<RawFields>::new("test", RawFields { n: 0 });
        {
            let mut g = lock.lock();
            g.n += 1;
        }
        assert_eq!(lock.lock().n, 1);
    }

    struct RawFields {
        n: u32,
    }
}
