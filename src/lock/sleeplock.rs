//! Sleeping locks: long-term locks held across disk I/O.
//!
//! In the full kernel a contended sleep-lock suspends the current task on a
//! wait channel. The scheduler lives outside this crate, so contention here
//! parks the task by spinning; what the rest of the core relies on is only
//! that the lock may be held across blocking operations and is not reentrant.
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, NewRawLock, RawLock};

pub struct RawSleepLock {
    /// Name of lock for debugging.
    #[allow(dead_code)]
    name: &'static str,

    locked: AtomicBool,
}

/// Locks that the holder may keep while sleeping.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl NewRawLock for RawSleepLock {
    fn raw(name: &'static str) -> Self {
        Self::new(name)
    }
}
