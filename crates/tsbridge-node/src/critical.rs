//! Process-wide critical section.
//!
//! Every transport call made by publishers and subscribers, every change to
//! gate state, and every subscriber read-compute-schedule sequence runs while
//! holding this one lock. Transports are not assumed to be reentrant, even
//! across distinct connections, so a per-instance lock is not enough.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

static SECTION: Mutex<()> = Mutex::new(());
static CHANGED: Condvar = Condvar::new();

/// Held critical section. Dropping it leaves the section.
#[must_use = "the critical section is released as soon as the guard is dropped"]
pub struct CriticalSection {
    guard: MutexGuard<'static, ()>,
}

/// Enters the critical section, blocking until it is available.
///
/// Not reentrant: entering twice on one thread deadlocks.
pub fn enter_critical_section() -> CriticalSection {
    CriticalSection {
        guard: SECTION.lock().unwrap_or_else(PoisonError::into_inner),
    }
}

/// Wakes every thread waiting inside [`CriticalSection::wait_until`].
pub fn notify_all() {
    CHANGED.notify_all();
}

impl CriticalSection {
    /// Leaves the section until notified or until `timeout` passes, then
    /// re-enters it. Returns whether the wait timed out.
    pub fn wait_timeout(self, timeout: Duration) -> (Self, bool) {
        let (guard, result) = CHANGED
            .wait_timeout(self.guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (Self { guard }, result.timed_out())
    }

    /// Waits while `blocked` holds, up to `deadline`.
    ///
    /// Returns the re-entered section and `true` when the deadline passed with
    /// the condition still blocking.
    pub fn wait_until(self, deadline: Instant, mut blocked: impl FnMut() -> bool) -> (Self, bool) {
        let mut section = self;
        loop {
            if !blocked() {
                return (section, false);
            }
            let now = Instant::now();
            if now >= deadline {
                return (section, true);
            }
            section = section.wait_timeout(deadline - now).0;
        }
    }
}
