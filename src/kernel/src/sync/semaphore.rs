//! Counting semaphore for kernel threads.
//!
//! Waiters park on a [`WaitList`]; the permit check happens inside the
//! scheduler critical section, so a release can never slip between a
//! failed acquire and the park.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use vali_common::{OsError, OsResult, ThreadId};

use crate::sched::{Scheduler, WaitList, WakeReason};

/// A counting semaphore with an upper bound on its permits.
///
/// Releasing into a full semaphore is a no-op apart from the wakeup, which
/// lets it double as an edge-triggered signal (the janitor's use).
pub struct Semaphore {
    sched: Arc<Scheduler>,
    permits: AtomicUsize,
    limit: usize,
    waiters: WaitList,
}

impl Semaphore {
    /// Creates a semaphore holding `permits`, which is also its limit.
    pub fn new(sched: Arc<Scheduler>, permits: usize) -> Self {
        Self::with_max(sched, permits, permits)
    }

    /// Creates a semaphore holding `initial` permits out of at most `limit`.
    pub fn with_max(sched: Arc<Scheduler>, initial: usize, limit: usize) -> Self {
        debug_assert!(initial <= limit, "semaphore starts above its limit");
        Semaphore {
            sched,
            permits: AtomicUsize::new(initial),
            limit,
            waiters: WaitList::new(),
        }
    }

    /// Permits that can be taken right now.
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Number of threads blocked in [`acquire`](Self::acquire).
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Takes a permit if one is available.
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |permits| {
                permits.checked_sub(1)
            })
            .is_ok()
    }

    /// Takes a permit, blocking `caller` while none is available.
    ///
    /// `timeout_ms` of `None` waits forever. Fails with `Timeout` when the
    /// timeout passes and with `Interrupted` when the wait is expedited.
    pub fn acquire(&self, caller: ThreadId, timeout_ms: Option<u64>) -> OsResult<()> {
        let deadline = timeout_ms.map(|ms| self.sched.deadline_after(ms));
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let woke = self.sched.block_if(&self.waiters, caller, deadline, || {
                self.permits.load(Ordering::Acquire) == 0
            });
            match woke {
                Some(WakeReason::TimedOut) if !self.try_acquire() => {
                    return Err(OsError::Timeout)
                }
                Some(WakeReason::TimedOut) => return Ok(()),
                Some(WakeReason::Interrupted) => return Err(OsError::Interrupted),
                Some(WakeReason::Signaled) | None => {}
            }
        }
    }

    /// Returns a permit, saturating at the limit, and wakes the oldest waiter.
    pub fn release(&self) {
        let _ = self
            .permits
            .fetch_update(Ordering::Release, Ordering::Relaxed, |permits| {
                (permits < self.limit).then(|| permits + 1)
            });
        self.sched.wake_one(&self.waiters);
    }
}
