//! Kernel mutexes.
//!
//! The lock word follows the classic three-state futex protocol: 0 is free,
//! 1 is locked, 2 is locked with (possible) waiters. An uncontended lock and
//! unlock are a single atomic each. A contended locker spins for a bounded
//! number of retries on multi-CPU systems, then marks the word contended and
//! parks on the mutex's [`WaitList`] only if the word is still contended
//! under the scheduler lock. Unlock wakes exactly one waiter, and only when
//! the word said there might be one.
//!
//! [`Mutex`] and [`TimedMutex`] are separate types so a timed lock on a
//! mutex that was not created for it cannot be written.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use vali_common::{MutexFlags, OsError, OsResult, ThreadId};

use crate::sched::{Scheduler, WaitList, WakeReason};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Owner value meaning "nobody". Thread ids start at 1.
const NO_OWNER: u64 = 0;

struct RawMutex {
    sched: Arc<Scheduler>,
    flags: MutexFlags,
    word: AtomicU32,
    owner: AtomicU64,
    recursion: AtomicU32,
    waiters: WaitList,
}

impl RawMutex {
    fn new(sched: Arc<Scheduler>, flags: MutexFlags) -> Self {
        RawMutex {
            sched,
            flags,
            word: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            waiters: WaitList::new(),
        }
    }

    fn owned_by(&self, caller: ThreadId) -> bool {
        self.owner.load(Ordering::Acquire) == caller.as_u64()
    }

    fn acquired(&self, caller: ThreadId) {
        self.owner.store(caller.as_u64(), Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
    }

    /// Takes one more level if `caller` already owns a recursive mutex.
    /// `None` means `caller` is not the owner.
    fn relock(&self, caller: ThreadId) -> Option<bool> {
        if !self.owned_by(caller) {
            return None;
        }
        if !self.flags.contains(MutexFlags::RECURSIVE) {
            return Some(false);
        }
        self.recursion.fetch_add(1, Ordering::Relaxed);
        Some(true)
    }

    fn try_lock(&self, caller: ThreadId) -> bool {
        if let Some(relocked) = self.relock(caller) {
            return relocked;
        }
        let taken = self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if taken {
            self.acquired(caller);
        }
        taken
    }

    /// Locks, parking until `deadline` (absolute) if one is given.
    fn lock(&self, caller: ThreadId, deadline: Option<u64>) -> OsResult<()> {
        match self.relock(caller) {
            Some(true) => return Ok(()),
            Some(false) => panic!("{} relocked a non-recursive mutex it already owns", caller),
            None => {}
        }
        if self.try_lock(caller) {
            return Ok(());
        }

        if self.sched.cpu_count() > 1 {
            for _ in 0..self.sched.config().mutex_spin_budget {
                core::hint::spin_loop();
                if self.word.load(Ordering::Relaxed) == UNLOCKED
                    && self
                        .word
                        .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    self.acquired(caller);
                    return Ok(());
                }
            }
        }

        loop {
            if self.word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                self.acquired(caller);
                return Ok(());
            }
            let woke = self.sched.block_if(&self.waiters, caller, deadline, || {
                self.word.load(Ordering::Acquire) == CONTENDED
            });
            match woke {
                Some(WakeReason::TimedOut) => {
                    log::debug!("mutex: {} timed out", caller);
                    return Err(OsError::Timeout);
                }
                Some(WakeReason::Interrupted) if self.sched.state_of(caller).is_none() => {
                    return Err(OsError::Interrupted);
                }
                _ => {}
            }
        }
    }

    fn unlock(&self, caller: ThreadId) {
        let owner = self.owner.load(Ordering::Acquire);
        if owner != caller.as_u64() {
            panic!("{} unlocked a mutex owned by thread#{}", caller, owner);
        }
        let depth = self.recursion.load(Ordering::Relaxed);
        if depth == 0 {
            panic!("{} unlocked a mutex with zero recursion", caller);
        }
        if depth > 1 {
            self.recursion.store(depth - 1, Ordering::Relaxed);
            return;
        }
        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Release);
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.sched.wake_one(&self.waiters);
        }
    }

    fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(ThreadId(id)),
        }
    }
}

/// A mutex without timeouts.
pub struct Mutex {
    raw: RawMutex,
}

impl Mutex {
    /// Creates an unlocked mutex. [`MutexFlags::TIMED`] is ignored.
    pub fn new(sched: Arc<Scheduler>, flags: MutexFlags) -> Self {
        Mutex {
            raw: RawMutex::new(sched, flags - MutexFlags::TIMED),
        }
    }

    /// Blocks until `caller` owns the mutex.
    ///
    /// Only fails, with `Interrupted`, if `caller` is terminated while
    /// waiting.
    pub fn lock(&self, caller: ThreadId) -> OsResult<()> {
        self.raw.lock(caller, None)
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn guard(&self, caller: ThreadId) -> OsResult<MutexGuard<'_>> {
        self.raw.lock(caller, None)?;
        Ok(MutexGuard {
            raw: &self.raw,
            owner: caller,
        })
    }

    /// Takes the mutex only if that needs no waiting. Returns `false`
    /// when someone else holds it, or when `caller` already holds a
    /// non-recursive mutex.
    pub fn try_lock(&self, caller: ThreadId) -> bool {
        self.raw.try_lock(caller)
    }

    /// Releases one level of ownership. Panics unless `caller` owns it.
    pub fn unlock(&self, caller: ThreadId) {
        self.raw.unlock(caller)
    }

    /// Current owner.
    pub fn owner(&self) -> Option<ThreadId> {
        self.raw.owner()
    }

    /// Lock depth of the owner.
    pub fn recursion(&self) -> u32 {
        self.raw.recursion.load(Ordering::Relaxed)
    }

    /// Returns `true` while someone owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.raw.word.load(Ordering::Acquire) != UNLOCKED
    }

    /// Creation flags.
    pub fn flags(&self) -> MutexFlags {
        self.raw.flags
    }
}

/// A mutex whose lock attempts may carry a timeout.
pub struct TimedMutex {
    raw: RawMutex,
}

impl TimedMutex {
    /// Creates an unlocked mutex. [`MutexFlags::TIMED`] is implied.
    pub fn new(sched: Arc<Scheduler>, flags: MutexFlags) -> Self {
        TimedMutex {
            raw: RawMutex::new(sched, flags | MutexFlags::TIMED),
        }
    }

    /// Blocks until `caller` owns the mutex.
    pub fn lock(&self, caller: ThreadId) -> OsResult<()> {
        self.raw.lock(caller, None)
    }

    /// Like [`lock`](Self::lock), but gives up with `Timeout` after
    /// `timeout_ms`. A timeout of zero waits forever.
    pub fn timed_lock(&self, caller: ThreadId, timeout_ms: u64) -> OsResult<()> {
        let deadline = match timeout_ms {
            0 => None,
            ms => Some(self.raw.sched.deadline_after(ms)),
        };
        self.raw.lock(caller, deadline)
    }

    /// Takes the mutex only if that needs no waiting.
    pub fn try_lock(&self, caller: ThreadId) -> bool {
        self.raw.try_lock(caller)
    }

    /// Releases one level of ownership. Panics unless `caller` owns it.
    pub fn unlock(&self, caller: ThreadId) {
        self.raw.unlock(caller)
    }

    /// Current owner.
    pub fn owner(&self) -> Option<ThreadId> {
        self.raw.owner()
    }

    /// Lock depth of the owner.
    pub fn recursion(&self) -> u32 {
        self.raw.recursion.load(Ordering::Relaxed)
    }

    /// Returns `true` while someone owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.raw.word.load(Ordering::Acquire) != UNLOCKED
    }

    /// Creation flags.
    pub fn flags(&self) -> MutexFlags {
        self.raw.flags
    }
}

/// RAII guard that unlocks a [`Mutex`] when dropped.
pub struct MutexGuard<'a> {
    raw: &'a RawMutex,
    owner: ThreadId,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.raw.unlock(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{host_scheduler, spawn_kernel_thread, tick_until, wait_for};
    use core::sync::atomic::AtomicUsize;
    use vali_common::ThreadFlags;
    use crate::sched::Affinity;

    fn thread(sched: &Scheduler) -> ThreadId {
        sched
            .create_object(ThreadFlags::empty(), Affinity::Any, 0)
            .unwrap()
    }

    #[test]
    fn test_mutex_uncontended() {
        let (_platform, sched) = host_scheduler(1);
        let me = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());

        mutex.lock(me).unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(me));
        assert_eq!(mutex.recursion(), 1);
        mutex.unlock(me);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.owner(), None);
    }

    #[test]
    fn test_mutex_try_lock_fails_when_locked() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let b = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());

        assert!(mutex.try_lock(a));
        assert!(!mutex.try_lock(b));
        mutex.unlock(a);
        assert!(mutex.try_lock(b));
        assert_eq!(mutex.owner(), Some(b));
    }

    #[test]
    fn test_recursive_mutex() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let b = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::RECURSIVE);

        for _ in 0..3 {
            mutex.lock(a).unwrap();
        }
        assert_eq!(mutex.recursion(), 3);
        assert!(!mutex.try_lock(b));
        mutex.unlock(a);
        mutex.unlock(a);
        assert!(mutex.is_locked());
        mutex.unlock(a);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock(b));
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let (_platform, sched) = host_scheduler(1);
        let me = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());
        {
            let _guard = mutex.guard(me).unwrap();
            assert_eq!(mutex.owner(), Some(me));
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    #[should_panic(expected = "unlocked a mutex owned by")]
    fn test_unlock_by_non_owner_is_fatal() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let b = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());
        mutex.lock(a).unwrap();
        mutex.unlock(b);
    }

    #[test]
    #[should_panic(expected = "unlocked a mutex owned by")]
    fn test_unlock_of_free_mutex_is_fatal() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());
        mutex.unlock(a);
    }

    #[test]
    fn test_try_lock_by_owner_of_non_recursive_fails() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Mutex::new(sched.clone(), MutexFlags::empty());
        mutex.lock(a).unwrap();
        assert!(!mutex.try_lock(a));
        assert_eq!(mutex.recursion(), 1);
        mutex.unlock(a);
        assert!(!mutex.is_locked());

        let timed = TimedMutex::new(sched, MutexFlags::empty());
        assert!(timed.try_lock(a));
        assert!(!timed.try_lock(a));
        timed.unlock(a);
        assert!(!timed.is_locked());
    }

    #[test]
    #[should_panic(expected = "non-recursive")]
    fn test_blocking_relock_of_non_recursive_is_fatal() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Mutex::new(sched, MutexFlags::empty());
        mutex.lock(a).unwrap();
        let _ = mutex.lock(a);
    }

    #[test]
    fn test_blocked_locker_gets_mutex_after_unlock() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Arc::new(Mutex::new(sched.clone(), MutexFlags::empty()));
        mutex.lock(a).unwrap();

        let (b, handle) = {
            let mutex = mutex.clone();
            spawn_kernel_thread(&sched, move |_, me| {
                assert!(!mutex.try_lock(me));
                mutex.lock(me).unwrap();
                let owner = mutex.owner();
                mutex.unlock(me);
                owner
            })
        };
        wait_for(|| mutex.raw.waiters.len() == 1);
        mutex.unlock(a);
        assert_eq!(handle.join().unwrap(), Some(b));
        assert!(!mutex.is_locked());
        assert!(mutex.raw.waiters.is_empty());
    }

    fn hammer(cpus: u32) {
        let (_platform, sched) = host_scheduler(cpus);
        let mutex = Arc::new(Mutex::new(sched.clone(), MutexFlags::empty()));
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let handles: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                let total = total.clone();
                spawn_kernel_thread(&sched, move |_, me| {
                    for _ in 0..200 {
                        mutex.lock(me).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.unlock(me);
                    }
                })
                .1
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 800);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_mutual_exclusion_single_cpu() {
        hammer(1);
    }

    #[test]
    fn test_mutual_exclusion_with_spinning() {
        hammer(4);
    }

    #[test]
    fn test_timed_lock_times_out() {
        let (platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Arc::new(TimedMutex::new(sched.clone(), MutexFlags::empty()));
        assert!(mutex.flags().contains(MutexFlags::TIMED));
        mutex.lock(a).unwrap();

        let (_b, handle) = {
            let mutex = mutex.clone();
            spawn_kernel_thread(&sched, move |_, me| mutex.timed_lock(me, 20))
        };
        wait_for(|| mutex.raw.waiters.len() == 1);
        assert!(tick_until(&platform, &sched, || handle.is_finished()));
        assert_eq!(handle.join().unwrap(), Err(OsError::Timeout));
        assert_eq!(mutex.owner(), Some(a));

        mutex.unlock(a);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_timed_lock_zero_waits_forever() {
        let (_platform, sched) = host_scheduler(1);
        let a = thread(&sched);
        let mutex = Arc::new(TimedMutex::new(sched.clone(), MutexFlags::empty()));
        mutex.lock(a).unwrap();

        let (b, handle) = {
            let mutex = mutex.clone();
            spawn_kernel_thread(&sched, move |_, me| {
                let result = mutex.timed_lock(me, 0);
                mutex.unlock(me);
                result
            })
        };
        wait_for(|| mutex.raw.waiters.len() == 1);
        assert_eq!(sched.cpu_of(b).map(|cpu| cpu.0), Some(0));
        mutex.unlock(a);
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
}
