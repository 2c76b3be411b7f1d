//! Address-keyed wait queues for userspace synchronization.
//!
//! A futex is any aligned 32-bit word. Waiters are grouped by
//! `(address space, address)` into one of 64 hashed buckets; each key owns a
//! [`WaitList`] for as long as somebody is waiting on it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use vali_common::{OsError, OsResult, ThreadId};

use crate::sched::{Scheduler, WaitList, WakeReason};

const BUCKET_COUNT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FutexKey {
    space: u64,
    address: usize,
}

impl FutexKey {
    fn new(space: u64, word: &AtomicI32) -> Self {
        FutexKey {
            space,
            address: word as *const AtomicI32 as usize,
        }
    }

    fn bucket(&self) -> usize {
        let mixed = (self.address as u64 ^ self.space.rotate_left(32)) as u32;
        hash32(mixed ^ (self.address as u64 >> 32) as u32) as usize % BUCKET_COUNT
    }
}

fn hash32(mut x: u32) -> u32 {
    x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
    x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
    (x >> 16) ^ x
}

struct FutexEntry {
    key: FutexKey,
    waiters: WaitList,
    users: usize,
}

/// Arithmetic applied to the second word by [`FutexTable::wake_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexOpKind {
    /// `word = arg`
    Set = 0,
    /// `word += arg`
    Add = 1,
    /// `word |= arg`
    Or = 2,
    /// `word &= !arg`
    AndNot = 3,
    /// `word ^= arg`
    Xor = 4,
}

/// Comparison of the second word's old value in [`FutexTable::wake_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexCmp {
    /// `old == arg`
    Eq = 0,
    /// `old != arg`
    Ne = 1,
    /// `old < arg`
    Lt = 2,
    /// `old <= arg`
    Le = 3,
    /// `old > arg`
    Gt = 4,
    /// `old >= arg`
    Ge = 5,
}

/// An encoded wake-op: operation in bits 28-31, comparison in 24-27,
/// operation argument in 12-23 and comparison argument in 0-11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutexOp {
    /// Operation on the second word.
    pub kind: FutexOpKind,
    /// Operation argument (12 bits).
    pub oparg: i32,
    /// Comparison on the old value.
    pub cmp: FutexCmp,
    /// Comparison argument (12 bits).
    pub cmparg: i32,
}

impl FutexOp {
    /// Decodes the packed representation.
    pub fn decode(raw: u32) -> OsResult<Self> {
        let kind = match (raw >> 28) & 0xF {
            0 => FutexOpKind::Set,
            1 => FutexOpKind::Add,
            2 => FutexOpKind::Or,
            3 => FutexOpKind::AndNot,
            4 => FutexOpKind::Xor,
            _ => return Err(OsError::InvalidParameters),
        };
        let cmp = match (raw >> 24) & 0xF {
            0 => FutexCmp::Eq,
            1 => FutexCmp::Ne,
            2 => FutexCmp::Lt,
            3 => FutexCmp::Le,
            4 => FutexCmp::Gt,
            5 => FutexCmp::Ge,
            _ => return Err(OsError::InvalidParameters),
        };
        Ok(FutexOp {
            kind,
            oparg: ((raw >> 12) & 0xFFF) as i32,
            cmp,
            cmparg: (raw & 0xFFF) as i32,
        })
    }

    /// Packs the operation. Arguments are truncated to 12 bits.
    pub fn encode(self) -> u32 {
        ((self.kind as u32) << 28)
            | ((self.cmp as u32) << 24)
            | ((self.oparg as u32 & 0xFFF) << 12)
            | (self.cmparg as u32 & 0xFFF)
    }

    /// Applies the operation to `word` and returns its old value.
    fn apply(self, word: &AtomicI32) -> i32 {
        match self.kind {
            FutexOpKind::Set => word.swap(self.oparg, Ordering::AcqRel),
            FutexOpKind::Add => word.fetch_add(self.oparg, Ordering::AcqRel),
            FutexOpKind::Or => word.fetch_or(self.oparg, Ordering::AcqRel),
            FutexOpKind::AndNot => word.fetch_and(!self.oparg, Ordering::AcqRel),
            FutexOpKind::Xor => word.fetch_xor(self.oparg, Ordering::AcqRel),
        }
    }

    fn holds_for(self, old: i32) -> bool {
        match self.cmp {
            FutexCmp::Eq => old == self.cmparg,
            FutexCmp::Ne => old != self.cmparg,
            FutexCmp::Lt => old < self.cmparg,
            FutexCmp::Le => old <= self.cmparg,
            FutexCmp::Gt => old > self.cmparg,
            FutexCmp::Ge => old >= self.cmparg,
        }
    }
}

/// The futex hash table.
pub struct FutexTable {
    sched: Arc<Scheduler>,
    buckets: Vec<spin::Mutex<Vec<FutexEntry>>>,
}

impl FutexTable {
    /// Creates an empty table.
    pub fn new(sched: Arc<Scheduler>) -> Self {
        FutexTable {
            sched,
            buckets: (0..BUCKET_COUNT).map(|_| spin::Mutex::new(Vec::new())).collect(),
        }
    }

    /// Blocks `caller` while `*word == expected`.
    ///
    /// Fails with `Interrupted` when the word already differs (or the wait
    /// is expedited) and with `Timeout` when `timeout_ms` passes.
    pub fn wait(
        &self,
        caller: ThreadId,
        space: u64,
        word: &AtomicI32,
        expected: i32,
        timeout_ms: Option<u64>,
    ) -> OsResult<()> {
        let key = FutexKey::new(space, word);
        let deadline = timeout_ms.map(|ms| self.sched.deadline_after(ms));
        let waiters = self.enter(key)?;
        let woke = self.sched.block_if(&waiters, caller, deadline, || {
            word.load(Ordering::Acquire) == expected
        });
        self.leave(key);
        match woke {
            Some(WakeReason::Signaled) => Ok(()),
            Some(WakeReason::TimedOut) => Err(OsError::Timeout),
            Some(WakeReason::Interrupted) | None => Err(OsError::Interrupted),
        }
    }

    /// Wakes up to `count` waiters of `word`. Returns how many woke.
    pub fn wake(&self, space: u64, word: &AtomicI32, count: usize) -> usize {
        let Some(waiters) = self.lookup(FutexKey::new(space, word)) else {
            return 0;
        };
        (0..count)
            .map_while(|_| self.sched.wake_one(&waiters))
            .count()
    }

    /// Applies `op` to `word2`, wakes up to `count1` waiters of `word1`, and,
    /// if `op`'s comparison holds for the old value of `word2`, up to
    /// `count2` waiters of `word2`.
    pub fn wake_op(
        &self,
        space: u64,
        word1: &AtomicI32,
        count1: usize,
        word2: &AtomicI32,
        count2: usize,
        op: FutexOp,
    ) -> usize {
        let old = op.apply(word2);
        let mut woken = self.wake(space, word1, count1);
        if op.holds_for(old) {
            woken += self.wake(space, word2, count2);
        }
        woken
    }

    /// Keys with at least one registered waiter.
    pub fn active_keys(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    fn enter(&self, key: FutexKey) -> OsResult<WaitList> {
        let mut bucket = self.buckets[key.bucket()].lock();
        if let Some(entry) = bucket.iter_mut().find(|entry| entry.key == key) {
            entry.users += 1;
            return Ok(entry.waiters.clone());
        }
        bucket.try_reserve(1).map_err(|_| OsError::OutOfMemory)?;
        let waiters = WaitList::new();
        bucket.push(FutexEntry {
            key,
            waiters: waiters.clone(),
            users: 1,
        });
        Ok(waiters)
    }

    fn leave(&self, key: FutexKey) {
        let mut bucket = self.buckets[key.bucket()].lock();
        if let Some(index) = bucket.iter().position(|entry| entry.key == key) {
            let entry = &mut bucket[index];
            entry.users -= 1;
            if entry.users == 0 {
                bucket.swap_remove(index);
            }
        }
    }

    fn lookup(&self, key: FutexKey) -> Option<WaitList> {
        self.buckets[key.bucket()]
            .lock()
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.waiters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{host_scheduler, spawn_kernel_thread, tick_until, wait_for};

    #[test]
    fn test_op_encoding() {
        let op = FutexOp {
            kind: FutexOpKind::Add,
            oparg: 3,
            cmp: FutexCmp::Gt,
            cmparg: 7,
        };
        assert_eq!(op.encode(), (1 << 28) | (4 << 24) | (3 << 12) | 7);
        assert_eq!(FutexOp::decode(op.encode()), Ok(op));
        assert_eq!(FutexOp::decode(9 << 28), Err(OsError::InvalidParameters));
        assert_eq!(FutexOp::decode(6 << 24), Err(OsError::InvalidParameters));
    }

    #[test]
    fn test_wait_on_changed_value_returns_immediately() {
        let (_platform, sched) = host_scheduler(1);
        let futexes = FutexTable::new(sched.clone());
        let me = sched
            .create_object(vali_common::ThreadFlags::empty(), crate::sched::Affinity::Any, 0)
            .unwrap();
        let word = AtomicI32::new(1);
        assert_eq!(
            futexes.wait(me, 0, &word, 0, None),
            Err(OsError::Interrupted)
        );
        assert_eq!(futexes.active_keys(), 0);
    }

    #[test]
    fn test_wait_and_wake() {
        let (_platform, sched) = host_scheduler(1);
        let futexes = Arc::new(FutexTable::new(sched.clone()));
        let word = Arc::new(AtomicI32::new(0));
        let handles: std::vec::Vec<_> = (0..3)
            .map(|_| {
                let futexes = futexes.clone();
                let word = word.clone();
                spawn_kernel_thread(&sched, move |_, me| futexes.wait(me, 0, &word, 0, None)).1
            })
            .collect();
        wait_for(|| {
            futexes
                .lookup(FutexKey::new(0, &word))
                .is_some_and(|waiters| waiters.len() == 3)
        });
        // Same address in another space is a different futex.
        assert_eq!(futexes.wake(1, &word, 10), 0);

        word.store(1, Ordering::Release);
        assert_eq!(futexes.wake(0, &word, 2), 2);
        assert_eq!(futexes.wake(0, &word, 2), 1);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(futexes.active_keys(), 0);
    }

    #[test]
    fn test_wait_timeout() {
        let (platform, sched) = host_scheduler(1);
        let futexes = Arc::new(FutexTable::new(sched.clone()));
        let word = Arc::new(AtomicI32::new(5));
        let (_thread, handle) = {
            let futexes = futexes.clone();
            let word = word.clone();
            spawn_kernel_thread(&sched, move |_, me| futexes.wait(me, 0, &word, 5, Some(10)))
        };
        wait_for(|| futexes.active_keys() == 1);
        assert!(tick_until(&platform, &sched, || handle.is_finished()));
        assert_eq!(handle.join().unwrap(), Err(OsError::Timeout));
        assert_eq!(futexes.active_keys(), 0);
    }

    #[test]
    fn test_wake_op_applies_and_compares_old_value() {
        let (_platform, sched) = host_scheduler(1);
        let futexes = Arc::new(FutexTable::new(sched.clone()));
        let first = Arc::new(AtomicI32::new(0));
        let second = Arc::new(AtomicI32::new(1));

        let waiter = |word: Arc<AtomicI32>, expected: i32| {
            let futexes = futexes.clone();
            spawn_kernel_thread(&sched, move |_, me| {
                futexes.wait(me, 0, &word, expected, None)
            })
            .1
        };
        let on_first = waiter(first.clone(), 0);
        let on_second = waiter(second.clone(), 1);
        let parked = |word: &AtomicI32| {
            futexes
                .lookup(FutexKey::new(0, word))
                .is_some_and(|waiters| waiters.len() == 1)
        };
        wait_for(|| parked(&first) && parked(&second));

        let op = FutexOp {
            kind: FutexOpKind::Add,
            oparg: 1,
            cmp: FutexCmp::Eq,
            cmparg: 1,
        };
        assert_eq!(futexes.wake_op(0, &first, 1, &second, 1, op), 2);
        assert_eq!(second.load(Ordering::Acquire), 2);
        assert_eq!(on_first.join().unwrap(), Ok(()));
        assert_eq!(on_second.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_wake_op_failed_compare_skips_second() {
        let (_platform, sched) = host_scheduler(1);
        let futexes = FutexTable::new(sched);
        let first = AtomicI32::new(0);
        let second = AtomicI32::new(0b1100);
        let op = FutexOp {
            kind: FutexOpKind::AndNot,
            oparg: 0b0100,
            cmp: FutexCmp::Lt,
            cmparg: 0,
        };
        assert_eq!(futexes.wake_op(0, &first, 1, &second, 1, op), 0);
        assert_eq!(second.load(Ordering::Acquire), 0b1000);
    }
}
