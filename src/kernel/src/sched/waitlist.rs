//! The blocking primitive every sleeping kernel path goes through.
//!
//! A [`WaitList`] is only a FIFO of thread ids. Parking and waking happen in
//! the scheduler ([`Scheduler::block`](super::Scheduler::block) and friends)
//! so that list membership and the Blocked state always change together
//! under the scheduler lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use vali_common::ThreadId;

/// Shared body of a wait list. A blocked object keeps a reference to the
/// queue it sits on so a timeout or expedite can unlink it.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: spin::Mutex<VecDeque<ThreadId>>,
}

impl WaitQueue {
    pub(crate) fn push(&self, id: ThreadId) {
        self.waiters.lock().push_back(id);
    }

    pub(crate) fn pop(&self) -> Option<ThreadId> {
        self.waiters.lock().pop_front()
    }

    pub(crate) fn remove(&self, id: ThreadId) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|&waiter| waiter == id) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// FIFO list of blocked threads, owned by whatever they wait for.
#[derive(Debug, Clone, Default)]
pub struct WaitList {
    pub(crate) queue: Arc<WaitQueue>,
}

impl WaitList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocked threads.
    pub fn len(&self) -> usize {
        self.queue.waiters.lock().len()
    }

    /// Returns `true` if nobody waits on the list.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` is blocked on this list.
    pub fn contains(&self, id: ThreadId) -> bool {
        self.queue.waiters.lock().contains(&id)
    }

    /// Snapshot of the waiters in wake order.
    pub fn waiters(&self) -> alloc::vec::Vec<ThreadId> {
        self.queue.waiters.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let list = WaitList::new();
        assert!(list.is_empty());
        list.queue.push(ThreadId(1));
        list.queue.push(ThreadId(2));
        list.queue.push(ThreadId(3));
        assert_eq!(list.len(), 3);
        assert_eq!(list.queue.pop(), Some(ThreadId(1)));
        assert_eq!(list.waiters(), [ThreadId(2), ThreadId(3)]);
    }

    #[test]
    fn test_remove_from_middle() {
        let list = WaitList::new();
        for id in 1..=3 {
            list.queue.push(ThreadId(id));
        }
        assert!(list.queue.remove(ThreadId(2)));
        assert!(!list.queue.remove(ThreadId(2)));
        assert!(!list.contains(ThreadId(2)));
        assert_eq!(list.waiters(), [ThreadId(1), ThreadId(3)]);
    }

    #[test]
    fn test_clones_share_waiters() {
        let list = WaitList::new();
        let alias = list.clone();
        alias.queue.push(ThreadId(4));
        assert!(list.contains(ThreadId(4)));
    }
}
