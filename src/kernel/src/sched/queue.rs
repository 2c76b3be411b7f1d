//! Per-CPU multilevel ready queues.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use vali_common::ThreadId;

use crate::config::{LEVEL_COUNT, TIME_CRITICAL_LEVEL};

/// Counters kept per CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    /// Times a different object was selected.
    pub context_switches: u64,
    /// Times the running object used up its slice and was demoted.
    pub preemptions: u64,
    /// Priority boosts applied.
    pub boosts: u64,
    /// Times the idle object was selected.
    pub idle_selections: u64,
}

/// Ready queues and bookkeeping of one CPU.
#[derive(Debug)]
pub(crate) struct RunQueue {
    levels: [VecDeque<ThreadId>; LEVEL_COUNT],
    pub(crate) current: Option<ThreadId>,
    pub(crate) idle: ThreadId,
    /// Objects on this CPU with a pending deadline.
    pub(crate) sleepers: Vec<ThreadId>,
    /// Sum of the time slices of all objects placed here.
    pub(crate) bandwidth: u64,
    pub(crate) since_boost: u64,
    pub(crate) active_space: Option<u64>,
    pub(crate) enabled: bool,
    pub(crate) stats: CpuStats,
}

impl RunQueue {
    pub(crate) fn new(idle: ThreadId) -> Self {
        RunQueue {
            levels: core::array::from_fn(|_| VecDeque::new()),
            current: None,
            idle,
            sleepers: Vec::new(),
            bandwidth: 0,
            since_boost: 0,
            active_space: None,
            enabled: true,
            stats: CpuStats::default(),
        }
    }

    /// Appends `id` to `level`. Queuing an object twice is fatal.
    pub(crate) fn push(&mut self, level: usize, id: ThreadId) {
        let queue = &mut self.levels[level];
        assert!(!queue.contains(&id), "{} queued twice on level {}", id, level);
        queue.push_back(id);
    }

    pub(crate) fn remove(&mut self, level: usize, id: ThreadId) -> bool {
        let queue = &mut self.levels[level];
        match queue.iter().position(|&queued| queued == id) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Takes the next object: time-critical first, then level 0 downwards.
    pub(crate) fn pop_next(&mut self) -> Option<ThreadId> {
        if let Some(id) = self.levels[TIME_CRITICAL_LEVEL].pop_front() {
            return Some(id);
        }
        self.levels[..TIME_CRITICAL_LEVEL]
            .iter_mut()
            .find_map(|queue| queue.pop_front())
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn has_ready(&self) -> bool {
        self.levels.iter().any(|queue| !queue.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    /// Moves every feedback level onto level 0, keeping relative order.
    pub(crate) fn boost(&mut self) {
        let (top, rest) = self.levels[..TIME_CRITICAL_LEVEL].split_at_mut(1);
        for queue in rest {
            top[0].extend(queue.drain(..));
        }
    }
}
