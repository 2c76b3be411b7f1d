//! Scheduler objects and their state machine.

use alloc::sync::Arc;

use vali_common::{CpuId, ThreadFlags, ThreadId};

use super::waitlist::WaitQueue;

/// Scheduling state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Placed on a CPU but not started yet; never selected.
    Created,
    /// Sitting on a ready queue.
    Ready,
    /// Selected by its CPU.
    Running,
    /// Parked on a wait list, possibly with a deadline.
    Blocked,
    /// Parked on the sleep queue only.
    Sleeping,
    /// Gone; never scheduled again.
    Terminated,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Start,
    Execute,
    Preempt,
    Block,
    Sleep,
    Wake,
    Terminate,
}

impl ObjectState {
    /// The state reached from `self` on `event`, or `None` when the
    /// transition does not exist.
    pub(crate) fn on(self, event: Event) -> Option<ObjectState> {
        use ObjectState::*;
        match (self, event) {
            (Terminated, _) => None,
            (_, Event::Terminate) => Some(Terminated),
            (Created, Event::Start) => Some(Ready),
            (Ready, Event::Execute) => Some(Running),
            (Running, Event::Preempt) => Some(Ready),
            // A thread still executing kernel code may already have been
            // queued as Ready by a preemption.
            (Running | Ready, Event::Block) => Some(Blocked),
            (Running | Ready, Event::Sleep) => Some(Sleeping),
            (Blocked | Sleeping, Event::Wake) => Some(Ready),
            _ => None,
        }
    }

    /// True while the object waits on a list or the sleep queue.
    pub fn is_parked(self) -> bool {
        matches!(self, ObjectState::Blocked | ObjectState::Sleeping)
    }
}

/// Why a parked object was made ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by `wake_one` or `wake_all`.
    Signaled,
    /// Its deadline passed.
    TimedOut,
    /// Expedited or terminated before anything happened.
    Interrupted,
}

/// Where an object may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Placed once, on the least loaded CPU.
    Any,
    /// Pinned to one CPU.
    Bound(CpuId),
}

/// The scheduler's view of a thread.
#[derive(Debug)]
pub(crate) struct SchedulerObject {
    pub(crate) id: ThreadId,
    pub(crate) state: ObjectState,
    pub(crate) flags: ThreadFlags,
    pub(crate) cpu: CpuId,
    pub(crate) level: usize,
    pub(crate) time_slice: u64,
    pub(crate) slice_left: u64,
    /// Milliseconds of CPU time charged so far.
    pub(crate) runtime: u64,
    pub(crate) memory_space: u64,
    pub(crate) wait_queue: Option<Arc<WaitQueue>>,
    pub(crate) deadline: Option<u64>,
    pub(crate) wake_reason: Option<WakeReason>,
}

impl SchedulerObject {
    pub(crate) fn new(
        id: ThreadId,
        flags: ThreadFlags,
        cpu: CpuId,
        level: usize,
        time_slice: u64,
        memory_space: u64,
    ) -> Self {
        SchedulerObject {
            id,
            state: ObjectState::Created,
            flags,
            cpu,
            level,
            time_slice,
            slice_left: time_slice,
            runtime: 0,
            memory_space,
            wait_queue: None,
            deadline: None,
            wake_reason: None,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub(crate) fn is_time_critical(&self) -> bool {
        self.flags.contains(ThreadFlags::TIME_CRITICAL)
    }

    /// Applies `event`, panicking on a transition the state machine lacks.
    pub(crate) fn transition(&mut self, event: Event) -> ObjectState {
        let previous = self.state;
        match previous.on(event) {
            Some(next) => {
                self.state = next;
                previous
            }
            None => panic!(
                "{}: invalid scheduler transition {:?} on {:?}",
                self.id, previous, event
            ),
        }
    }
}
