//! Multilevel feedback queue scheduler.
//!
//! Every CPU owns 61 ready queues. Level 60 holds time-critical objects and
//! is always served first; levels 0 to 59 are feedback levels where an
//! object that burns its whole slice drops one level and gets a slice 2 ms
//! longer. Blocking or yielding early keeps the level. Every boost interval
//! all feedback objects of a CPU return to level 0, which bounds starvation.
//!
//! All scheduler state sits behind one [`IrqSpinLock`]. Work that must not
//! happen under it (resuming threads, IPIs, timer and address-space
//! programming) is collected while locked and carried out afterwards.
//!
//! Objects are placed on a CPU once, when created. There is no
//! work-stealing: an idle CPU does not pull from a busy one.

mod object;
mod queue;
mod waitlist;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use vali_common::{CpuId, OsError, OsResult, SleepResult, ThreadFlags, ThreadId};
use vali_hal::Platform;

use crate::config::{SchedulerConfig, LOWEST_LEVEL, TIME_CRITICAL_LEVEL};
use crate::sync::irq::IrqSpinLock;

use object::{Event, SchedulerObject};
pub use object::{Affinity, ObjectState, WakeReason};
pub use queue::CpuStats;
use queue::RunQueue;
use waitlist::WaitQueue;
pub use waitlist::WaitList;

/// Outcome of [`Scheduler::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Object the CPU should run now.
    pub next: ThreadId,
    /// `next` is the CPU's idle object.
    pub is_idle: bool,
    /// Milliseconds until the timer must fire again; `None` disables it.
    pub deadline: Option<u64>,
}

/// Threads to resume and CPUs to kick once the scheduler lock is released.
#[derive(Default)]
struct Wakeups {
    resumed: Vec<ThreadId>,
    ipis: Vec<CpuId>,
}

struct SchedulerState {
    objects: BTreeMap<ThreadId, SchedulerObject>,
    cpus: Vec<RunQueue>,
}

/// The per-system scheduler.
pub struct Scheduler {
    platform: Arc<dyn Platform>,
    config: SchedulerConfig,
    next_id: AtomicU64,
    state: IrqSpinLock<SchedulerState>,
}

impl Scheduler {
    /// Creates the scheduler with one run queue and one idle object per CPU.
    pub fn new(platform: Arc<dyn Platform>, config: SchedulerConfig) -> OsResult<Self> {
        config.validate()?;
        let count = config.cpu_count as usize;
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(count)
            .map_err(|_| OsError::OutOfMemory)?;
        let mut objects = BTreeMap::new();
        for index in 0..config.cpu_count {
            let id = ThreadId(u64::from(index) + 1);
            let mut idle = SchedulerObject::new(
                id,
                ThreadFlags::IDLE | ThreadFlags::BOUND | ThreadFlags::KERNEL,
                CpuId(index),
                LOWEST_LEVEL,
                config.slice_for(LOWEST_LEVEL),
                0,
            );
            idle.transition(Event::Start);
            objects.insert(id, idle);
            cpus.push(RunQueue::new(id));
        }
        log::info!("scheduler: {} cpu(s), {} levels", count, TIME_CRITICAL_LEVEL + 1);
        Ok(Scheduler {
            state: IrqSpinLock::new(platform.clone(), SchedulerState { objects, cpus }),
            platform,
            config,
            next_id: AtomicU64::new(u64::from(config.cpu_count) + 1),
        })
    }

    /// The configuration the scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The platform the scheduler drives.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Number of CPUs with a run queue.
    pub fn cpu_count(&self) -> u32 {
        self.config.cpu_count
    }

    /// Current time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.platform.now_ms()
    }

    /// Absolute deadline `ms` milliseconds from now.
    pub fn deadline_after(&self, ms: u64) -> u64 {
        self.now_ms().saturating_add(ms)
    }

    /// Creates a Ready scheduler object and queues it.
    ///
    /// Shorthand for [`prepare_object`](Self::prepare_object) followed by
    /// [`start`](Self::start).
    pub fn create_object(
        &self,
        flags: ThreadFlags,
        affinity: Affinity,
        memory_space: u64,
    ) -> OsResult<ThreadId> {
        let id = self.prepare_object(flags, affinity, memory_space)?;
        self.start(id)?;
        Ok(id)
    }

    /// Creates a scheduler object and places it on a CPU without queuing
    /// it. The object stays [`ObjectState::Created`] until
    /// [`start`](Self::start), so no CPU can select it before its context
    /// exists.
    ///
    /// Time-critical objects start on the top level, everything else on
    /// level 0. `Affinity::Any` together with [`ThreadFlags::BOUND`] binds
    /// the object to the calling CPU.
    pub fn prepare_object(
        &self,
        flags: ThreadFlags,
        affinity: Affinity,
        memory_space: u64,
    ) -> OsResult<ThreadId> {
        if flags.contains(ThreadFlags::IDLE) {
            return Err(OsError::InvalidParameters);
        }
        let mut flags = flags;
        let mut state = self.state.lock();
        let cpu = match affinity {
            Affinity::Bound(cpu) => {
                flags |= ThreadFlags::BOUND;
                cpu
            }
            Affinity::Any if flags.contains(ThreadFlags::BOUND) => {
                CpuId(self.platform.current_cpu())
            }
            Affinity::Any => state.least_loaded(),
        };
        if cpu.index() >= state.cpus.len() {
            return Err(OsError::InvalidParameters);
        }
        let level = if flags.contains(ThreadFlags::TIME_CRITICAL) {
            TIME_CRITICAL_LEVEL
        } else {
            0
        };
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = SchedulerObject::new(
            id,
            flags,
            cpu,
            level,
            self.config.slice_for(level),
            memory_space,
        );
        state.cpus[cpu.index()].bandwidth += object.time_slice;
        state.objects.insert(id, object);
        drop(state);
        log::debug!("sched: {} created on cpu {} level {}", id, cpu.0, level);
        Ok(id)
    }

    /// Queues an object made by [`prepare_object`](Self::prepare_object).
    ///
    /// Unknown ids return `NotFound`; objects that were already started
    /// return `InvalidParameters`.
    pub fn start(&self, thread: ThreadId) -> OsResult<()> {
        let (cpu, kick) = {
            let mut guard = self.state.lock();
            let SchedulerState { objects, cpus } = &mut *guard;
            let object = objects.get_mut(&thread).ok_or(OsError::NotFound)?;
            if object.state != ObjectState::Created {
                return Err(OsError::InvalidParameters);
            }
            object.transition(Event::Start);
            let queue = &mut cpus[object.cpu.index()];
            queue.push(object.level, thread);
            (object.cpu, queue.is_idle())
        };
        log::trace!("sched: {} started", thread);
        if kick {
            self.kick(cpu);
        }
        Ok(())
    }

    /// Removes an object from every queue and forgets it.
    ///
    /// Returns `false` if the object was already gone. A thread suspended in
    /// [`block`](Self::block) or [`sleep`](Self::sleep) returns with
    /// [`WakeReason::Interrupted`].
    pub fn terminate(&self, thread: ThreadId) -> bool {
        {
            let mut guard = self.state.lock();
            let SchedulerState { objects, cpus } = &mut *guard;
            let Some(object) = objects.get_mut(&thread) else {
                return false;
            };
            assert!(!object.is_idle(), "{}: idle objects cannot terminate", thread);
            let previous = object.transition(Event::Terminate);
            let queue = &mut cpus[object.cpu.index()];
            match previous {
                ObjectState::Running if queue.current == Some(thread) => queue.current = None,
                ObjectState::Ready => {
                    queue.remove(object.level, thread);
                }
                _ => {}
            }
            if let Some(wait_queue) = object.wait_queue.take() {
                wait_queue.remove(thread);
            }
            if object.deadline.take().is_some() {
                queue.sleepers.retain(|&sleeper| sleeper != thread);
            }
            queue.bandwidth = queue.bandwidth.saturating_sub(object.time_slice);
            objects.remove(&thread);
        }
        log::debug!("sched: {} terminated", thread);
        self.platform.resume(thread.as_u64());
        true
    }

    /// Runs the scheduling decision for `cpu`.
    ///
    /// `elapsed` is charged to the running object. A preemptive tick that
    /// arrives before the running object's slice is used up keeps it
    /// running. Otherwise the object is requeued (one level lower if its
    /// slice ran out) and the highest ready object is selected.
    pub fn advance(&self, cpu: CpuId, elapsed: u64, preemptive: bool) -> Advance {
        let now = self.platform.now_ms();
        let mut wakeups = Wakeups::default();
        let (advance, space) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            assert!(cpu.index() < state.cpus.len(), "advance on unknown cpu {}", cpu.0);
            state.expire(cpu, now, &mut wakeups);

            let queue = &mut state.cpus[cpu.index()];
            queue.since_boost += elapsed;
            let boost = queue.since_boost >= self.config.boost_interval_ms;
            if let Some(current) = queue.current {
                if let Some(object) = state.objects.get_mut(&current) {
                    object.runtime += elapsed;
                }
            }
            if boost {
                state.boost(cpu, &self.config);
            }
            state.select(cpu, elapsed, preemptive, now, &self.config)
        };

        if let Some(space) = space {
            self.platform.switch_memory_space(cpu.0, space);
        }
        self.platform.reprogram(cpu.0, advance.deadline);
        self.deliver(wakeups);
        log::trace!(
            "sched: cpu {} runs {} (idle: {}, deadline: {:?})",
            cpu.0,
            advance.next,
            advance.is_idle,
            advance.deadline
        );
        advance
    }

    /// Parks `thread` on `list` until it is woken, expedited, or `deadline`
    /// (absolute, in milliseconds) passes.
    pub fn block(&self, list: &WaitList, thread: ThreadId, deadline: Option<u64>) -> WakeReason {
        self.state
            .lock()
            .park(thread, Event::Block, Some(&list.queue), deadline);
        log::trace!("sched: {} blocked (deadline {:?})", thread, deadline);
        self.suspend(thread)
    }

    /// Like [`block`](Self::block), but evaluates `condition` inside the
    /// scheduler critical section first and returns `None` without blocking
    /// when it is false.
    ///
    /// A waker that changes the condition and then calls
    /// [`wake_one`](Self::wake_one) can never slip between the check and the
    /// enqueue.
    pub fn block_if<F>(
        &self,
        list: &WaitList,
        thread: ThreadId,
        deadline: Option<u64>,
        condition: F,
    ) -> Option<WakeReason>
    where
        F: FnOnce() -> bool,
    {
        {
            let mut state = self.state.lock();
            if !condition() {
                return None;
            }
            state.park(thread, Event::Block, Some(&list.queue), deadline);
        }
        log::trace!("sched: {} blocked (deadline {:?})", thread, deadline);
        Some(self.suspend(thread))
    }

    /// Puts `thread` to sleep for `duration_ms`.
    pub fn sleep(&self, thread: ThreadId, duration_ms: u64) -> SleepResult {
        if duration_ms == 0 {
            self.yield_now(thread);
            return SleepResult::Ok;
        }
        let deadline = self.deadline_after(duration_ms);
        self.state
            .lock()
            .park(thread, Event::Sleep, None, Some(deadline));
        match self.suspend(thread) {
            WakeReason::TimedOut => SleepResult::Ok,
            WakeReason::Signaled | WakeReason::Interrupted => SleepResult::Interrupted,
        }
    }

    /// Wakes the longest waiting thread on `list`.
    pub fn wake_one(&self, list: &WaitList) -> Option<ThreadId> {
        let mut wakeups = Wakeups::default();
        let woken = {
            let mut state = self.state.lock();
            loop {
                let id = list.queue.pop()?;
                if state.unpark(id, WakeReason::Signaled, &mut wakeups) {
                    break id;
                }
            }
        };
        self.deliver(wakeups);
        Some(woken)
    }

    /// Wakes every thread on `list`, in FIFO order. Returns how many woke.
    pub fn wake_all(&self, list: &WaitList) -> usize {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.state.lock();
            while let Some(id) = list.queue.pop() {
                state.unpark(id, WakeReason::Signaled, &mut wakeups);
            }
        }
        let count = wakeups.resumed.len();
        self.deliver(wakeups);
        count
    }

    /// Cuts a block or sleep short. Returns `false` if `thread` was not parked.
    pub fn expedite(&self, thread: ThreadId) -> bool {
        let mut wakeups = Wakeups::default();
        let woken = self
            .state
            .lock()
            .unpark(thread, WakeReason::Interrupted, &mut wakeups);
        self.deliver(wakeups);
        woken
    }

    /// Gives up the rest of the slice without losing the level.
    pub fn yield_now(&self, thread: ThreadId) {
        {
            let mut guard = self.state.lock();
            let SchedulerState { objects, cpus } = &mut *guard;
            let Some(object) = objects.get_mut(&thread) else {
                return;
            };
            let queue = &mut cpus[object.cpu.index()];
            match object.state {
                ObjectState::Running if !object.is_idle() => {
                    object.transition(Event::Preempt);
                    if queue.current == Some(thread) {
                        queue.current = None;
                    }
                    queue.push(object.level, thread);
                }
                ObjectState::Ready => {
                    if queue.remove(object.level, thread) {
                        queue.push(object.level, thread);
                    }
                }
                _ => {}
            }
        }
        self.platform.save_and_yield(thread.as_u64());
    }

    /// Holds `cpu` on its current object while disabled.
    pub fn set_enabled(&self, cpu: CpuId, enabled: bool) {
        if let Some(queue) = self.state.lock().cpus.get_mut(cpu.index()) {
            queue.enabled = enabled;
        }
    }

    /// State of `thread`, if it exists.
    pub fn state_of(&self, thread: ThreadId) -> Option<ObjectState> {
        self.state.lock().objects.get(&thread).map(|object| object.state)
    }

    /// Queue level of `thread`.
    pub fn level_of(&self, thread: ThreadId) -> Option<usize> {
        self.state.lock().objects.get(&thread).map(|object| object.level)
    }

    /// CPU `thread` is placed on.
    pub fn cpu_of(&self, thread: ThreadId) -> Option<CpuId> {
        self.state.lock().objects.get(&thread).map(|object| object.cpu)
    }

    /// Milliseconds of CPU time charged to `thread`.
    pub fn runtime_of(&self, thread: ThreadId) -> Option<u64> {
        self.state.lock().objects.get(&thread).map(|object| object.runtime)
    }

    /// Object currently selected on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<ThreadId> {
        self.state.lock().cpus.get(cpu.index()).and_then(|queue| queue.current)
    }

    /// Idle object of `cpu`.
    pub fn idle_object(&self, cpu: CpuId) -> Option<ThreadId> {
        self.state.lock().cpus.get(cpu.index()).map(|queue| queue.idle)
    }

    /// Number of Ready objects queued on `cpu`.
    pub fn ready_count(&self, cpu: CpuId) -> usize {
        self.state
            .lock()
            .cpus
            .get(cpu.index())
            .map_or(0, RunQueue::ready_count)
    }

    /// Bandwidth pressure of `cpu`: the summed slices of its objects.
    pub fn bandwidth(&self, cpu: CpuId) -> u64 {
        self.state
            .lock()
            .cpus
            .get(cpu.index())
            .map_or(0, |queue| queue.bandwidth)
    }

    /// Counters of `cpu`.
    pub fn stats(&self, cpu: CpuId) -> CpuStats {
        self.state
            .lock()
            .cpus
            .get(cpu.index())
            .map(|queue| queue.stats)
            .unwrap_or_default()
    }

    fn kick(&self, cpu: CpuId) {
        if cpu.0 != self.platform.current_cpu() {
            self.platform.send_ipi(cpu.0);
        }
    }

    fn deliver(&self, mut wakeups: Wakeups) {
        wakeups.ipis.sort_unstable();
        wakeups.ipis.dedup();
        for cpu in wakeups.ipis {
            self.kick(cpu);
        }
        for thread in wakeups.resumed {
            self.platform.resume(thread.as_u64());
        }
    }

    /// Yields until `thread` is no longer parked and reports why it woke.
    fn suspend(&self, thread: ThreadId) -> WakeReason {
        loop {
            {
                let mut state = self.state.lock();
                match state.objects.get_mut(&thread) {
                    Some(object) if object.state.is_parked() => {}
                    Some(object) => {
                        return object.wake_reason.take().unwrap_or(WakeReason::Signaled)
                    }
                    None => return WakeReason::Interrupted,
                }
            }
            self.platform.save_and_yield(thread.as_u64());
        }
    }
}

impl RunQueue {
    fn is_idle(&self) -> bool {
        self.current.map_or(true, |current| current == self.idle)
    }
}

fn relevel(
    object: &mut SchedulerObject,
    queue: &mut RunQueue,
    level: usize,
    config: &SchedulerConfig,
) {
    queue.bandwidth = queue.bandwidth.saturating_sub(object.time_slice);
    object.level = level;
    object.time_slice = config.slice_for(level);
    queue.bandwidth += object.time_slice;
}

impl SchedulerState {
    fn least_loaded(&self) -> CpuId {
        let index = self
            .cpus
            .iter()
            .enumerate()
            .min_by_key(|&(index, queue)| (queue.bandwidth, index))
            .map_or(0, |(index, _)| index);
        CpuId(index as u32)
    }

    fn object_mut(&mut self, thread: ThreadId) -> &mut SchedulerObject {
        match self.objects.get_mut(&thread) {
            Some(object) => object,
            None => panic!("{} is not a scheduler object", thread),
        }
    }

    /// Takes `thread` off its run queue and parks it, on `wait_queue` when
    /// blocking.
    fn park(
        &mut self,
        thread: ThreadId,
        event: Event,
        wait_queue: Option<&Arc<WaitQueue>>,
        deadline: Option<u64>,
    ) {
        let object = self.object_mut(thread);
        assert!(!object.is_idle(), "{}: idle objects cannot block", thread);
        let previous = object.transition(event);
        let (cpu, level) = (object.cpu, object.level);
        object.wake_reason = None;
        object.deadline = deadline;
        if let Some(wait_queue) = wait_queue {
            wait_queue.push(thread);
            object.wait_queue = Some(wait_queue.clone());
        }

        let queue = &mut self.cpus[cpu.index()];
        match previous {
            ObjectState::Running if queue.current == Some(thread) => queue.current = None,
            ObjectState::Ready => {
                queue.remove(level, thread);
            }
            _ => {}
        }
        if deadline.is_some() {
            queue.sleepers.push(thread);
        }
    }

    /// Requeues a parked object. Returns `false` if it was not parked.
    fn unpark(&mut self, thread: ThreadId, reason: WakeReason, wakeups: &mut Wakeups) -> bool {
        let SchedulerState { objects, cpus } = self;
        let Some(object) = objects.get_mut(&thread) else {
            return false;
        };
        if !object.state.is_parked() {
            return false;
        }
        object.transition(Event::Wake);
        if let Some(wait_queue) = object.wait_queue.take() {
            wait_queue.remove(thread);
        }
        let queue = &mut cpus[object.cpu.index()];
        if object.deadline.take().is_some() {
            queue.sleepers.retain(|&sleeper| sleeper != thread);
        }
        object.wake_reason = Some(reason);
        queue.push(object.level, thread);
        if queue.is_idle() {
            wakeups.ipis.push(object.cpu);
        }
        wakeups.resumed.push(thread);
        true
    }

    /// Wakes every sleeper of `cpu` whose deadline has passed.
    fn expire(&mut self, cpu: CpuId, now: u64, wakeups: &mut Wakeups) {
        let objects = &self.objects;
        let due: Vec<ThreadId> = self.cpus[cpu.index()]
            .sleepers
            .iter()
            .copied()
            .filter(|sleeper| {
                objects
                    .get(sleeper)
                    .and_then(|object| object.deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        for thread in due {
            self.unpark(thread, WakeReason::TimedOut, wakeups);
        }
    }

    /// Moves every feedback object of `cpu` to level 0.
    fn boost(&mut self, cpu: CpuId, config: &SchedulerConfig) {
        let SchedulerState { objects, cpus } = self;
        let queue = &mut cpus[cpu.index()];
        queue.boost();
        queue.since_boost = 0;
        queue.stats.boosts += 1;
        for object in objects
            .values_mut()
            .filter(|object| object.cpu == cpu && !object.is_idle() && !object.is_time_critical())
        {
            relevel(object, queue, 0, config);
        }
        log::debug!("sched: cpu {} boosted", cpu.0);
    }

    /// Requeues the current object if needed and picks the next one.
    /// Returns the decision and the address space to switch to, if any.
    fn select(
        &mut self,
        cpu: CpuId,
        elapsed: u64,
        preemptive: bool,
        now: u64,
        config: &SchedulerConfig,
    ) -> (Advance, Option<u64>) {
        let SchedulerState { objects, cpus } = self;
        let queue = &mut cpus[cpu.index()];
        let previous = queue.current;

        if let Some(current) = previous {
            if let Some(object) = objects.get_mut(&current) {
                let keep = object.state == ObjectState::Running
                    && !object.is_idle()
                    && (!queue.enabled || (preemptive && elapsed < object.slice_left));
                if keep {
                    object.slice_left -= elapsed.min(object.slice_left);
                    let slice_left = object.slice_left;
                    let deadline = next_deadline(objects, queue, now, Some(slice_left));
                    let advance = Advance {
                        next: current,
                        is_idle: false,
                        deadline,
                    };
                    return (advance, None);
                }
            }
        }

        if let Some(current) = queue.current.take() {
            if let Some(object) = objects.get_mut(&current) {
                if object.state == ObjectState::Running {
                    object.transition(Event::Preempt);
                    if !object.is_idle() {
                        if preemptive && elapsed >= object.slice_left {
                            queue.stats.preemptions += 1;
                            if !object.is_time_critical() && object.level < LOWEST_LEVEL {
                                let level = object.level + 1;
                                relevel(object, queue, level, config);
                            }
                        }
                        queue.push(object.level, current);
                    }
                }
            }
        }

        let (next, is_idle) = match queue.pop_next() {
            Some(next) => (next, false),
            None => (queue.idle, true),
        };
        let object = match objects.get_mut(&next) {
            Some(object) => object,
            None => panic!("cpu {}: queued {} is not a scheduler object", cpu.0, next),
        };
        object.transition(Event::Execute);
        object.slice_left = object.time_slice;
        queue.current = Some(next);
        if previous != Some(next) {
            queue.stats.context_switches += 1;
        }

        let mut space = None;
        let slice = if is_idle {
            queue.stats.idle_selections += 1;
            None
        } else {
            if queue.active_space != Some(object.memory_space) {
                queue.active_space = Some(object.memory_space);
                space = Some(object.memory_space);
            }
            Some(object.slice_left)
        };
        let deadline = next_deadline(objects, queue, now, slice);
        (
            Advance {
                next,
                is_idle,
                deadline,
            },
            space,
        )
    }
}

/// Nearest of the slice end (only relevant with competitors) and the
/// earliest sleeper deadline, relative to `now`.
fn next_deadline(
    objects: &BTreeMap<ThreadId, SchedulerObject>,
    queue: &RunQueue,
    now: u64,
    slice: Option<u64>,
) -> Option<u64> {
    let sleeper = queue
        .sleepers
        .iter()
        .filter_map(|sleeper| objects.get(sleeper).and_then(|object| object.deadline))
        .min()
        .map(|deadline| deadline.saturating_sub(now));
    let slice = slice.filter(|_| queue.has_ready());
    match (slice, sleeper) {
        (Some(slice), Some(sleeper)) => Some(slice.min(sleeper)),
        (slice, sleeper) => slice.or(sleeper),
    }
}
