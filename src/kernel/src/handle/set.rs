//! Handle sets.
//!
//! A set watches other handles. Marking a watched handle with some
//! [`IoEvents`] queues an event on every set whose interest overlaps them,
//! and a thread waiting on the set wakes up to collect it. Flags marked on
//! the same member coalesce until they are collected, so a member is queued
//! at most once.
//!
//! [`HandleSets`] keeps the reverse index from watched handle to the sets
//! watching it. It holds the sets weakly; a set's own handle keeps it alive.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use vali_common::{HandleId, HandleType, IoEvents, OsError, OsResult, ThreadId};

use super::{Destructible, HandleTable};
use crate::sched::{Scheduler, WaitList, WakeReason};

/// An event delivered by [`HandleSet::wait`], or the interest passed to
/// [`HandleSets::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEvent {
    /// Interest on input, fired events on output.
    pub events: IoEvents,
    /// Opaque value chosen when the member was added.
    pub context: u64,
}

/// Operation of [`HandleSets::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetControl {
    /// Start watching a handle.
    Add,
    /// Change interest and context of a member.
    Modify,
    /// Stop watching a handle.
    Remove,
}

struct Member {
    interest: IoEvents,
    context: u64,
    active: IoEvents,
}

#[derive(Default)]
struct Members {
    members: BTreeMap<HandleId, Member>,
    ready: VecDeque<HandleId>,
}

/// Members of one set and the events waiting to be collected.
pub struct HandleSet {
    sched: Arc<Scheduler>,
    state: spin::Mutex<Members>,
    waiters: WaitList,
    closed: AtomicBool,
}

impl HandleSet {
    /// Creates an empty set.
    pub fn new(sched: Arc<Scheduler>) -> Self {
        HandleSet {
            sched,
            state: spin::Mutex::new(Members::default()),
            waiters: WaitList::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of watched handles.
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Returns `true` if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members with events waiting to be collected.
    pub fn pending(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Blocks `caller` until at least one member fired, then collects up to
    /// `max` of them in the order they fired.
    ///
    /// A timeout of zero waits forever. Fails with `Timeout` when the time
    /// runs out, `Interrupted` when `caller` is expedited and `NotFound`
    /// once the set is gone.
    pub fn wait(&self, caller: ThreadId, max: usize, timeout_ms: u64) -> OsResult<Vec<SetEvent>> {
        if max == 0 {
            return Err(OsError::InvalidParameters);
        }
        let deadline = match timeout_ms {
            0 => None,
            ms => Some(self.sched.deadline_after(ms)),
        };
        loop {
            self.check_open()?;
            let (events, more) = self.collect(max);
            if !events.is_empty() {
                if more {
                    self.sched.wake_one(&self.waiters);
                }
                return Ok(events);
            }
            let woke = self.sched.block_if(&self.waiters, caller, deadline, || {
                !self.is_closed() && self.state.lock().ready.is_empty()
            });
            match woke {
                Some(WakeReason::TimedOut) => return Err(OsError::Timeout),
                Some(WakeReason::Interrupted) => return Err(OsError::Interrupted),
                _ => {}
            }
        }
    }

    fn insert(&self, handle: HandleId, event: SetEvent) -> OsResult<()> {
        let mut state = self.state.lock();
        if state.members.contains_key(&handle) {
            return Err(OsError::InvalidParameters);
        }
        state.members.insert(
            handle,
            Member {
                interest: event.events,
                context: event.context,
                active: IoEvents::empty(),
            },
        );
        Ok(())
    }

    fn modify(&self, handle: HandleId, event: SetEvent) -> OsResult<()> {
        let mut state = self.state.lock();
        let member = state.members.get_mut(&handle).ok_or(OsError::NotFound)?;
        member.interest = event.events;
        member.context = event.context;
        Ok(())
    }

    fn remove(&self, handle: HandleId) -> OsResult<()> {
        let mut state = self.state.lock();
        state.members.remove(&handle).ok_or(OsError::NotFound)?;
        state.ready.retain(|&ready| ready != handle);
        Ok(())
    }

    /// Fires `flags` on member `handle`. Returns `true` if the set listens
    /// for any of them.
    fn signal(&self, handle: HandleId, flags: IoEvents) -> bool {
        let queued = {
            let mut state = self.state.lock();
            let Some(member) = state.members.get_mut(&handle) else {
                return false;
            };
            let accepted = member.interest & flags;
            if accepted.is_empty() {
                return false;
            }
            let idle = member.active.is_empty();
            member.active |= accepted;
            if idle {
                state.ready.push_back(handle);
            }
            idle
        };
        if queued {
            self.sched.wake_one(&self.waiters);
        }
        true
    }

    fn collect(&self, max: usize) -> (Vec<SetEvent>, bool) {
        let mut state = self.state.lock();
        let Members { members, ready } = &mut *state;
        let mut events = Vec::new();
        while events.len() < max {
            let Some(handle) = ready.pop_front() else {
                break;
            };
            if let Some(member) = members.get_mut(&handle) {
                events.push(SetEvent {
                    events: core::mem::replace(&mut member.active, IoEvents::empty()),
                    context: member.context,
                });
            }
        }
        (events, !ready.is_empty())
    }

    /// Forgets every member and releases all waiters. Returns the handles
    /// that were watched.
    fn close(&self) -> Vec<HandleId> {
        self.closed.store(true, Ordering::Release);
        let members = {
            let mut state = self.state.lock();
            state.ready.clear();
            core::mem::take(&mut state.members)
        };
        self.sched.wake_all(&self.waiters);
        members.into_keys().collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> OsResult<()> {
        if self.is_closed() {
            return Err(OsError::NotFound);
        }
        Ok(())
    }
}

type Watchers = spin::Mutex<BTreeMap<HandleId, Vec<Weak<HandleSet>>>>;

/// All handle sets of the system and the handles they watch.
pub struct HandleSets {
    sched: Arc<Scheduler>,
    handles: Arc<HandleTable>,
    watchers: Arc<Watchers>,
}

impl HandleSets {
    /// Creates the registry on top of `handles`.
    pub fn new(sched: Arc<Scheduler>, handles: Arc<HandleTable>) -> Self {
        HandleSets {
            sched,
            handles,
            watchers: Arc::new(spin::Mutex::new(BTreeMap::new())),
        }
    }

    /// Creates an empty set behind a new handle. Destroying the handle
    /// stops the set watching anything and releases its waiters.
    pub fn create(&self) -> OsResult<HandleId> {
        let set = Arc::new(HandleSet::new(self.sched.clone()));
        let watchers = self.watchers.clone();
        let closing = set.clone();
        let destructor: Box<dyn Destructible> = Box::new(move || {
            for handle in closing.close() {
                unwatch(&watchers, handle, &closing);
            }
        });
        let id = self
            .handles
            .create(HandleType::Set, Some(set), Some(destructor))?;
        log::debug!("handle set: created {}", id);
        Ok(id)
    }

    /// Adds, changes or removes the member `handle` of `set`.
    ///
    /// `Add` and `Modify` need `event`; adding a member twice fails with
    /// `InvalidParameters` and touching a missing one with `NotFound`.
    pub fn control(
        &self,
        set: HandleId,
        op: SetControl,
        handle: HandleId,
        event: Option<SetEvent>,
    ) -> OsResult<()> {
        let target = self.lookup(set)?;
        match op {
            SetControl::Add => {
                let event = event.ok_or(OsError::InvalidParameters)?;
                self.handles.kind_of(handle)?;
                target.insert(handle, event)?;
                self.watchers
                    .lock()
                    .entry(handle)
                    .or_default()
                    .push(Arc::downgrade(&target));
            }
            SetControl::Modify => {
                let event = event.ok_or(OsError::InvalidParameters)?;
                target.modify(handle, event)?;
            }
            SetControl::Remove => {
                target.remove(handle)?;
                unwatch(&self.watchers, handle, &target);
            }
        }
        log::trace!("handle set: {} {:?} {}", set, op, handle);
        Ok(())
    }

    /// Waits on `set`; see [`HandleSet::wait`].
    pub fn wait(
        &self,
        caller: ThreadId,
        set: HandleId,
        max: usize,
        timeout_ms: u64,
    ) -> OsResult<Vec<SetEvent>> {
        self.lookup(set)?.wait(caller, max, timeout_ms)
    }

    /// Fires `flags` on `handle` in every set watching it and returns how
    /// many sets were interested. `NotFound` if no set watches `handle`.
    pub fn mark(&self, handle: HandleId, flags: IoEvents) -> OsResult<usize> {
        let sets: Vec<Arc<HandleSet>> = {
            let watchers = self.watchers.lock();
            let watching = watchers.get(&handle).ok_or(OsError::NotFound)?;
            watching.iter().filter_map(Weak::upgrade).collect()
        };
        Ok(sets
            .iter()
            .filter(|set| set.signal(handle, flags))
            .count())
    }

    /// Number of sets watching `handle`.
    pub fn watcher_count(&self, handle: HandleId) -> usize {
        self.watchers.lock().get(&handle).map_or(0, Vec::len)
    }

    fn lookup(&self, set: HandleId) -> OsResult<Arc<HandleSet>> {
        self.handles.lookup_as(set, HandleType::Set)
    }
}

fn unwatch(watchers: &Watchers, handle: HandleId, set: &Arc<HandleSet>) {
    let mut watchers = watchers.lock();
    if let Some(watching) = watchers.get_mut(&handle) {
        let set = Arc::downgrade(set);
        watching.retain(|watcher| !watcher.ptr_eq(&set) && watcher.strong_count() > 0);
        if watching.is_empty() {
            watchers.remove(&handle);
        }
    }
}
