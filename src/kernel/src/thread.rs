//! Kernel threads on top of scheduler objects.
//!
//! The scheduler only knows scheduling state. This table adds what a thread
//! needs beyond that: a name, its parent, its exit code and the list of
//! threads joining it. Records outlive their scheduler object until they
//! are reaped, so joiners that arrive late still see the exit code.
//!
//! Scheduler calls are never made with the table lock held: join evaluates
//! its wait condition under the scheduler lock, and that condition takes
//! the table lock.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use vali_common::{OsError, OsResult, SleepResult, ThreadFlags, ThreadId};
use vali_hal::ThreadEntry;

use crate::sched::{Affinity, ObjectState, Scheduler, WaitList, WakeReason};

struct ThreadRecord {
    name: String,
    parent: Option<ThreadId>,
    flags: ThreadFlags,
    memory_space: u64,
    exit_code: Option<i32>,
    detached: bool,
    joiners: WaitList,
}

/// Snapshot of a thread's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Thread id.
    pub id: ThreadId,
    /// Name given at creation.
    pub name: String,
    /// Creating thread, if any.
    pub parent: Option<ThreadId>,
    /// Creation flags.
    pub flags: ThreadFlags,
    /// Exit code once the thread has exited.
    pub exit_code: Option<i32>,
    /// Whether the thread was detached.
    pub detached: bool,
}

/// All threads of the system.
pub struct ThreadTable {
    sched: Arc<Scheduler>,
    threads: spin::Mutex<BTreeMap<ThreadId, ThreadRecord>>,
}

impl ThreadTable {
    /// Creates an empty table.
    pub fn new(sched: Arc<Scheduler>) -> Self {
        ThreadTable {
            sched,
            threads: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Creates a thread that starts at `entry(arg)`.
    ///
    /// The thread inherits its parent's address space and only becomes
    /// runnable once its record and context exist. It is placed like any
    /// scheduler object: [`ThreadFlags::BOUND`] pins it to the calling CPU
    /// and [`ThreadFlags::TIME_CRITICAL`] starts it on the top level.
    pub fn create(
        &self,
        name: &str,
        entry: ThreadEntry,
        arg: usize,
        flags: ThreadFlags,
        parent: Option<ThreadId>,
    ) -> OsResult<ThreadId> {
        let memory_space = match parent {
            Some(parent) => self.with_record(parent, |record| record.memory_space)?,
            None => 0,
        };
        let id = self
            .sched
            .prepare_object(flags, Affinity::Any, memory_space)?;
        self.threads.lock().insert(
            id,
            ThreadRecord {
                name: String::from(name),
                parent,
                flags,
                memory_space,
                exit_code: None,
                detached: false,
                joiners: WaitList::new(),
            },
        );
        self.sched
            .platform()
            .prepare_context(id.as_u64(), entry, arg);
        self.sched.start(id)?;
        log::debug!("thread: created {} '{}'", id, name);
        Ok(id)
    }

    /// Terminates `id` with `code` and wakes everyone joining it.
    ///
    /// A detached thread is forgotten right away. When `id` is the calling
    /// thread, the platform never resumes it.
    pub fn exit(&self, id: ThreadId, code: i32) -> OsResult<()> {
        let (joiners, detached) = {
            let mut threads = self.threads.lock();
            let record = threads
                .get_mut(&id)
                .filter(|record| record.exit_code.is_none())
                .ok_or(OsError::NotFound)?;
            record.exit_code = Some(code);
            (record.joiners.clone(), record.detached)
        };
        self.sched.terminate(id);
        let woken = self.sched.wake_all(&joiners);
        if detached {
            self.threads.lock().remove(&id);
        }
        log::debug!("thread: {} exited with {} ({} joiner(s))", id, code, woken);
        Ok(())
    }

    /// Blocks `caller` until `id` exits and returns its exit code.
    pub fn join(&self, caller: ThreadId, id: ThreadId) -> OsResult<i32> {
        if caller == id {
            return Err(OsError::InvalidParameters);
        }
        loop {
            let joiners = {
                let threads = self.threads.lock();
                let record = threads
                    .get(&id)
                    .filter(|record| !record.detached)
                    .ok_or(OsError::NotFound)?;
                if let Some(code) = record.exit_code {
                    return Ok(code);
                }
                record.joiners.clone()
            };
            let woke = self.sched.block_if(&joiners, caller, None, || {
                self.threads
                    .lock()
                    .get(&id)
                    .is_some_and(|record| !record.detached && record.exit_code.is_none())
            });
            if woke == Some(WakeReason::Interrupted) {
                return Err(OsError::Interrupted);
            }
        }
    }

    /// Detaches `id`; its record goes away as soon as it exits and joiners
    /// get `NotFound`. Only the thread itself or its parent may detach it.
    pub fn detach(&self, caller: ThreadId, id: ThreadId) -> OsResult<()> {
        let joiners = {
            let mut threads = self.threads.lock();
            let record = threads.get_mut(&id).ok_or(OsError::NotFound)?;
            if caller != id && record.parent != Some(caller) {
                log::warn!("thread: {} may not detach {}", caller, id);
                return Err(OsError::InvalidParameters);
            }
            if record.exit_code.is_some() {
                threads.remove(&id);
                return Ok(());
            }
            record.detached = true;
            record.joiners.clone()
        };
        self.sched.wake_all(&joiners);
        Ok(())
    }

    /// Sleeps the calling thread `id`. Zero yields.
    pub fn sleep(&self, id: ThreadId, duration_ms: u64) -> SleepResult {
        self.sched.sleep(id, duration_ms)
    }

    /// Gives up the rest of the calling thread's slice.
    pub fn yield_now(&self, id: ThreadId) {
        self.sched.yield_now(id)
    }

    /// Cuts a sleep or wait of `id` short. Returns whether it was waiting.
    pub fn interrupt(&self, id: ThreadId) -> OsResult<bool> {
        self.with_record(id, |_| ())?;
        Ok(self.sched.expedite(id))
    }

    /// Scheduling state of `id`; exited threads report `Terminated`.
    pub fn state(&self, id: ThreadId) -> Option<ObjectState> {
        let exited = self.with_record(id, |record| record.exit_code.is_some()).ok()?;
        if exited {
            return Some(ObjectState::Terminated);
        }
        self.sched.state_of(id)
    }

    /// Bookkeeping snapshot of `id`.
    pub fn info(&self, id: ThreadId) -> OsResult<ThreadInfo> {
        self.with_record(id, |record| ThreadInfo {
            id,
            name: record.name.clone(),
            parent: record.parent,
            flags: record.flags,
            exit_code: record.exit_code,
            detached: record.detached,
        })
    }

    /// Address space `id` runs in.
    pub fn memory_space(&self, id: ThreadId) -> OsResult<u64> {
        self.with_record(id, |record| record.memory_space)
    }

    /// Forgets an exited thread and returns its exit code.
    pub fn reap(&self, id: ThreadId) -> OsResult<i32> {
        let mut threads = self.threads.lock();
        let code = threads
            .get(&id)
            .ok_or(OsError::NotFound)?
            .exit_code
            .ok_or(OsError::Busy)?;
        threads.remove(&id);
        Ok(code)
    }

    /// Ids of every known thread.
    pub fn ids(&self) -> Vec<ThreadId> {
        self.threads.lock().keys().copied().collect()
    }

    fn with_record<T>(&self, id: ThreadId, f: impl FnOnce(&ThreadRecord) -> T) -> OsResult<T> {
        self.threads.lock().get(&id).map(f).ok_or(OsError::NotFound)
    }
}
