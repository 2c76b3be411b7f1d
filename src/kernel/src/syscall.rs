//! Typed system call surface.
//!
//! Each call takes the calling thread explicitly. Objects userspace creates
//! are reached through handles; a handle of the wrong type is rejected with
//! `InvalidParameters` and a dead one with `NotFound`. Status codes cross
//! the user boundary as [`OsError::code`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicI32;

use vali_common::{
    HandleId, HandleType, IoEvents, MutexFlags, OsError, OsResult, SleepResult, ThreadFlags,
    ThreadId,
};
use vali_hal::ThreadEntry;

use crate::context::KernelContext;
use crate::handle::{Destructible, SetControl, SetEvent};
use crate::pipe::Pipe;
use crate::sync::{FutexOp, Mutex, TimedMutex};

/// A mutex created through [`KernelContext::mutex_create`].
pub enum MutexObject {
    /// Created without [`MutexFlags::TIMED`].
    Plain(Mutex),
    /// Created with [`MutexFlags::TIMED`].
    Timed(TimedMutex),
}

impl MutexObject {
    fn owner(&self) -> Option<ThreadId> {
        match self {
            MutexObject::Plain(mutex) => mutex.owner(),
            MutexObject::Timed(mutex) => mutex.owner(),
        }
    }

    fn flags(&self) -> MutexFlags {
        match self {
            MutexObject::Plain(mutex) => mutex.flags(),
            MutexObject::Timed(mutex) => mutex.flags(),
        }
    }

    fn lock(&self, caller: ThreadId) -> OsResult<()> {
        match self {
            MutexObject::Plain(mutex) => mutex.lock(caller),
            MutexObject::Timed(mutex) => mutex.lock(caller),
        }
    }

    fn try_lock(&self, caller: ThreadId) -> bool {
        match self {
            MutexObject::Plain(mutex) => mutex.try_lock(caller),
            MutexObject::Timed(mutex) => mutex.try_lock(caller),
        }
    }

    fn unlock(&self, caller: ThreadId) {
        match self {
            MutexObject::Plain(mutex) => mutex.unlock(caller),
            MutexObject::Timed(mutex) => mutex.unlock(caller),
        }
    }

    /// A non-recursive mutex its owner locks again would never be released.
    fn check_relock(&self, caller: ThreadId) -> OsResult<()> {
        if self.owner() == Some(caller) && !self.flags().contains(MutexFlags::RECURSIVE) {
            log::warn!("syscall: {} relocked a non-recursive mutex", caller);
            return Err(OsError::Busy);
        }
        Ok(())
    }
}

impl KernelContext {
    /// Starts a thread at `entry(arg)` as a child of `caller`.
    pub fn thread_create(
        &self,
        caller: ThreadId,
        name: &str,
        entry: ThreadEntry,
        arg: usize,
        flags: ThreadFlags,
    ) -> OsResult<ThreadId> {
        if flags.contains(ThreadFlags::IDLE) {
            return Err(OsError::InvalidParameters);
        }
        self.threads().create(name, entry, arg, flags, Some(caller))
    }

    /// Ends the calling thread.
    pub fn thread_exit(&self, caller: ThreadId, code: i32) -> OsResult<()> {
        self.threads().exit(caller, code)
    }

    /// Sleeps the calling thread.
    pub fn thread_sleep(&self, caller: ThreadId, duration_ms: u64) -> SleepResult {
        self.threads().sleep(caller, duration_ms)
    }

    /// Yields the calling thread.
    pub fn thread_yield(&self, caller: ThreadId) {
        self.threads().yield_now(caller)
    }

    /// Waits for `thread` to exit, returns its exit code and forgets it.
    pub fn thread_join(&self, caller: ThreadId, thread: ThreadId) -> OsResult<i32> {
        let code = self.threads().join(caller, thread)?;
        // Another joiner may have reaped it already.
        let _ = self.threads().reap(thread);
        Ok(code)
    }

    /// Detaches `thread`.
    pub fn thread_detach(&self, caller: ThreadId, thread: ThreadId) -> OsResult<()> {
        self.threads().detach(caller, thread)
    }

    /// Cuts a sleep or wait of `thread` short.
    pub fn thread_interrupt(&self, thread: ThreadId) -> OsResult<()> {
        self.threads().interrupt(thread).map(|_| ())
    }

    /// Creates a mutex; [`MutexFlags::TIMED`] selects the timed variant.
    pub fn mutex_create(&self, flags: MutexFlags) -> OsResult<HandleId> {
        let sched = self.scheduler().clone();
        let mutex = if flags.contains(MutexFlags::TIMED) {
            MutexObject::Timed(TimedMutex::new(sched, flags))
        } else {
            MutexObject::Plain(Mutex::new(sched, flags))
        };
        self.handles()
            .create(HandleType::Mutex, Some(Arc::new(mutex)), None)
    }

    /// Blocks until `caller` owns the mutex.
    pub fn mutex_lock(&self, caller: ThreadId, handle: HandleId) -> OsResult<()> {
        let mutex = self.mutex(handle)?;
        mutex.check_relock(caller)?;
        mutex.lock(caller)
    }

    /// Takes the mutex if it is free; `Busy` otherwise.
    pub fn mutex_try_lock(&self, caller: ThreadId, handle: HandleId) -> OsResult<()> {
        let mutex = self.mutex(handle)?;
        if mutex.try_lock(caller) {
            Ok(())
        } else {
            Err(OsError::Busy)
        }
    }

    /// Locks a timed mutex, giving up after `timeout_ms` (zero waits forever).
    pub fn mutex_timed_lock(
        &self,
        caller: ThreadId,
        handle: HandleId,
        timeout_ms: u64,
    ) -> OsResult<()> {
        let mutex = self.mutex(handle)?;
        mutex.check_relock(caller)?;
        match &*mutex {
            MutexObject::Timed(mutex) => mutex.timed_lock(caller, timeout_ms),
            MutexObject::Plain(_) => Err(OsError::NotSupported),
        }
    }

    /// Releases one level of ownership.
    pub fn mutex_unlock(&self, caller: ThreadId, handle: HandleId) -> OsResult<()> {
        let mutex = self.mutex(handle)?;
        if mutex.owner() != Some(caller) {
            log::warn!("syscall: {} unlocked a mutex it does not own", caller);
            return Err(OsError::InvalidParameters);
        }
        mutex.unlock(caller);
        Ok(())
    }

    /// Adds a reference to `handle`.
    pub fn handle_acquire(&self, handle: HandleId) -> OsResult<()> {
        self.handles().acquire(handle)
    }

    /// Drops a reference to `handle`.
    pub fn handle_destroy(&self, handle: HandleId) -> OsResult<()> {
        self.handles().destroy(handle)
    }

    /// Publishes `handle` under `path`.
    pub fn handle_register_path(&self, handle: HandleId, path: &str) -> OsResult<()> {
        self.handles().register_path(handle, path)
    }

    /// Resolves a published path.
    pub fn handle_lookup_by_path(&self, path: &str) -> OsResult<HandleId> {
        self.handles().lookup_by_path(path)
    }

    /// Creates an empty handle set.
    pub fn handle_set_create(&self) -> OsResult<HandleId> {
        self.handle_sets().create()
    }

    /// Adds, changes or removes a member of a handle set.
    pub fn handle_set_control(
        &self,
        set: HandleId,
        op: SetControl,
        handle: HandleId,
        event: Option<SetEvent>,
    ) -> OsResult<()> {
        self.handle_sets().control(set, op, handle, event)
    }

    /// Waits for up to `max` events on a handle set; zero waits forever.
    pub fn handle_set_wait(
        &self,
        caller: ThreadId,
        set: HandleId,
        max: usize,
        timeout_ms: u64,
    ) -> OsResult<Vec<SetEvent>> {
        self.handle_sets().wait(caller, set, max, timeout_ms)
    }

    /// Fires `flags` on `handle` in every set watching it.
    pub fn handle_mark(&self, handle: HandleId, flags: IoEvents) -> OsResult<usize> {
        self.handle_sets().mark(handle, flags)
    }

    /// Creates a pipe; a capacity of zero uses the configured default.
    pub fn pipe_create(&self, capacity: usize) -> OsResult<HandleId> {
        let capacity = match capacity {
            0 => self.config().pipe_capacity,
            capacity => capacity,
        };
        let pipe = Arc::new(Pipe::new(self.scheduler().clone(), capacity)?);
        let closer = pipe.clone();
        let destructor: Box<dyn Destructible> = Box::new(move || closer.destroy());
        self.handles()
            .create(HandleType::Pipe, Some(pipe), Some(destructor))
    }

    /// Reads from a pipe; see [`Pipe::read`]. A consuming read fires
    /// [`IoEvents::OUT`] on the pipe's handle.
    pub fn pipe_read(
        &self,
        caller: ThreadId,
        handle: HandleId,
        dst: &mut [u8],
        peek: bool,
    ) -> OsResult<usize> {
        let read = self.pipe(handle)?.read(caller, dst, peek)?;
        if !peek && read > 0 {
            self.notify(handle, IoEvents::OUT);
        }
        Ok(read)
    }

    /// Writes to a pipe; see [`Pipe::write`]. Fires [`IoEvents::IN`] on the
    /// pipe's handle.
    pub fn pipe_write(&self, caller: ThreadId, handle: HandleId, src: &[u8]) -> OsResult<usize> {
        let written = self.pipe(handle)?.write(caller, src)?;
        if written > 0 {
            self.notify(handle, IoEvents::IN);
        }
        Ok(written)
    }

    /// Blocks `caller` while `*word == expected`.
    pub fn futex_wait(
        &self,
        caller: ThreadId,
        word: &AtomicI32,
        expected: i32,
        timeout_ms: Option<u64>,
    ) -> OsResult<()> {
        let space = self.threads().memory_space(caller)?;
        self.futexes()
            .wait(caller, space, word, expected, timeout_ms)
    }

    /// Wakes up to `count` waiters of `word`.
    pub fn futex_wake(&self, caller: ThreadId, word: &AtomicI32, count: usize) -> OsResult<usize> {
        let space = self.threads().memory_space(caller)?;
        Ok(self.futexes().wake(space, word, count))
    }

    /// Applies the encoded operation `op` to `word2` and wakes waiters of
    /// both words; see [`FutexTable::wake_op`](crate::sync::FutexTable::wake_op).
    pub fn futex_wake_op(
        &self,
        caller: ThreadId,
        word: &AtomicI32,
        count: usize,
        word2: &AtomicI32,
        count2: usize,
        op: u32,
    ) -> OsResult<usize> {
        let op = FutexOp::decode(op)?;
        let space = self.threads().memory_space(caller)?;
        Ok(self
            .futexes()
            .wake_op(space, word, count, word2, count2, op))
    }

    /// Marks `handle` for whatever sets watch it; unwatched handles are fine.
    fn notify(&self, handle: HandleId, flags: IoEvents) {
        let _ = self.handle_sets().mark(handle, flags);
    }

    fn mutex(&self, handle: HandleId) -> OsResult<Arc<MutexObject>> {
        self.handles().lookup_as(handle, HandleType::Mutex)
    }

    fn pipe(&self, handle: HandleId) -> OsResult<Arc<Pipe>> {
        self.handles().lookup_as(handle, HandleType::Pipe)
    }
}
