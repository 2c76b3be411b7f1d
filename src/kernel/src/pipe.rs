//! Bounded byte pipe between kernel threads.
//!
//! The ring keeps one slot empty, so a pipe created with capacity `n`
//! buffers at most `n - 1` bytes. Writers block while the ring is full and
//! readers while too little has arrived. Peeks wait for different amounts,
//! so new data wakes every blocked reader; freed room wakes one writer. A
//! caller that finishes with room or data left over wakes the next waiter
//! on its own side.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use vali_common::{OsError, OsResult, ThreadId};

use crate::sched::{Scheduler, WaitList, WakeReason};

struct Ring {
    buffer: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn available(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    fn free(&self) -> usize {
        self.capacity() - 1 - self.available()
    }

    fn push(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.free());
        for &byte in &src[..count] {
            self.buffer[self.tail] = byte;
            self.tail = (self.tail + 1) % self.capacity();
        }
        count
    }

    fn copy_out(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.available());
        let mut position = self.head;
        for slot in &mut dst[..count] {
            *slot = self.buffer[position];
            position = (position + 1) % self.capacity();
        }
        count
    }

    fn consume(&mut self, count: usize) {
        self.head = (self.head + count) % self.capacity();
    }
}

/// A blocking single-ring pipe.
pub struct Pipe {
    sched: Arc<Scheduler>,
    ring: spin::Mutex<Ring>,
    readers: WaitList,
    writers: WaitList,
    destroyed: AtomicBool,
}

impl Pipe {
    /// Creates a pipe with a ring of `capacity` bytes.
    pub fn new(sched: Arc<Scheduler>, capacity: usize) -> OsResult<Self> {
        if capacity < 2 {
            return Err(OsError::InvalidParameters);
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| OsError::OutOfMemory)?;
        buffer.resize(capacity, 0);
        Ok(Pipe {
            sched,
            ring: spin::Mutex::new(Ring {
                buffer,
                head: 0,
                tail: 0,
            }),
            readers: WaitList::new(),
            writers: WaitList::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Size of the ring; one byte less than this can be buffered.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.ring.lock().available()
    }

    /// Bytes that can be written without blocking.
    pub fn free(&self) -> usize {
        self.ring.lock().free()
    }

    /// Returns `true` once [`destroy`](Self::destroy) ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Writes all of `src`, blocking `caller` while the ring is full.
    pub fn write(&self, caller: ThreadId, src: &[u8]) -> OsResult<usize> {
        let mut written = 0;
        while written < src.len() {
            self.check_open()?;
            let pushed = self.ring.lock().push(&src[written..]);
            if pushed > 0 {
                written += pushed;
                self.sched.wake_all(&self.readers);
                continue;
            }
            let woke = self.sched.block_if(&self.writers, caller, None, || {
                !self.is_destroyed() && self.ring.lock().free() == 0
            });
            if woke == Some(WakeReason::Interrupted) {
                return Err(OsError::Interrupted);
            }
        }
        if self.free() > 0 {
            self.sched.wake_one(&self.writers);
        }
        log::trace!("pipe: {} wrote {} byte(s)", caller, written);
        Ok(written)
    }

    /// Fills `dst`, blocking `caller` until every byte has arrived.
    ///
    /// With `peek` the data stays in the ring and the call only waits for
    /// as much as the ring can hold.
    pub fn read(&self, caller: ThreadId, dst: &mut [u8], peek: bool) -> OsResult<usize> {
        if peek {
            return self.peek(caller, dst);
        }
        let mut delivered = 0;
        while delivered < dst.len() {
            self.check_open()?;
            let copied = {
                let mut ring = self.ring.lock();
                let copied = ring.copy_out(&mut dst[delivered..]);
                ring.consume(copied);
                copied
            };
            if copied > 0 {
                delivered += copied;
                self.sched.wake_one(&self.writers);
                continue;
            }
            self.wait_for_data(caller, 1)?;
        }
        if self.available() > 0 {
            self.sched.wake_one(&self.readers);
        }
        log::trace!("pipe: {} read {} byte(s)", caller, delivered);
        Ok(delivered)
    }

    /// Wakes every waiter; all calls from now on fail with `PipeClosed`.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let woken = self.sched.wake_all(&self.readers) + self.sched.wake_all(&self.writers);
        log::debug!("pipe: destroyed, {} waiter(s) released", woken);
    }

    fn peek(&self, caller: ThreadId, dst: &mut [u8]) -> OsResult<usize> {
        let wanted = dst.len().min(self.capacity() - 1);
        loop {
            self.check_open()?;
            {
                let ring = self.ring.lock();
                if ring.available() >= wanted {
                    return Ok(ring.copy_out(&mut dst[..wanted]));
                }
            }
            self.wait_for_data(caller, wanted)?;
        }
    }

    fn wait_for_data(&self, caller: ThreadId, wanted: usize) -> OsResult<()> {
        let woke = self.sched.block_if(&self.readers, caller, None, || {
            !self.is_destroyed() && self.ring.lock().available() < wanted
        });
        match woke {
            Some(WakeReason::Interrupted) => Err(OsError::Interrupted),
            _ => Ok(()),
        }
    }

    fn check_open(&self) -> OsResult<()> {
        if self.is_destroyed() {
            return Err(OsError::PipeClosed);
        }
        Ok(())
    }
}
