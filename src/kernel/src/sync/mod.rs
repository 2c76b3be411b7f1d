//! Synchronization primitives for kernel threads.
//!
//! Everything that sleeps here parks through the scheduler's wait lists;
//! nothing busy-waits beyond the bounded mutex spin.
//!
//! # Primitives
//!
//! - [`IrqSpinLock`]: spinlock that also masks interrupts
//! - [`Mutex`] and [`TimedMutex`]: recursive-capable sleeping locks
//! - [`Semaphore`]: counting semaphore
//! - [`FutexTable`]: address-keyed waits for userspace locks

pub mod futex;
pub mod irq;
mod mutex;
mod semaphore;

pub use futex::{FutexCmp, FutexOp, FutexOpKind, FutexTable};
pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use mutex::{Mutex, MutexGuard, TimedMutex};
pub use semaphore::Semaphore;
