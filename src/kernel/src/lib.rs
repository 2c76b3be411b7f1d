//! Vali kernel core.
//!
//! A multilevel feedback queue scheduler and the blocking machinery built
//! on it, independent of the machine underneath.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `sched`: per-CPU run queues, thread state machine, wait lists
//! - `sync`: IRQ-safe spinlock, mutexes, semaphore, futexes
//! - `handle`: reference-counted handles, handle sets and the janitor
//! - `pipe`: bounded byte pipes
//! - `thread`: thread bookkeeping (join, detach, exit codes)
//! - `irq`: interrupt routing and the scheduler tick
//! - `context`: boot and the [`KernelContext`] tying it together
//! - `syscall`: the typed system call surface
//! - `arch`: platform implementations (x86_64 on bare metal)
//!
//! # Safety
//!
//! This is a `#![no_std]` kernel. All unsafe code is documented with safety
//! invariants explaining why the usage is correct.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod context;
pub mod handle;
pub mod irq;
pub mod logger;
pub mod pipe;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod thread;

#[cfg(test)]
pub mod testutil;

pub use config::{KernelConfig, SchedulerConfig};
pub use context::{boot, KernelContext};
