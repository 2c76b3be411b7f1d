//! Flag sets for threads, synchronization objects and handle sets.

use bitflags::bitflags;

bitflags! {
    /// Scheduling attributes of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ThreadFlags: u32 {
        /// Never leaves the CPU it was created on.
        const BOUND         = 1 << 0;
        /// Per-CPU idle object.
        const IDLE          = 1 << 1;
        /// Lives on the top queue and is never demoted.
        const TIME_CRITICAL = 1 << 2;
        /// Kernel-only thread.
        const KERNEL        = 1 << 3;
    }
}

bitflags! {
    /// Behaviour of a kernel mutex.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct MutexFlags: u32 {
        /// The owner may lock again; each lock needs its own unlock.
        const RECURSIVE = 1 << 0;
        /// Lock attempts may carry a timeout.
        const TIMED     = 1 << 1;
    }
}

bitflags! {
    /// Events a handle set can listen for on a member handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct IoEvents: u32 {
        /// Data can be read.
        const IN  = 1 << 0;
        /// Room for writing.
        const OUT = 1 << 1;
        /// Control or state change.
        const CTL = 1 << 2;
        /// Synchronous notification.
        const SYN = 1 << 3;
    }
}
