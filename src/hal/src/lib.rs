//! Vali Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines the boundary between the portable scheduler core and
//! the machine it runs on. The kernel never touches registers directly; it
//! asks a [`Platform`] to mask interrupts, program the timer, switch address
//! spaces and park or resume threads.
//!
//! Thread ids, CPU indices and address-space roots are passed as plain
//! integers so this crate stays dependency-free.

#![no_std]
#![warn(missing_docs)]

/// Entry point of a newly created thread. Receives the creation argument and
/// returns the exit code.
pub type ThreadEntry = fn(usize) -> i32;

/// Trait for a text-based console output.
pub trait Console {
    /// Writes a string to the console.
    fn write_str(&mut self, s: &str);
    /// Clears the console screen.
    fn clear(&mut self);
}

/// Trait for controlling interrupts on the calling CPU.
pub trait InterruptController: Send + Sync {
    /// Enables interrupts on the calling CPU.
    fn enable(&self);
    /// Disables interrupts on the calling CPU.
    fn disable(&self);
    /// Returns whether interrupts are currently enabled on the calling CPU.
    fn are_enabled(&self) -> bool;
    /// Signals the end of an interrupt to the controller.
    fn end_of_interrupt(&self, irq: u8);
    /// Sends a wake-up inter-processor interrupt to `cpu`.
    fn send_ipi(&self, cpu: u32);
}

/// Result of offering an interrupt to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    /// The handler serviced the interrupt.
    Handled,
    /// The interrupt was not for this handler.
    NotHandled,
}

/// A registered interrupt handler.
pub trait InterruptHandler: Send + Sync {
    /// Services `irq`. Runs with interrupts disabled.
    fn handle(&self, irq: u8) -> InterruptStatus;
}

/// Trait for the system timer.
pub trait TimerSource: Send + Sync {
    /// Milliseconds since the system started.
    fn now_ms(&self) -> u64;
    /// Arms the local timer of `cpu` to fire `after_ms` from now, or disables
    /// it when `None`.
    fn reprogram(&self, cpu: u32, after_ms: Option<u64>);
}

/// Trait for switching the active address space.
pub trait AddressSpaces: Send + Sync {
    /// Makes `space` the active address space on `cpu`.
    fn switch_memory_space(&self, cpu: u32, space: u64);
}

/// Trait for the register-level context switch.
pub trait ContextSwitch: Send + Sync {
    /// Index of the calling CPU.
    fn current_cpu(&self) -> u32;
    /// Saves the calling thread's context and runs something else until the
    /// thread is resumed. May return spuriously; callers re-check their state.
    fn save_and_yield(&self, thread: u64);
    /// Makes a previously yielded thread eligible to continue.
    fn resume(&self, thread: u64);
    /// Builds the initial context of a new thread.
    fn prepare_context(&self, thread: u64, entry: ThreadEntry, arg: usize);
}

/// Everything the scheduler core needs from the machine.
pub trait Platform: InterruptController + TimerSource + AddressSpaces + ContextSwitch {}

impl<T> Platform for T where T: InterruptController + TimerSource + AddressSpaces + ContextSwitch {}
