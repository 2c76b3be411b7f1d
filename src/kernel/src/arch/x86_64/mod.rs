//! Uniprocessor x86_64 platform.
//!
//! The 8259 PICs route the PIT to IRQ 0, which is programmed at 1 kHz and
//! doubles as the millisecond clock. There is a single CPU, so IPIs are
//! never needed. A yielding thread halts until the next interrupt and then
//! re-checks its state; the actual register save and restore lives in the
//! boot stub that calls [`X86Platform::take_context`].

pub mod pic;
pub mod serial;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use ::x86_64::instructions::interrupts;
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame;
use ::x86_64::PhysAddr;
use pic8259::ChainedPics;
use vali_common::OsResult;
use vali_hal::{AddressSpaces, ContextSwitch, InterruptController, ThreadEntry, TimerSource};

use crate::config::KernelConfig;
use crate::context::{boot, KernelContext, TIMER_IRQ};

pub use serial::SerialConsole;

const TIMER_DISABLED: u64 = u64::MAX;

/// The x86_64 machine.
pub struct X86Platform {
    pics: spin::Mutex<ChainedPics>,
    clock_ms: AtomicU64,
    timer_due: AtomicU64,
    contexts: spin::Mutex<BTreeMap<u64, (ThreadEntry, usize)>>,
}

impl X86Platform {
    /// Creates the platform. Call [`init`](Self::init) before enabling
    /// interrupts.
    pub fn new() -> Self {
        X86Platform {
            pics: spin::Mutex::new(pic::chained()),
            clock_ms: AtomicU64::new(0),
            timer_due: AtomicU64::new(TIMER_DISABLED),
            contexts: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Remaps and unmasks the PICs.
    pub fn init(&self) {
        // SAFETY: runs once at boot with interrupts disabled; the offsets
        // from `pic::chained` do not collide with CPU exceptions.
        unsafe { self.pics.lock().initialize() };
    }

    /// Called by the IRQ 0 stub. Advances the clock and tells the stub
    /// whether the scheduler asked to run now.
    pub fn on_timer_interrupt(&self) -> bool {
        let now = self.clock_ms.fetch_add(1, Ordering::AcqRel) + 1;
        now >= self.timer_due.load(Ordering::Acquire)
    }

    /// Entry point and argument of a thread that has not started yet.
    pub fn take_context(&self, thread: u64) -> Option<(ThreadEntry, usize)> {
        self.contexts.lock().remove(&thread)
    }
}

impl Default for X86Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for X86Platform {
    fn enable(&self) {
        interrupts::enable();
    }

    fn disable(&self) {
        interrupts::disable();
    }

    fn are_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn end_of_interrupt(&self, irq: u8) {
        // SAFETY: `irq` is the line being serviced, so acknowledging it
        // cannot drop another pending interrupt.
        unsafe { self.pics.lock().notify_end_of_interrupt(pic::vector(irq)) };
    }

    fn send_ipi(&self, cpu: u32) {
        log::trace!("x86_64: no IPI delivery on a single cpu (target {})", cpu);
    }
}

impl TimerSource for X86Platform {
    fn now_ms(&self) -> u64 {
        self.clock_ms.load(Ordering::Acquire)
    }

    fn reprogram(&self, _cpu: u32, after_ms: Option<u64>) {
        let due = after_ms.map_or(TIMER_DISABLED, |ms| self.now_ms().saturating_add(ms));
        self.timer_due.store(due, Ordering::Release);
    }
}

impl AddressSpaces for X86Platform {
    fn switch_memory_space(&self, _cpu: u32, space: u64) {
        // Zero is the kernel's own space, which is always mapped.
        if space == 0 {
            return;
        }
        let frame = PhysFrame::containing_address(PhysAddr::new(space));
        // SAFETY: address-space roots handed to the scheduler are page
        // tables that map the kernel at the same addresses as the current one.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

impl ContextSwitch for X86Platform {
    fn current_cpu(&self) -> u32 {
        0
    }

    fn save_and_yield(&self, _thread: u64) {
        interrupts::enable_and_hlt();
    }

    fn resume(&self, _thread: u64) {}

    fn prepare_context(&self, thread: u64, entry: ThreadEntry, arg: usize) {
        self.contexts.lock().insert(thread, (entry, arg));
    }
}

/// Brings up logging on COM1, the PICs and the kernel context.
pub fn start(config: KernelConfig) -> OsResult<Arc<KernelContext>> {
    crate::logger::init(Box::new(SerialConsole::com1()), config.log_level)?;
    let platform = Arc::new(X86Platform::new());
    platform.init();
    let ctx = boot(platform, config)?;
    log::info!("x86_64: timer on vector {}", pic::vector(TIMER_IRQ));
    Ok(ctx)
}
