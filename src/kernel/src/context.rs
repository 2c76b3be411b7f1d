//! The kernel context: every subsystem, wired together once at boot.
//!
//! Nothing in the kernel is global. Syscalls, interrupt handlers and kernel
//! threads reach the scheduler, the handle table and the rest through a
//! shared [`KernelContext`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use vali_common::{CpuId, OsResult, ThreadFlags, ThreadId};
use vali_hal::Platform;

use crate::config::KernelConfig;
use crate::handle::{HandleSets, HandleTable, Janitor};
use crate::irq::{InterruptTable, SchedulerTick};
use crate::sched::Scheduler;
use crate::sync::FutexTable;
use crate::thread::ThreadTable;

/// Interrupt line of the scheduler timer.
pub const TIMER_IRQ: u8 = 0;

/// Shared state of a running kernel.
pub struct KernelContext {
    config: KernelConfig,
    sched: Arc<Scheduler>,
    threads: ThreadTable,
    handles: Arc<HandleTable>,
    handle_sets: HandleSets,
    janitor: Arc<Janitor>,
    janitor_thread: ThreadId,
    futexes: FutexTable,
    interrupts: InterruptTable,
    tick: Arc<SchedulerTick>,
}

/// Start-up argument of the janitor thread.
struct JanitorStart {
    sched: Arc<Scheduler>,
    janitor: Arc<Janitor>,
}

/// Builds the kernel on top of `platform`.
///
/// Creates the scheduler with its idle objects, the handle table and its
/// sets, the janitor thread and the timer handler on [`TIMER_IRQ`]. The
/// logger is installed separately with [`logger::init`](crate::logger::init).
pub fn boot(platform: Arc<dyn Platform>, config: KernelConfig) -> OsResult<Arc<KernelContext>> {
    config.validate()?;
    let sched = Arc::new(Scheduler::new(platform.clone(), config.scheduler)?);
    let threads = ThreadTable::new(sched.clone());
    let handles = Arc::new(HandleTable::new(sched.clone(), config.handle_capacity)?);
    let janitor = Arc::new(Janitor::new(handles.clone()));

    let start = Box::new(JanitorStart {
        sched: sched.clone(),
        janitor: janitor.clone(),
    });
    let arg = Box::into_raw(start) as usize;
    let created = threads.create("janitor", janitor_main, arg, ThreadFlags::KERNEL, None);
    let janitor_thread = match created {
        Ok(id) => id,
        Err(err) => {
            // SAFETY: `arg` came from `Box::into_raw` above and no thread
            // was created to take ownership of it.
            drop(unsafe { Box::from_raw(arg as *mut JanitorStart) });
            return Err(err);
        }
    };

    let interrupts = InterruptTable::new(platform);
    let tick = Arc::new(SchedulerTick::new(sched.clone()));
    interrupts.register(TIMER_IRQ, tick.clone());

    log::info!(
        "kernel: booted with {} cpu(s), janitor is {}",
        config.scheduler.cpu_count,
        janitor_thread
    );
    Ok(Arc::new(KernelContext {
        config,
        futexes: FutexTable::new(sched.clone()),
        handle_sets: HandleSets::new(sched.clone(), handles.clone()),
        sched,
        threads,
        handles,
        janitor,
        janitor_thread,
        interrupts,
        tick,
    }))
}

/// Entry point of the janitor thread; `arg` is a boxed [`JanitorStart`].
fn janitor_main(arg: usize) -> i32 {
    // SAFETY: `boot` hands this thread the only pointer to a leaked
    // `Box<JanitorStart>`, and the entry point runs once per thread.
    let start = unsafe { Box::from_raw(arg as *mut JanitorStart) };
    let cpu = CpuId(start.sched.platform().current_cpu());
    match start.sched.current(cpu) {
        Some(me) => {
            start.janitor.run(me);
            0
        }
        None => {
            log::error!("janitor: started on cpu {} with no current thread", cpu.0);
            -1
        }
    }
}

impl KernelContext {
    /// Configuration the kernel booted with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The platform.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        self.sched.platform()
    }

    /// The thread table.
    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// The handle table.
    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// The handle sets.
    pub fn handle_sets(&self) -> &HandleSets {
        &self.handle_sets
    }

    /// The janitor.
    pub fn janitor(&self) -> &Arc<Janitor> {
        &self.janitor
    }

    /// Id of the janitor thread.
    pub fn janitor_thread(&self) -> ThreadId {
        self.janitor_thread
    }

    /// The futex table.
    pub fn futexes(&self) -> &FutexTable {
        &self.futexes
    }

    /// The interrupt table.
    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    /// The timer handler.
    pub fn tick(&self) -> &Arc<SchedulerTick> {
        &self.tick
    }

    /// Stops the janitor after one last pass.
    pub fn shutdown(&self) {
        self.janitor.shutdown();
    }
}
