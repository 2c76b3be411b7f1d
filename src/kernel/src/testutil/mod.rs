//! Host-side test infrastructure for the Vali kernel.
//!
//! Kernel threads are modelled by host threads. [`HostPlatform`] keeps a
//! manual millisecond clock, a per-host-thread interrupt flag, and parks
//! yielding threads on a condition variable with a short timeout, so a
//! missed resume only costs a millisecond.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::vec::Vec;

use vali_common::{CpuId, ThreadFlags, ThreadId};
use vali_hal::{AddressSpaces, ContextSwitch, InterruptController, ThreadEntry, TimerSource};

use crate::config::SchedulerConfig;
use crate::sched::{Affinity, Scheduler};

thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

/// Platform double for host tests.
pub struct HostPlatform {
    clock: AtomicU64,
    parked: Mutex<u64>,
    wakeups: Condvar,
    ipis: AtomicUsize,
    eois: AtomicUsize,
    space_switches: AtomicUsize,
    timers: Mutex<Vec<Option<Option<u64>>>>,
    prepared: Mutex<Vec<(u64, usize)>>,
    prepare_hook: Mutex<Option<PrepareHook>>,
}

type PrepareHook = Box<dyn Fn(u64) + Send>;

impl HostPlatform {
    /// Creates a platform with `cpus` timers and the clock at zero.
    pub fn new(cpus: u32) -> Arc<Self> {
        Arc::new(HostPlatform {
            clock: AtomicU64::new(0),
            parked: Mutex::new(0),
            wakeups: Condvar::new(),
            ipis: AtomicUsize::new(0),
            eois: AtomicUsize::new(0),
            space_switches: AtomicUsize::new(0),
            timers: Mutex::new(vec![None; cpus as usize]),
            prepared: Mutex::new(Vec::new()),
            prepare_hook: Mutex::new(None),
        })
    }

    /// Moves the clock forward.
    pub fn advance_clock(&self, ms: u64) {
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    /// Makes the calling host thread report `cpu` as its CPU.
    pub fn set_current_cpu(cpu: u32) {
        CURRENT_CPU.with(|current| current.set(cpu));
    }

    /// Last value handed to `reprogram` for `cpu`; `None` if never programmed.
    pub fn last_timer(&self, cpu: u32) -> Option<Option<u64>> {
        self.timers.lock().unwrap()[cpu as usize]
    }

    /// IPIs sent so far.
    pub fn ipi_count(&self) -> usize {
        self.ipis.load(Ordering::SeqCst)
    }

    /// End-of-interrupt signals sent so far.
    pub fn eoi_count(&self) -> usize {
        self.eois.load(Ordering::SeqCst)
    }

    /// Address-space switches so far.
    pub fn space_switches(&self) -> usize {
        self.space_switches.load(Ordering::SeqCst)
    }

    /// Threads handed to `prepare_context`, with their arguments.
    pub fn prepared(&self) -> Vec<(u64, usize)> {
        self.prepared.lock().unwrap().clone()
    }

    /// Runs `hook` with the thread id on every `prepare_context`.
    pub fn on_prepare(&self, hook: impl Fn(u64) + Send + 'static) {
        *self.prepare_hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl InterruptController for HostPlatform {
    fn enable(&self) {
        IRQ_ENABLED.with(|enabled| enabled.set(true));
    }

    fn disable(&self) {
        IRQ_ENABLED.with(|enabled| enabled.set(false));
    }

    fn are_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn end_of_interrupt(&self, _irq: u8) {
        self.eois.fetch_add(1, Ordering::SeqCst);
    }

    fn send_ipi(&self, _cpu: u32) {
        self.ipis.fetch_add(1, Ordering::SeqCst);
    }
}

impl TimerSource for HostPlatform {
    fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn reprogram(&self, cpu: u32, after_ms: Option<u64>) {
        self.timers.lock().unwrap()[cpu as usize] = Some(after_ms);
    }
}

impl AddressSpaces for HostPlatform {
    fn switch_memory_space(&self, _cpu: u32, _space: u64) {
        self.space_switches.fetch_add(1, Ordering::SeqCst);
    }
}

impl ContextSwitch for HostPlatform {
    fn current_cpu(&self) -> u32 {
        CURRENT_CPU.with(Cell::get)
    }

    fn save_and_yield(&self, _thread: u64) {
        let parked = self.parked.lock().unwrap();
        let _ = self
            .wakeups
            .wait_timeout(parked, Duration::from_millis(1))
            .unwrap();
    }

    fn resume(&self, _thread: u64) {
        let mut parked = self.parked.lock().unwrap();
        *parked += 1;
        self.wakeups.notify_all();
    }

    fn prepare_context(&self, thread: u64, _entry: ThreadEntry, arg: usize) {
        self.prepared.lock().unwrap().push((thread, arg));
        if let Some(hook) = self.prepare_hook.lock().unwrap().as_ref() {
            hook(thread);
        }
    }
}

/// A host platform and a scheduler with `cpus` CPUs and default tunables.
pub fn host_scheduler(cpus: u32) -> (Arc<HostPlatform>, Arc<Scheduler>) {
    let platform = HostPlatform::new(cpus);
    let config = SchedulerConfig {
        cpu_count: cpus,
        ..SchedulerConfig::default()
    };
    let sched = Scheduler::new(platform.clone(), config).unwrap();
    (platform, Arc::new(sched))
}

/// Creates a scheduler object and runs `body` as that thread on a host thread.
pub fn spawn_kernel_thread<T, F>(sched: &Arc<Scheduler>, body: F) -> (ThreadId, JoinHandle<T>)
where
    F: FnOnce(&Scheduler, ThreadId) -> T + Send + 'static,
    T: Send + 'static,
{
    let id = sched
        .create_object(ThreadFlags::empty(), Affinity::Any, 0)
        .unwrap();
    (id, run_as(sched, id, body))
}

/// Runs `body` as the existing thread `id` on a host thread.
pub fn run_as<T, F>(sched: &Arc<Scheduler>, id: ThreadId, body: F) -> JoinHandle<T>
where
    F: FnOnce(&Scheduler, ThreadId) -> T + Send + 'static,
    T: Send + 'static,
{
    let sched = sched.clone();
    thread::spawn(move || body(&sched, id))
}

/// Polls `condition` until it holds. Panics after ten seconds.
pub fn wait_for(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not reached in time"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drives the clock and every CPU one millisecond at a time until
/// `condition` holds. Returns `false` if it never did.
pub fn tick_until(
    platform: &HostPlatform,
    sched: &Scheduler,
    mut condition: impl FnMut() -> bool,
) -> bool {
    for _ in 0..100_000 {
        if condition() {
            return true;
        }
        platform.advance_clock(1);
        for cpu in 0..sched.cpu_count() {
            sched.advance(CpuId(cpu), 1, true);
        }
        thread::sleep(Duration::from_micros(50));
    }
    condition()
}
