//! Interrupt routing.
//!
//! Several handlers may share a line; they are offered the interrupt in
//! registration order until one claims it. The controller is acknowledged
//! after every dispatch, claimed or not.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use vali_common::{CpuId, OsError, OsResult};
use vali_hal::{InterruptHandler, InterruptStatus, Platform};

use crate::sched::Scheduler;
use crate::sync::IrqGuard;

/// Registration token returned by [`InterruptTable::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterruptId(u64);

struct Registration {
    id: InterruptId,
    handler: Arc<dyn InterruptHandler>,
}

/// Handlers per interrupt line.
pub struct InterruptTable {
    platform: Arc<dyn Platform>,
    lines: spin::Mutex<BTreeMap<u8, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl InterruptTable {
    /// Creates an empty table.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        InterruptTable {
            platform,
            lines: spin::Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds `handler` to the end of the chain for `irq`.
    pub fn register(&self, irq: u8, handler: Arc<dyn InterruptHandler>) -> InterruptId {
        let id = InterruptId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lines
            .lock()
            .entry(irq)
            .or_default()
            .push(Registration { id, handler });
        log::debug!("irq: handler {} registered on line {}", id.0, irq);
        id
    }

    /// Removes a handler.
    pub fn unregister(&self, id: InterruptId) -> OsResult<()> {
        let mut lines = self.lines.lock();
        for chain in lines.values_mut() {
            if let Some(index) = chain.iter().position(|registration| registration.id == id) {
                chain.remove(index);
                return Ok(());
            }
        }
        Err(OsError::NotFound)
    }

    /// Number of handlers on `irq`.
    pub fn handler_count(&self, irq: u8) -> usize {
        self.lines.lock().get(&irq).map_or(0, Vec::len)
    }

    /// Offers `irq` to its handlers with interrupts disabled, then sends EOI.
    pub fn dispatch(&self, irq: u8) -> InterruptStatus {
        let _irq = IrqGuard::new(&*self.platform);
        let chain: Vec<Arc<dyn InterruptHandler>> = self
            .lines
            .lock()
            .get(&irq)
            .map(|chain| chain.iter().map(|registration| registration.handler.clone()).collect())
            .unwrap_or_default();
        let status = chain
            .iter()
            .map(|handler| handler.handle(irq))
            .find(|status| *status == InterruptStatus::Handled)
            .unwrap_or(InterruptStatus::NotHandled);
        if status == InterruptStatus::NotHandled {
            log::trace!("irq: line {} not handled", irq);
        }
        self.platform.end_of_interrupt(irq);
        status
    }
}

/// Timer handler that drives the scheduler of the interrupted CPU.
pub struct SchedulerTick {
    sched: Arc<Scheduler>,
    ticks: AtomicU64,
}

impl SchedulerTick {
    /// Creates the tick handler for `sched`.
    pub fn new(sched: Arc<Scheduler>) -> Self {
        SchedulerTick {
            sched,
            ticks: AtomicU64::new(0),
        }
    }

    /// Ticks handled so far, across all CPUs.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl InterruptHandler for SchedulerTick {
    fn handle(&self, _irq: u8) -> InterruptStatus {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let cpu = CpuId(self.sched.platform().current_cpu());
        self.sched.advance(cpu, self.sched.config().tick_ms, true);
        InterruptStatus::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Affinity;
    use crate::testutil::host_scheduler;
    use core::sync::atomic::AtomicUsize;
    use vali_common::ThreadFlags;
    use vali_hal::InterruptController;

    struct CountingHandler {
        status: InterruptStatus,
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new(status: InterruptStatus) -> Arc<Self> {
            Arc::new(CountingHandler {
                status,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InterruptHandler for CountingHandler {
        fn handle(&self, _irq: u8) -> InterruptStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.status
        }
    }

    #[test]
    fn test_dispatch_stops_at_first_claim() {
        let (platform, _sched) = host_scheduler(1);
        let table = InterruptTable::new(platform.clone());
        let decline = CountingHandler::new(InterruptStatus::NotHandled);
        let claim = CountingHandler::new(InterruptStatus::Handled);
        let never = CountingHandler::new(InterruptStatus::Handled);
        table.register(4, decline.clone());
        table.register(4, claim.clone());
        table.register(4, never.clone());

        assert_eq!(table.dispatch(4), InterruptStatus::Handled);
        assert_eq!((decline.calls(), claim.calls(), never.calls()), (1, 1, 0));
        assert_eq!(platform.eoi_count(), 1);

        assert_eq!(table.dispatch(9), InterruptStatus::NotHandled);
        assert_eq!(platform.eoi_count(), 2);
    }

    #[test]
    fn test_unregister() {
        let (platform, _sched) = host_scheduler(1);
        let table = InterruptTable::new(platform);
        let handler = CountingHandler::new(InterruptStatus::Handled);
        let id = table.register(1, handler.clone());
        assert_eq!(table.handler_count(1), 1);
        table.unregister(id).unwrap();
        assert_eq!(table.unregister(id), Err(OsError::NotFound));
        assert_eq!(table.dispatch(1), InterruptStatus::NotHandled);
        assert_eq!(handler.calls(), 0);
    }

    #[test]
    fn test_scheduler_tick_preempts() {
        let (platform, sched) = host_scheduler(1);
        let table = InterruptTable::new(platform.clone());
        let tick = Arc::new(SchedulerTick::new(sched.clone()));
        table.register(0, tick.clone());

        let a = sched
            .create_object(ThreadFlags::empty(), Affinity::Any, 0)
            .unwrap();
        let b = sched
            .create_object(ThreadFlags::empty(), Affinity::Any, 0)
            .unwrap();
        let slice = sched.config().slice_for(0);
        for _ in 0..slice {
            table.dispatch(0);
        }
        // The first tick picks `a`; its slice runs out `slice` ticks later.
        assert_eq!(sched.current(CpuId(0)), Some(a));
        table.dispatch(0);
        assert_eq!(sched.current(CpuId(0)), Some(b));
        assert_eq!(sched.level_of(a), Some(1));
        assert_eq!(tick.ticks(), slice + 1);
        assert!(platform.are_enabled());
    }
}
