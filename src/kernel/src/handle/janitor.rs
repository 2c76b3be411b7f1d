//! Deferred handle cleanup.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use vali_common::{OsError, ThreadId};

use super::HandleTable;

/// Reclaims handles whose reference count reached zero.
///
/// The janitor thread sleeps on the table's cleanup semaphore. Each wakeup
/// drains every flagged handle, so one pass may consume more flagged
/// handles than permits; the surplus permits just cause empty passes.
pub struct Janitor {
    handles: Arc<HandleTable>,
    shutdown: AtomicBool,
    reclaimed: AtomicUsize,
}

impl Janitor {
    /// Creates a janitor for `handles`.
    pub fn new(handles: Arc<HandleTable>) -> Self {
        Janitor {
            handles,
            shutdown: AtomicBool::new(false),
            reclaimed: AtomicUsize::new(0),
        }
    }

    /// Reclaims every flagged handle now. Returns how many were reclaimed.
    pub fn run_once(&self) -> usize {
        let drained = self.handles.drain_marked();
        let count = drained.len();
        for entry in drained {
            log::trace!("janitor: reclaiming {}", entry.id());
            entry.finalize();
        }
        if count > 0 {
            self.reclaimed.fetch_add(count, Ordering::Relaxed);
            log::debug!("janitor: reclaimed {} handle(s)", count);
        }
        count
    }

    /// Main loop of the janitor thread `caller`. Returns after
    /// [`shutdown`](Self::shutdown) or when the thread is interrupted.
    pub fn run(&self, caller: ThreadId) {
        log::info!("janitor: running as {}", caller);
        loop {
            let signal = self.handles.cleanup_signal().acquire(caller, None);
            self.run_once();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if signal == Err(OsError::Interrupted) {
                log::warn!("janitor: interrupted, exiting");
                break;
            }
        }
        log::info!("janitor: stopped");
    }

    /// Asks [`run`](Self::run) to return after its next pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.handles.cleanup_signal().release();
    }

    /// Total handles reclaimed so far.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Destructible;
    use crate::testutil::{host_scheduler, spawn_kernel_thread, wait_for};
    use alloc::boxed::Box;
    use vali_common::HandleType;

    #[test]
    fn test_run_once_reclaims_flagged_only() {
        let (_platform, sched) = host_scheduler(1);
        let handles = Arc::new(HandleTable::new(sched, 8).unwrap());
        let janitor = Janitor::new(handles.clone());
        let kept = handles.create(HandleType::Generic, None, None).unwrap();
        let dropped = handles.create(HandleType::Generic, None, None).unwrap();

        assert_eq!(janitor.run_once(), 0);
        handles.destroy(dropped).unwrap();
        assert_eq!(janitor.run_once(), 1);
        assert_eq!(janitor.run_once(), 0);
        assert_eq!(janitor.reclaimed(), 1);
        assert_eq!(handles.references(kept), Some(1));
        assert_eq!(handles.references(dropped), None);
    }

    #[test]
    fn test_janitor_thread_runs_destructors() {
        let (_platform, sched) = host_scheduler(1);
        let handles = Arc::new(HandleTable::new(sched.clone(), 8).unwrap());
        let janitor = Arc::new(Janitor::new(handles.clone()));
        let destroyed = Arc::new(AtomicUsize::new(0));

        let (_thread, worker) = {
            let janitor = janitor.clone();
            spawn_kernel_thread(&sched, move |_, me| janitor.run(me))
        };
        wait_for(|| handles.cleanup_signal().waiter_count() == 1);

        for _ in 0..3 {
            let counter = destroyed.clone();
            let destructor: Box<dyn Destructible> = Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let id = handles
                .create(HandleType::Generic, None, Some(destructor))
                .unwrap();
            handles.acquire(id).unwrap();
            handles.destroy(id).unwrap();
            handles.destroy(id).unwrap();
            assert_eq!(handles.destroy(id), Err(OsError::NotFound));
        }
        wait_for(|| destroyed.load(Ordering::SeqCst) == 3);
        assert!(handles.is_empty());

        janitor.shutdown();
        worker.join().unwrap();
        assert_eq!(janitor.reclaimed(), 3);
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }
}
