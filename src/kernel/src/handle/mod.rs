//! Reference-counted system handles.
//!
//! Every kernel object userspace can name lives behind a handle. A handle
//! starts with one reference; [`HandleTable::acquire`] adds one and
//! [`HandleTable::destroy`] drops one. When the count reaches zero the
//! handle is flagged for cleanup and the [`Janitor`] is signalled; it
//! removes flagged handles in batches and runs their destructors outside
//! the table lock, exactly once each.
//!
//! Counts are changed with CAS loops that refuse to move a count that is
//! already zero, so a dead handle can never be revived.
//!
//! Handles can be grouped into [`HandleSet`]s and waited on together.

pub mod janitor;
pub mod set;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use vali_common::{HandleId, HandleType, OsError, OsResult};

use crate::sched::Scheduler;
use crate::sync::Semaphore;

pub use janitor::Janitor;
pub use set::{HandleSet, HandleSets, SetControl, SetEvent};

/// Shared resource stored in a handle.
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Cleanup run by the janitor once a handle's last reference is gone.
pub trait Destructible: Send {
    /// Releases whatever the handle owned.
    fn destroy(self: Box<Self>);
}

impl<F> Destructible for F
where
    F: FnOnce() + Send,
{
    fn destroy(self: Box<Self>) {
        (*self)()
    }
}

pub(crate) struct HandleEntry {
    id: HandleId,
    kind: HandleType,
    resource: Option<Resource>,
    destructor: spin::Mutex<Option<Box<dyn Destructible>>>,
    references: AtomicI32,
    cleanup: AtomicBool,
    path: spin::Mutex<Option<String>>,
}

impl HandleEntry {
    fn is_alive(&self) -> bool {
        self.references.load(Ordering::Acquire) > 0
    }

    /// Runs the destructor if it has not run yet.
    pub(crate) fn finalize(&self) {
        let destructor = self.destructor.lock().take();
        if let Some(destructor) = destructor {
            destructor.destroy();
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<HandleEntry>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Slots {
    fn get(&self, id: HandleId) -> Option<&Arc<HandleEntry>> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn live(&self) -> impl Iterator<Item = &Arc<HandleEntry>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|entry| entry.is_alive())
    }
}

/// The system handle table.
pub struct HandleTable {
    slots: spin::Mutex<Slots>,
    cleanup_signal: Semaphore,
}

impl HandleTable {
    /// Creates an empty table with room for `capacity` handles.
    pub fn new(sched: Arc<Scheduler>, capacity: usize) -> OsResult<Self> {
        let mut slots = Slots::default();
        slots
            .slots
            .try_reserve(capacity)
            .map_err(|_| OsError::OutOfMemory)?;
        Ok(HandleTable {
            slots: spin::Mutex::new(slots),
            cleanup_signal: Semaphore::with_max(sched, 0, usize::MAX),
        })
    }

    /// Registers a resource with one reference.
    pub fn create(
        &self,
        kind: HandleType,
        resource: Option<Resource>,
        destructor: Option<Box<dyn Destructible>>,
    ) -> OsResult<HandleId> {
        let mut slots = self.slots.lock();
        let (index, generation) = match slots.free.pop() {
            Some(index) => (index, slots.slots[index as usize].generation),
            None => {
                let index = u32::try_from(slots.slots.len()).map_err(|_| OsError::OutOfMemory)?;
                slots
                    .slots
                    .try_reserve(1)
                    .map_err(|_| OsError::OutOfMemory)?;
                slots.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (index, 0)
            }
        };
        let id = HandleId::new(index, generation);
        slots.slots[index as usize].entry = Some(Arc::new(HandleEntry {
            id,
            kind,
            resource,
            destructor: spin::Mutex::new(destructor),
            references: AtomicI32::new(1),
            cleanup: AtomicBool::new(false),
            path: spin::Mutex::new(None),
        }));
        log::trace!("handle: created {} ({:?})", id, kind);
        Ok(id)
    }

    /// Adds a reference to a live handle.
    pub fn acquire(&self, id: HandleId) -> OsResult<()> {
        let entry = self.entry(id)?;
        let mut current = entry.references.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return Err(OsError::NotFound);
            }
            match entry.references.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference. The last one flags the handle for cleanup and
    /// signals the janitor. Destroying a dead handle fails with `NotFound`.
    pub fn destroy(&self, id: HandleId) -> OsResult<()> {
        let entry = self.entry(id)?;
        let mut current = entry.references.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return Err(OsError::NotFound);
            }
            match entry.references.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 && !entry.cleanup.swap(true, Ordering::AcqRel) {
            log::debug!("handle: {} marked for cleanup", id);
            self.cleanup_signal.release();
        }
        Ok(())
    }

    /// The resource of a live handle.
    pub fn lookup(&self, id: HandleId) -> OsResult<Resource> {
        let entry = self.entry(id)?;
        if !entry.is_alive() {
            return Err(OsError::NotFound);
        }
        entry.resource.clone().ok_or(OsError::NotSupported)
    }

    /// The resource of a live handle of `kind`, as a `T`.
    pub fn lookup_as<T>(&self, id: HandleId, kind: HandleType) -> OsResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        if self.kind_of(id)? != kind {
            return Err(OsError::InvalidParameters);
        }
        self.lookup(id)?
            .downcast::<T>()
            .map_err(|_| OsError::InvalidParameters)
    }

    /// Type tag of a live handle.
    pub fn kind_of(&self, id: HandleId) -> OsResult<HandleType> {
        let entry = self.entry(id)?;
        if !entry.is_alive() {
            return Err(OsError::NotFound);
        }
        Ok(entry.kind)
    }

    /// Current reference count, while the handle is still in the table.
    pub fn references(&self, id: HandleId) -> Option<i32> {
        self.entry(id)
            .ok()
            .map(|entry| entry.references.load(Ordering::Acquire))
    }

    /// Gives a live handle a global path alias.
    pub fn register_path(&self, id: HandleId, path: &str) -> OsResult<()> {
        if path.is_empty() {
            return Err(OsError::InvalidParameters);
        }
        let slots = self.slots.lock();
        let entry = slots.get(id).filter(|entry| entry.is_alive());
        let Some(entry) = entry else {
            return Err(OsError::NotFound);
        };
        if slots
            .live()
            .any(|other| other.path.lock().as_deref() == Some(path))
        {
            return Err(OsError::AlreadyExists);
        }
        *entry.path.lock() = Some(String::from(path));
        Ok(())
    }

    /// Finds the live handle registered under `path`.
    pub fn lookup_by_path(&self, path: &str) -> OsResult<HandleId> {
        self.slots
            .lock()
            .live()
            .find(|entry| entry.path.lock().as_deref() == Some(path))
            .map(|entry| entry.id)
            .ok_or(OsError::NotFound)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.lock().live().count()
    }

    /// Returns `true` if no handle is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The semaphore the janitor sleeps on. One permit per flagged handle.
    pub fn cleanup_signal(&self) -> &Semaphore {
        &self.cleanup_signal
    }

    /// Removes every flagged handle from the table and returns them.
    pub(crate) fn drain_marked(&self) -> Vec<Arc<HandleEntry>> {
        let mut slots = self.slots.lock();
        let Slots { slots, free } = &mut *slots;
        let mut drained = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            let marked = slot
                .entry
                .as_ref()
                .is_some_and(|entry| entry.cleanup.load(Ordering::Acquire));
            if !marked {
                continue;
            }
            if let Some(entry) = slot.entry.take() {
                debug_assert_eq!(entry.references.load(Ordering::Acquire), 0);
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index as u32);
                drained.push(entry);
            }
        }
        drained
    }

    fn entry(&self, id: HandleId) -> OsResult<Arc<HandleEntry>> {
        self.slots.lock().get(id).cloned().ok_or(OsError::NotFound)
    }
}
