//! Interrupt-disabling guard and spinlock.
//!
//! Scheduler state is touched from interrupt context (timer ticks, wake-ups
//! from handlers), so every lock on it must also mask interrupts on the
//! holding CPU. Otherwise a handler could spin on a lock its own CPU holds.

use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};

use vali_hal::Platform;

/// Disables interrupts on construction and restores the saved state on drop.
pub struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    were_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    /// Saves the interrupt flag of the calling CPU and disables interrupts.
    pub fn new(platform: &'a dyn Platform) -> Self {
        let were_enabled = platform.are_enabled();
        platform.disable();
        IrqGuard {
            platform,
            were_enabled,
        }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.platform.enable();
        }
    }
}

/// A `spin::Mutex` whose guard also keeps interrupts disabled.
pub struct IrqSpinLock<T> {
    platform: Arc<dyn Platform>,
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    /// Creates a new lock around `value`.
    pub fn new(platform: Arc<dyn Platform>, value: T) -> Self {
        IrqSpinLock {
            platform,
            inner: spin::Mutex::new(value),
        }
    }

    /// Disables interrupts, then spins until the lock is free.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new(&*self.platform);
        IrqSpinLockGuard {
            inner: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Attempts the lock once. Interrupts are left as they were on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new(&*self.platform);
        let inner = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { inner, _irq: irq })
    }
}

/// Guard of an [`IrqSpinLock`].
///
/// Field order matters: the spinlock is released before interrupts are
/// restored.
pub struct IrqSpinLockGuard<'a, T> {
    inner: spin::MutexGuard<'a, T>,
    _irq: IrqGuard<'a>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
