//! Provides the spin-lock implementation.

use core::sync::atomic::{AtomicBool, Ordering};
use crate::base::irq;


/// A spin lock object works like the C type, it only provides the lock semantic but
/// does not manage any data.
///
/// Allocator paths must not sleep, so the only acquisition style offered is
/// spinning; the `irq_save` pair additionally masks local interrupts for the
/// duration of the critical section.
#[repr(C)]
pub struct SpinLockPure {
    lock: AtomicBool,
}

impl SpinLockPure {
    #[inline]
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        while self.lock.compare_exchange_weak(
            false, true, Ordering::AcqRel, Ordering::Relaxed).is_err() {}
    }

    #[inline]
    pub fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Disable local interrupts, then take the lock. Returns the saved IRQ
    /// state to pass back to [`unlock_irq_restore`].
    ///
    /// [`unlock_irq_restore`]: Self::unlock_irq_restore
    #[inline]
    pub fn lock_irq_save(&self) -> usize {
        let flags = irq::local_irq_save();
        self.lock();
        flags
    }

    /// Release the lock and restore the IRQ state saved by [`lock_irq_save`].
    ///
    /// [`lock_irq_save`]: Self::lock_irq_save
    #[inline]
    pub fn unlock_irq_restore(&self, flags: usize) {
        self.unlock();
        irq::local_irq_restore(flags);
    }
}
