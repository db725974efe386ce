//! CPU interrupt mask handling.

use crate::arch::cpu;

/// Disable the current IRQ and return the last IRQ state.
#[inline(always)]
pub fn local_irq_save() -> usize {
    cpu::sstatus_cli_save()
}

/// Restore saved IRQ state.
#[inline(always)]
pub fn local_irq_restore(flags: usize) {
    cpu::sstatus_write(flags);
}
