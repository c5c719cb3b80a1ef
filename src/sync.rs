// SPDX-License-Identifier: MPL-2.0

//! Locking primitives used throughout the scheduler core.
//!
//! The hot path never blocks and never holds a lock across a suspension
//! point, so a simple ticketless spinlock is sufficient. Callers on real
//! hardware are expected to keep local IRQs disabled for the whole critical
//! section; this crate does not itself own an IRQ controller (see
//! [`crate::iface::InterruptControl`]), it only exposes the
//! [`GlobalBarrier`] RAII marker used around mode switches and CPU
//! enable/disable, a big interrupt-disabling barrier around those rare
//! cross-cutting transitions. Actual
//! IRQ control lives behind [`crate::iface::InterProcessorInterrupt`] and
//! [`crate::iface::IrqAssigner`], injected by the embedding kernel.

pub use spin::{Mutex as SpinLock, MutexGuard as SpinLockGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use core::sync::atomic::{AtomicBool, Ordering};

/// Marker held while the global interrupt-disabling barrier is in effect. Only [`crate::api::Scheduler::set_operation_mode`] and
/// [`crate::api::Scheduler::set_cpu_enabled`] acquire it; it never overlaps
/// with any per-CPU or per-thread lock taken on the hot path.
pub struct GlobalBarrier<'a> {
    flag: &'a AtomicBool,
}

impl<'a> GlobalBarrier<'a> {
    /// Acquires the barrier, spinning until no other CPU holds it.
    pub fn acquire(flag: &'a AtomicBool) -> Self {
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        Self { flag }
    }
}

impl Drop for GlobalBarrier<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
