// SPDX-License-Identifier: MPL-2.0

//! External interfaces the embedding kernel injects: the per-CPU
//! reschedule timer, the cross-CPU reschedule IPI, and IRQ vector
//! reassignment. [`crate::time::Clock`] and [`crate::topology::Topology`]
//! are the other two; all five are passed in rather than discovered,
//! mirroring how the teacher's `aster_frame::arch` boundary is a set of
//! traits the platform layer implements, not something `aster-nix` reaches
//! out and probes for itself.

use crate::error::Result;
use crate::ids::{CpuId, IrqVector};
use crate::time::Duration;

/// Arms and disarms the one-shot timer that re-enters the scheduler when a
/// thread's quantum expires or its `eligible_time` arrives.
pub trait CpuTimer: Send + Sync {
    /// Arms `cpu`'s timer to fire `delay` from now, replacing any previously
    /// armed deadline.
    fn arm_oneshot(&self, cpu: CpuId, delay: Duration);
    fn cancel(&self, cpu: CpuId);
}

/// Cross-CPU notification: forces a CPU to re-enter the scheduler, e.g.
/// after a migration lands a higher-priority thread on it.
pub trait InterProcessorInterrupt: Send + Sync {
    fn send_reschedule(&self, cpu: CpuId);
}

/// Hands IRQ vector reassignment to the platform's interrupt controller.
pub trait IrqAssigner: Send + Sync {
    fn assign_io_interrupt_to_cpu(&self, irq: IrqVector, cpu: CpuId) -> Result<()>;
    fn current_cpu_of_interrupt(&self, irq: IrqVector) -> Option<CpuId>;
}
