// SPDX-License-Identifier: MPL-2.0

//! The operating-mode policy layer: Low-Latency vs Power-Saving, represented
//! as a `&'static dyn ModePolicy` trait object, the same shape
//! as `aster_frame::task::scheduler::Scheduler` in the teacher repository —
//! installed once via [`crate::api::Scheduler::set_operation_mode`] rather
//! than matched on a tagged enum at every call site.

pub mod low_latency;
pub mod power_saving;

use crate::global::Globals;
use crate::ids::{CoreId, CpuId};
use crate::thread::Inner;
use crate::time::Instant;
use crate::topology::Topology;

/// The capability set every mode must provide.
pub trait ModePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sets mode-specific knobs; called once on transition into this mode.
    fn switch_to_mode(&self, globals: &Globals);

    /// Invalidates consolidation state (e.g. the STC) if the disabled CPU
    /// was load-bearing for it.
    fn set_cpu_enabled(&self, globals: &Globals, cpu: CpuId, enabled: bool);

    /// Per-thread cache-affinity timeout.
    fn has_cache_expired(&self, globals: &Globals, thread: &Inner, now: Instant) -> bool;

    /// Picks a home core for a waking / newly-placed thread.
    fn choose_core(
        &self,
        globals: &Globals,
        topology: &dyn Topology,
        thread: &Inner,
        now: Instant,
    ) -> CpuId;

    /// Called when a CPU enters or leaves idle.
    fn rebalance_irqs(&self, globals: &Globals, cpu: CpuId, now_idle: bool);

    /// Whether `cpu` is "effectively parked" and should not attempt
    /// work-stealing when its queue is empty. Low-Latency never parks a
    /// CPU; Power-Saving may park a CPU it is trying to keep
    /// idle for consolidation.
    fn is_parked(&self, globals: &Globals, cpu: CpuId) -> bool {
        let _ = (globals, cpu);
        false
    }

    /// Power-Saving-only consolidation helpers; default to no-ops/None so
    /// Low-Latency need not implement them.
    fn get_consolidation_target_core(&self, globals: &Globals) -> Option<CoreId> {
        let _ = globals;
        None
    }

    fn designate_consolidation_core(&self, globals: &Globals, candidate: CoreId, now: Instant) {
        let _ = (globals, candidate, now);
    }

    fn should_wake_core_for_load(&self, globals: &Globals, core: CoreId) -> bool {
        let _ = (globals, core);
        true
    }

    fn attempt_proactive_stc_designation(&self, globals: &Globals, topology: &dyn Topology, now: Instant) {
        let _ = (globals, topology, now);
    }
}
