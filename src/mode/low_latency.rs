// SPDX-License-Identifier: MPL-2.0

//! Low-Latency mode: favors cache affinity and spreads otherwise; prefers
//! Big/Uniform cores for P-critical tasks.

use super::ModePolicy;
use crate::global::Globals;
use crate::ids::CpuId;
use crate::thread::{Inner, ThreadState, ThreadClass};
use crate::time::{Duration, Instant};
use crate::topology::{CoreType, Topology};

/// Cache is considered warm if the thread slept less than this long, and
/// its previous core hasn't been busy for longer than `CACHE_EXPIRE_ACTIVITY`
/// since it slept.
const CACHE_EXPIRE_WALLCLOCK: Duration = Duration::from_micros(500);

pub struct LowLatency;

impl ModePolicy for LowLatency {
    fn name(&self) -> &'static str {
        "low-latency"
    }

    fn switch_to_mode(&self, _globals: &Globals) {
        log::debug!("switched to low-latency mode");
    }

    fn set_cpu_enabled(&self, _globals: &Globals, _cpu: CpuId, _enabled: bool) {}

    fn has_cache_expired(&self, _globals: &Globals, thread: &Inner, now: Instant) -> bool {
        now - thread.went_sleep > CACHE_EXPIRE_WALLCLOCK
    }

    fn choose_core(
        &self,
        globals: &Globals,
        topology: &dyn Topology,
        thread: &Inner,
        now: Instant,
    ) -> CpuId {
        if let (Some(prev), false) = (
            thread.previous_cpu,
            self.has_cache_expired(globals, thread, now),
        ) {
            if globals.is_cpu_enabled(prev) && thread.cpumask.contains(prev) {
                if let Some(sibling) = least_loaded_sibling(globals, topology, prev, thread) {
                    return sibling;
                }
            }
        }

        let class = ThreadState::classify(thread);
        if class == ThreadClass::PCritical {
            if let Some(cpu) = least_loaded_cpu_of_type(
                globals,
                topology,
                thread,
                |ty| matches!(ty, CoreType::Big | CoreType::UniformPerformance),
            ) {
                return cpu;
            }
        }

        least_loaded_cpu_of_type(globals, topology, thread, |_| true)
            .unwrap_or_else(|| fallback_cpu(globals, thread))
    }

    fn rebalance_irqs(&self, _globals: &Globals, _cpu: CpuId, _now_idle: bool) {}
}

fn least_loaded_sibling(
    globals: &Globals,
    topology: &dyn Topology,
    prev: CpuId,
    thread: &Inner,
) -> Option<CpuId> {
    let core = topology.core_of(prev);
    topology
        .cpus_of_core(core)
        .iter()
        .copied()
        .filter(|c| globals.is_cpu_enabled(*c) && thread.cpumask.contains(*c))
        .min_by_key(|c| globals.cpu(*c).load_permille())
}

fn least_loaded_cpu_of_type(
    globals: &Globals,
    topology: &dyn Topology,
    thread: &Inner,
    type_ok: impl Fn(CoreType) -> bool,
) -> Option<CpuId> {
    globals
        .cpus
        .iter()
        .filter(|c| {
            globals.is_cpu_enabled(c.id)
                && thread.cpumask.contains(c.id)
                && type_ok(topology.core_type(c.core))
                && thread.pinned_to_cpu.map(|p| p == c.id).unwrap_or(true)
        })
        .min_by_key(|c| c.load_permille())
        .map(|c| c.id)
}

fn fallback_cpu(globals: &Globals, thread: &Inner) -> CpuId {
    globals
        .cpus
        .iter()
        .find(|c| thread.cpumask.contains(c.id))
        .map(|c| c.id)
        .unwrap_or(CpuId(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;
    use crate::testutil;

    #[test]
    fn spreads_to_least_loaded_cpu() {
        let globals = testutil::small_globals(1, 2, 1);
        let topo = testutil::uniform_topology(1, 2, 1);
        globals.cpu(CpuId(0)).update_load(900, 1000);
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let inner = t.lock();
        let mode = LowLatency;
        let chosen = mode.choose_core(&globals, &topo, &inner, Instant(0));
        assert_eq!(chosen, CpuId(1));
    }
}
