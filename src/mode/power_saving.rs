// SPDX-License-Identifier: MPL-2.0

//! Power-Saving mode: multi-metric `choose_core` (M1-M5) and the sticky,
//! adaptive-hysteresis Small-Task Core (STC) designation.

use alloc::vec::Vec;

use super::ModePolicy;
use crate::global::Globals;
use crate::ids::{CoreId, CpuId};
use crate::thread::{Inner, ThreadClass, ThreadState};
use crate::time::{Duration, Instant};
use crate::topology::{CoreType, Topology};

const CACHE_EXPIRE_WALLCLOCK: Duration = Duration::from_millis(5);
const CACHE_EXPIRE_CORE_WORK: Duration = Duration::from_millis(50);

pub struct PowerSaving;

struct CoreScore {
    core: CoreId,
    score: i64,
    fully_idle: bool,
}

impl PowerSaving {
    fn score_core(
        &self,
        globals: &Globals,
        topology: &dyn Topology,
        thread: &Inner,
        core: CoreId,
        now: Instant,
    ) -> CoreScore {
        let entry = globals.core(core);
        let class = ThreadState::classify(thread);
        let mut score: i64 = 0;

        // M1: type match vs inferred task class.
        score += match (class, entry.core_type) {
            (ThreadClass::PCritical, CoreType::Big | CoreType::UniformPerformance) => 100,
            (ThreadClass::PCritical, CoreType::Little) => -100,
            (ThreadClass::EPreferring, CoreType::Little) => 100,
            (ThreadClass::EPreferring, CoreType::Big) => -50,
            _ => 0,
        };

        // M2: capacity adequacy.
        let current_load = entry.load_permille();
        let remaining = 1000u32.saturating_sub(current_load);
        let thread_load_permille = thread.load_pct as u32 * 10;
        if thread_load_permille <= remaining {
            score += (remaining as i64 * 50) / 1000;
        } else {
            score -= 100;
        }

        // M3: idle / low-load bonus.
        let fully_idle = entry.idle_cpu_count() as usize == entry.cpus.len();
        if fully_idle {
            score += 40;
        } else {
            score += (1000 - current_load as i64) / 25;
        }

        // M4: cache affinity.
        if let Some(prev) = thread.previous_cpu {
            if topology.core_of(prev) == core && now - thread.went_sleep <= CACHE_EXPIRE_WALLCLOCK {
                score += 60;
            }
        }

        // M5: current STC bonus, if it can still absorb this task.
        if globals.small_task_core() == Some(core) && thread_load_permille <= remaining {
            score += 150;
        }

        CoreScore {
            core,
            score,
            fully_idle,
        }
    }

    fn rank_cores(
        &self,
        globals: &Globals,
        topology: &dyn Topology,
        thread: &Inner,
        now: Instant,
    ) -> Vec<CoreScore> {
        let mut scores: Vec<CoreScore> = globals
            .cores
            .iter()
            .filter(|c| {
                !c.is_defunct()
                    && c.cpus.iter().any(|cpu| {
                        globals.is_cpu_enabled(*cpu) && thread.cpumask.contains(*cpu)
                    })
            })
            .map(|c| self.score_core(globals, topology, thread, c.id, now))
            .collect();
        scores.sort_by(|a, b| b.score.cmp(&a.score));
        scores
    }

    fn representative_cpu(&self, globals: &Globals, topology: &dyn Topology, core: CoreId, thread: &Inner) -> Option<CpuId> {
        topology
            .cpus_of_core(core)
            .iter()
            .copied()
            .filter(|c| globals.is_cpu_enabled(*c) && thread.cpumask.contains(*c))
            .min_by_key(|c| globals.cpu(*c).load_permille())
    }
}

impl ModePolicy for PowerSaving {
    fn name(&self) -> &'static str {
        "power-saving"
    }

    fn switch_to_mode(&self, _globals: &Globals) {
        log::debug!("switched to power-saving mode");
    }

    fn set_cpu_enabled(&self, globals: &Globals, cpu: CpuId, enabled: bool) {
        if enabled {
            return;
        }
        let Some(stc) = globals.small_task_core() else {
            return;
        };
        if !globals.core(stc).cpus.contains(&cpu) {
            return;
        }
        // The STC lost a CPU; hand the designation to another idle Little
        // core if one exists, otherwise leave it and let the next proactive
        // pass pick up the slack once `stc` reports itself defunct.
        if let Some(replacement) = globals
            .cores
            .iter()
            .find(|c| c.id != stc && !c.is_defunct() && c.normalized_load() == 0)
        {
            globals.try_set_small_task_core(Some(stc), replacement.id);
        }
    }

    fn has_cache_expired(&self, _globals: &Globals, thread: &Inner, now: Instant) -> bool {
        now - thread.went_sleep_active > CACHE_EXPIRE_CORE_WORK
    }

    fn choose_core(
        &self,
        globals: &Globals,
        topology: &dyn Topology,
        thread: &Inner,
        now: Instant,
    ) -> CpuId {
        let ranked = self.rank_cores(globals, topology, thread, now);

        // An idle "unwakeable" best-choice is replaced by the best active
        // alternative before falling back to waking it.
        if let Some(best) = ranked.first() {
            if best.fully_idle {
                if let Some(active_best) = ranked.iter().find(|c| !c.fully_idle) {
                    if let Some(cpu) =
                        self.representative_cpu(globals, topology, active_best.core, thread)
                    {
                        return cpu;
                    }
                }
            }
            if let Some(cpu) = self.representative_cpu(globals, topology, best.core, thread) {
                return cpu;
            }
        }

        globals
            .cpus
            .iter()
            .find(|c| thread.cpumask.contains(c.id))
            .map(|c| c.id)
            .unwrap_or(CpuId(0))
    }

    fn rebalance_irqs(&self, globals: &Globals, cpu: CpuId, now_idle: bool) {
        let _ = (globals, cpu, now_idle);
    }

    fn is_parked(&self, globals: &Globals, cpu: CpuId) -> bool {
        // A CPU that is not the STC and whose core is otherwise idle is
        // kept parked so consolidation can hold; it will still run
        // whatever the mode's `choose_core` actually assigns to it.
        let core = globals.cpu(cpu).core;
        match globals.small_task_core() {
            Some(stc) => core != stc && globals.core(core).idle_cpu_count() as usize == globals.core(core).cpus.len(),
            None => false,
        }
    }

    fn get_consolidation_target_core(&self, globals: &Globals) -> Option<CoreId> {
        globals.small_task_core()
    }

    /// Sticky STC designation with adaptive hysteresis: the candidate's
    /// score must beat the incumbent's by a margin that shrinks
    /// when the incumbent is heavily loaded or the candidate is completely
    /// idle, and grows when the incumbent is lightly loaded.
    fn designate_consolidation_core(&self, globals: &Globals, candidate: CoreId, now: Instant) {
        let _ = now;
        let incumbent = globals.small_task_core();
        let Some(incumbent_id) = incumbent else {
            globals.try_set_small_task_core(None, candidate);
            return;
        };
        if incumbent_id == candidate {
            return;
        }

        let incumbent_load = globals.core(incumbent_id).normalized_load();
        let candidate_load = globals.core(candidate).normalized_load();

        let base_margin: i64 = 150;
        let mut margin = base_margin;
        if incumbent_load > 700 {
            margin -= 80;
        }
        if candidate_load == 0 {
            margin -= 40;
        }
        if incumbent_load < 200 {
            margin += 80;
        }
        margin = margin.max(10);

        let incumbent_score = 1000 - incumbent_load as i64;
        let candidate_score = 1000 - candidate_load as i64;

        if candidate_score > incumbent_score + margin {
            let result = globals.try_set_small_task_core(Some(incumbent_id), candidate);
            log::debug!("STC redesignation attempt: candidate={candidate:?} result={result:?}");
        }
    }

    fn should_wake_core_for_load(&self, globals: &Globals, core: CoreId) -> bool {
        globals.core(core).normalized_load() > 0 || globals.small_task_core() == Some(core)
    }

    fn attempt_proactive_stc_designation(&self, globals: &Globals, topology: &dyn Topology, now: Instant) {
        if globals.small_task_core().is_some() {
            return;
        }
        let best = globals
            .cores
            .iter()
            .filter(|c| topology.core_type(c.id) == CoreType::Little && !c.is_defunct())
            .min_by_key(|c| c.normalized_load());
        if let Some(core) = best {
            self.designate_consolidation_core(globals, core.id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;
    use crate::testutil;

    #[test]
    fn small_load_thread_goes_to_little() {
        let globals = testutil::small_globals_big_little(1, 2);
        let topo = testutil::big_little_topology(1, 2, 1, 1);
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        {
            let mut inner = t.lock();
            inner.latency_nice = 10;
            inner.load_pct = 10;
        }
        let inner = t.lock();
        let mode = PowerSaving;
        let chosen = mode.choose_core(&globals, &topo, &inner, Instant(0));
        assert_eq!(topo.core_type(topo.core_of(chosen)), CoreType::Little);
    }

    #[test]
    fn urgent_heavy_thread_goes_to_big() {
        let globals = testutil::small_globals_big_little(1, 2);
        let topo = testutil::big_little_topology(1, 2, 1, 1);
        let t = ThreadState::new(ThreadId(2), crate::weight::PRIORITY_REALTIME_THRESHOLD, Instant(0));
        {
            let mut inner = t.lock();
            inner.load_pct = 80;
        }
        let inner = t.lock();
        let mode = PowerSaving;
        let chosen = mode.choose_core(&globals, &topo, &inner, Instant(0));
        assert_eq!(topo.core_type(topo.core_of(chosen)), CoreType::Big);
    }
}
