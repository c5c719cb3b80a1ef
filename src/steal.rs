// SPDX-License-Identifier: MPL-2.0

//! Work-stealing: probes SMT siblings first, then the rest of the package,
//! then other packages, subject to per-thief/per-victim cooldowns and the
//! big.LITTLE allow/deny matrix.

use alloc::sync::Arc;

use crate::global::Globals;
use crate::ids::CpuId;
use crate::thread::{ThreadClass, ThreadState};
use crate::time::{Duration, Instant};
use crate::topology::CoreType;

/// A stolen thread must have at least this much nominal work left in its
/// current quantum, or stealing it just relocates it a moment before it
/// would have yielded anyway: a starvation guard that skips threads with
/// less than ~0.5ms of nominal work remaining.
const MIN_REMAINING_WORK: Duration = Duration::from_micros(500);

/// Attempts to steal one runnable thread onto `cpu`, which is about to go
/// idle. Returns `None` if the thief's own cooldown hasn't elapsed, or no
/// eligible victim is found in any probe tier.
pub fn try_steal(globals: &Globals, cpu: CpuId, now: Instant) -> Option<Arc<ThreadState>> {
    let thief = globals.cpu(cpu);
    if thief.next_steal_attempt_time() > now {
        return None;
    }

    let tunables = *globals.tunables.lock();
    let thief_core = thief.core;
    let thief_type = globals.core(thief_core).core_type;
    let thief_package = globals.core(thief_core).package;

    let smt_siblings = globals
        .core(thief_core)
        .cpus
        .iter()
        .copied()
        .filter(|&c| c != cpu);

    // Tier 1: SMT siblings.
    if let Some(stolen) = probe_cpus(globals, smt_siblings, cpu, thief_type, &tunables, now) {
        thief.set_next_steal_attempt_time(now + tunables.thief_success_cooldown);
        return Some(stolen);
    }

    // Tier 2: other cores in the same package.
    let same_package_cores: alloc::vec::Vec<_> = globals.packages[thief_package.index()]
        .cores
        .iter()
        .copied()
        .filter(|&c| c != thief_core)
        .collect();
    for core in same_package_cores {
        let cpus: alloc::vec::Vec<CpuId> = globals.core(core).cpus.clone();
        if let Some(stolen) = probe_cpus(globals, cpus.into_iter(), cpu, thief_type, &tunables, now) {
            thief.set_next_steal_attempt_time(now + tunables.thief_success_cooldown);
            return Some(stolen);
        }
    }

    // Tier 3: every other package.
    for package in &globals.packages {
        if package.id == thief_package {
            continue;
        }
        for &core in &package.cores {
            let cpus: alloc::vec::Vec<CpuId> = globals.core(core).cpus.clone();
            if let Some(stolen) = probe_cpus(globals, cpus.into_iter(), cpu, thief_type, &tunables, now)
            {
                thief.set_next_steal_attempt_time(now + tunables.thief_success_cooldown);
                return Some(stolen);
            }
        }
    }

    thief.set_next_steal_attempt_time(now + tunables.thief_failure_cooldown);
    None
}

fn probe_cpus(
    globals: &Globals,
    candidates: impl Iterator<Item = CpuId>,
    thief_cpu: CpuId,
    thief_type: CoreType,
    tunables: &crate::config::Tunables,
    now: Instant,
) -> Option<Arc<ThreadState>> {
    for victim_cpu in candidates {
        if !globals.is_cpu_enabled(victim_cpu) {
            continue;
        }
        let victim = globals.cpu(victim_cpu);
        if victim.last_stolen_from_time() + tunables.victim_cooldown > now {
            continue;
        }

        let mut rq = victim.run_queue.lock();
        if rq.count() < 2 {
            // Never steal the victim's only thread.
            continue;
        }

        let candidates = rq.peek_k(crate::config::LOAD_BALANCE_CANDIDATES);
        let chosen = candidates.into_iter().find(|t| {
            let inner = t.lock();
            let remaining = inner.slice_duration.saturating_sub(inner.time_used_in_current_quantum);
            remaining >= MIN_REMAINING_WORK && allowed(thief_type, ThreadState::classify(&inner))
        });

        if let Some(thread) = chosen {
            rq.remove(thread.id);
            drop(rq);
            thread.set_enqueued(false);
            {
                let mut inner = thread.lock();
                inner.previous_cpu = inner.cpu;
                inner.cpu = Some(thief_cpu);
                inner.core = Some(globals.cpu(thief_cpu).core);
                inner.last_migration_time = now;
            }
            victim.set_last_stolen_from_time(now);
            return Some(thread);
        }
    }
    None
}

/// big.LITTLE allow/deny matrix: a Little thief may only take
/// efficiency-preferring or flexible work, never a P-critical thread that
/// needs a Big/Uniform core; a Big/Uniform thief may steal anything.
fn allowed(thief_type: CoreType, victim_class: ThreadClass) -> bool {
    match thief_type {
        CoreType::Little => !matches!(victim_class, ThreadClass::PCritical),
        CoreType::Big | CoreType::UniformPerformance | CoreType::Unknown => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;
    use crate::testutil;

    #[test]
    fn steals_from_busiest_sibling() {
        let globals = testutil::small_globals(1, 1, 2);
        let victim_cpu = CpuId(1);
        let a = ThreadState::new(ThreadId(1), 120, Instant(0));
        let b = ThreadState::new(ThreadId(2), 120, Instant(0));
        for t in [&a, &b] {
            let mut inner = t.lock();
            inner.cpu = Some(victim_cpu);
            inner.core = Some(core_id_for(&globals, victim_cpu));
            inner.slice_duration = Duration::from_millis(4);
            inner.time_used_in_current_quantum = Duration::ZERO;
            inner.eligible_time = Instant(0);
        }
        {
            let mut rq = globals.cpu(victim_cpu).run_queue.lock();
            rq.insert(a.clone());
            rq.insert(b.clone());
        }
        a.set_enqueued(true);
        b.set_enqueued(true);

        let stolen = try_steal(&globals, CpuId(0), Instant(0));
        assert!(stolen.is_some());
    }

    fn core_id_for(globals: &Globals, cpu: CpuId) -> crate::ids::CoreId {
        globals.cpu(cpu).core
    }
}
