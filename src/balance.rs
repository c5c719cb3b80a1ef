// SPDX-License-Identifier: MPL-2.0

//! The periodic load balancer: pair selection over the sharded load heaps,
//! mode-dependent target refinement, a big.LITTLE-aware imbalance gate,
//! benefit-scored candidate selection, and a commit phase that migrates the
//! winner and pokes the target CPU.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{LOAD_BALANCE_CANDIDATES, Tunables};
use crate::global::Globals;
use crate::iface::{InterProcessorInterrupt, IrqAssigner};
use crate::ids::{CoreId, CpuId};
use crate::irq;
use crate::mode::ModePolicy;
use crate::thread::{ThreadClass, ThreadState};
use crate::time::Instant;
use crate::topology::CoreType;

/// Runs one balancing pass and returns the number of migrations committed.
pub fn run_balance_cycle(
    globals: &Globals,
    mode: &dyn ModePolicy,
    ipi: &dyn InterProcessorInterrupt,
    irq_assigner: &dyn IrqAssigner,
    now: Instant,
) -> usize {
    // Phase 1: pick the most- and least-loaded core via the sharded heaps,
    // then let the active mode redirect the target before the imbalance
    // gate sees it.
    let Some(source) = globals.load_heaps.max_load(&globals.cores, |_| false) else {
        return 0;
    };
    let Some(target) = globals
        .load_heaps
        .min_load(&globals.cores, |c| c == source)
    else {
        return 0;
    };
    let target = refine_target(globals, mode, source, target);

    if !imbalance_gate(globals, source, target) {
        return 0;
    }

    let Some((thread, thief_cpu)) = pick_candidate(globals, source, target, now) else {
        return 0;
    };

    commit(globals, ipi, irq_assigner, &thread, thief_cpu, now);
    1
}

/// Phase 1 continued: redirects the least-loaded-core pick toward whichever
/// core the active mode prefers to receive work. Low-Latency steers away
/// from a Little target toward a Big or Uniform core when one is idle
/// enough to help; Power-Saving steers toward the current small-task core
/// so work keeps consolidating there, spilling to another Little core only
/// when the STC itself can't take it.
fn refine_target(globals: &Globals, mode: &dyn ModePolicy, source: CoreId, target: CoreId) -> CoreId {
    use crate::config::OperatingMode;

    match globals.mode() {
        OperatingMode::LowLatency => {
            if globals.core(target).core_type != CoreType::Little {
                return target;
            }
            let Some(preferred) = globals
                .load_heaps
                .min_load(&globals.cores, |c| {
                    c == source || globals.core(c).core_type == CoreType::Little
                })
            else {
                return target;
            };
            preferred
        }
        OperatingMode::PowerSaving => {
            let _ = mode;
            let Some(stc) = globals.small_task_core() else {
                return target;
            };
            if stc == source {
                return target;
            }
            if globals.core(stc).normalized_load() < 1000 {
                return stc;
            }
            let Some(spill) = globals.load_heaps.min_load(&globals.cores, |c| {
                c == source || globals.core(c).core_type != CoreType::Little
            }) else {
                return target;
            };
            spill
        }
    }
}

/// Phase 2: gate migration on a genuine, capacity-aware imbalance. A Little
/// core reporting high *normalized* load relative to a Big core isn't
/// necessarily worth balancing if the Big core is itself near its own
/// capacity.
fn imbalance_gate(globals: &Globals, source: CoreId, target: CoreId) -> bool {
    let tunables = *globals.tunables.lock();
    let source_load = globals.core(source).normalized_load();
    let target_load = globals.core(target).normalized_load();
    if source_load <= target_load {
        return false;
    }
    source_load - target_load >= tunables.load_difference * 10
}

struct Candidate {
    thread: Arc<ThreadState>,
    score: i64,
}

/// Phase 3: scores up to `LOAD_BALANCE_CANDIDATES` threads drawn from
/// `source`'s CPUs and returns the best-scoring one along with the target
/// CPU it should land on.
fn pick_candidate(
    globals: &Globals,
    source: CoreId,
    target: CoreId,
    now: Instant,
) -> Option<(Arc<ThreadState>, CpuId)> {
    let tunables = *globals.tunables.lock();
    let target_type = globals.core(target).core_type;
    let target_cpu = globals
        .core(target)
        .cpus
        .iter()
        .copied()
        .min_by_key(|c| globals.cpu(*c).load_permille())?;

    let mut pool: Vec<Arc<ThreadState>> = Vec::new();
    for &cpu in &globals.core(source).cpus {
        let rq = globals.cpu(cpu).run_queue.lock();
        pool.extend(rq.peek_k(LOAD_BALANCE_CANDIDATES));
    }

    let mut best: Option<Candidate> = None;
    for thread in pool {
        if thread.lock().last_migration_time + tunables.min_time_between_migrations > now {
            continue;
        }
        let Some(score) = benefit_score(&thread, target_type, target_cpu, globals, &tunables, now) else {
            continue;
        };
        if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
            best = Some(Candidate { thread, score });
        }
    }

    best.map(|c| (c.thread, target_cpu))
}

/// The benefit-score formula (Phase 3): combines lag and eligibility
/// urgency with a type-fit bonus, wake-affinity, an idle-target bonus, and
/// penalizes deep target queues and I/O-bound threads that would gain
/// little from relocation. The big.LITTLE rule doesn't suppress a
/// P-critical-thread-onto-Little migration outright; it's scored like any
/// other candidate and only discarded if that score fails to clear a
/// target-latency-derived bar, the escape hatch for the case where moving
/// it there is still better than leaving it starved on an overloaded core.
fn benefit_score(
    thread: &Arc<ThreadState>,
    target_type: CoreType,
    target_cpu: CpuId,
    globals: &Globals,
    tunables: &Tunables,
    now: Instant,
) -> Option<i64> {
    let inner = thread.lock();
    let class = ThreadState::classify(&inner);

    const K_LAG: i64 = 2;
    const K_ELIG: i64 = 1;
    let lag_term = K_LAG * (-inner.lag).max(0);
    let elig_wait_us = (now - inner.eligible_time).as_micros() as i64;
    let elig_term = K_ELIG * elig_wait_us;

    let type_bonus: i64 = match (class, target_type) {
        (ThreadClass::PCritical, CoreType::Big | CoreType::UniformPerformance) => 200,
        (ThreadClass::EPreferring, CoreType::Little) => 150,
        _ => 0,
    };

    let wake_affinity_bonus: i64 = if inner.previous_cpu == Some(target_cpu) {
        100
    } else {
        0
    };

    let target_core = globals.cpu(target_cpu).core;
    let idle_target_cpu_bonus: i64 = if globals.core(target_core).idle_cpu_count() > 0 {
        150
    } else {
        0
    };

    let queue_depth = globals.cpu(target_cpu).total_thread_count() as i64;
    let queue_penalty = 30 * queue_depth;

    let mut score = lag_term + elig_term + type_bonus + wake_affinity_bonus + idle_target_cpu_bonus
        - queue_penalty;

    // I/O-bound threads (short average run bursts) rarely benefit from
    // being relocated since they sleep again almost immediately.
    if inner.avg_run_burst_ewma.as_micros() < 200 {
        score /= 2;
    }

    // big.LITTLE suppression: a P-critical thread landing on a Little core
    // only goes through if the score clears a bar scaled off the target
    // latency, rather than being blocked outright.
    if class == ThreadClass::PCritical && target_type == CoreType::Little {
        let suppression_threshold = (tunables.target_latency.as_micros() / 2) as i64;
        if score <= suppression_threshold {
            return None;
        }
    }

    Some(score)
}

/// Phase 4: commits the migration, picking the least-loaded CPU within
/// `target`'s core by convention (ties favor the lowest `CpuId`), pokes the
/// destination with a reschedule IPI, and chases any IRQs the thread has
/// explicitly colocated.
fn commit(
    globals: &Globals,
    ipi: &dyn InterProcessorInterrupt,
    irq_assigner: &dyn IrqAssigner,
    thread: &Arc<ThreadState>,
    target_cpu: CpuId,
    now: Instant,
) {
    let old_cpu = thread.lock().cpu;
    if let Some(old_cpu) = old_cpu {
        globals.cpu(old_cpu).run_queue.lock().remove(thread.id);
    }
    thread.set_enqueued(false);

    {
        let mut inner = thread.lock();
        inner.previous_cpu = inner.cpu;
        inner.cpu = Some(target_cpu);
        inner.core = Some(globals.cpu(target_cpu).core);
        inner.last_migration_time = now;
    }

    globals.cpu(target_cpu).run_queue.lock().insert(thread.clone());
    thread.set_enqueued(true);

    ipi.send_reschedule(target_cpu);
    irq::follow_task(globals, irq_assigner, thread, target_cpu, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IrqVector, ThreadId};
    use crate::mode::low_latency::LowLatency;
    use crate::testutil;

    struct FakeIpi;
    impl InterProcessorInterrupt for FakeIpi {
        fn send_reschedule(&self, _cpu: CpuId) {}
    }
    struct FakeAssigner;
    impl IrqAssigner for FakeAssigner {
        fn assign_io_interrupt_to_cpu(&self, _irq: IrqVector, _cpu: CpuId) -> crate::error::Result<()> {
            Ok(())
        }
        fn current_cpu_of_interrupt(&self, _irq: IrqVector) -> Option<CpuId> {
            None
        }
    }

    #[test]
    fn migrates_from_busy_to_idle_core() {
        let globals = testutil::small_globals(1, 2, 1);
        globals.cpu(CpuId(0)).update_load(900, 1000);
        globals.cpu(CpuId(1)).update_load(50, 1000);
        globals.core(CoreId(0)).set_load_permille(900);
        globals.core(CoreId(1)).set_load_permille(50);

        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        {
            let mut inner = t.lock();
            inner.cpu = Some(CpuId(0));
            inner.core = Some(CoreId(0));
            inner.avg_run_burst_ewma = crate::time::Duration::from_millis(5);
            inner.eligible_time = Instant(0);
        }
        globals.cpu(CpuId(0)).run_queue.lock().insert(t.clone());
        t.set_enqueued(true);

        let ipi = FakeIpi;
        let assigner = FakeAssigner;
        let mode = LowLatency;
        let moved = run_balance_cycle(&globals, &mode, &ipi, &assigner, Instant(100_000));
        assert_eq!(moved, 1);
        assert_eq!(t.lock().cpu, Some(CpuId(1)));
    }
}
