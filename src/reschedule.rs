// SPDX-License-Identifier: MPL-2.0

//! The reschedule / context-switch driver: the single entry point invoked
//! on quantum expiry, explicit yield, wake-up, CPU-disable, and a priority
//! change on the running thread. This is the unified version — the plain
//! path plus Mechanism A (task-contextual IRQ re-evaluation) in one driver,
//! not two textual copies.

use alloc::sync::Arc;

use crate::eevdf::{update_eevdf_parameters, EevdfContext};
use crate::global::Globals;
use crate::ids::CpuId;
use crate::iface::IrqAssigner;
use crate::irq;
use crate::mode::ModePolicy;
use crate::steal;
use crate::thread::{RunState, ThreadState};
use crate::time::{Duration, Instant};

/// What should happen to the thread that was running on `cpu` before this
/// reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    /// Still runnable; re-enqueue on the same CPU if affinity and enablement
    /// allow it.
    Ready,
    /// Blocked on I/O or explicitly slept.
    Waiting,
    /// Being destroyed.
    Dying,
}

/// The outcome of one reschedule: which thread the CPU should now run.
pub struct RescheduleOutcome {
    pub next: Arc<ThreadState>,
    pub slice: Duration,
    pub is_idle: bool,
}

/// Threshold for "load exceeds interference" in Mechanism A: a CPU whose
/// load exceeds this is considered busy enough that an extra IRQ would
/// interfere (~5% of max).
const IRQ_INTERFERENCE_THRESHOLD_PERMILLE: u32 = 50;

/// Runs the reschedule driver for `cpu`. `old` is the thread that was running
/// before this call (`None` if the CPU was idle), and `next_state`
/// describes what should happen to it.
#[allow(clippy::too_many_arguments)]
pub fn reschedule(
    globals: &Globals,
    mode: &dyn ModePolicy,
    assigner: &dyn IrqAssigner,
    cpu: CpuId,
    old: Option<Arc<ThreadState>>,
    next_state: NextState,
    now: Instant,
) -> RescheduleOutcome {
    if let Some(old) = &old {
        account_and_transition(globals, cpu, old, next_state, now);
    }

    let entry = globals.cpu(cpu);
    let chosen = {
        let rq = entry.run_queue.lock();
        rq.choose_next(now)
    };

    let outcome = match chosen {
        Some(next) => {
            let slice = next.lock().slice_duration;
            RescheduleOutcome {
                next,
                slice,
                is_idle: false,
            }
        }
        None => {
            if mode.is_parked(globals, cpu) {
                RescheduleOutcome {
                    next: entry.idle_thread.clone(),
                    slice: Duration::ZERO,
                    is_idle: true,
                }
            } else if let Some(stolen) = steal::try_steal(globals, cpu, now) {
                let slice = stolen.lock().slice_duration;
                RescheduleOutcome {
                    next: stolen,
                    slice,
                    is_idle: false,
                }
            } else {
                RescheduleOutcome {
                    next: entry.idle_thread.clone(),
                    slice: Duration::ZERO,
                    is_idle: true,
                }
            }
        }
    };

    // Mechanism A: chase interfering IRQs away from a highly
    // latency-sensitive next thread.
    if !outcome.is_idle {
        let sensitive = {
            let inner = outcome.next.lock();
            ThreadState::is_highly_latency_sensitive(&inner)
        };
        if sensitive {
            irq::task_contextual_reevaluation(
                globals,
                assigner,
                cpu,
                &outcome.next,
                IRQ_INTERFERENCE_THRESHOLD_PERMILLE,
                now,
            );
        }
    }

    outcome
}

fn account_and_transition(
    globals: &Globals,
    cpu: CpuId,
    old: &Arc<ThreadState>,
    next_state: NextState,
    now: Instant,
) {
    if Arc::ptr_eq(old, &globals.cpu(cpu).idle_thread) {
        return;
    }

    let mut inner = old.lock();
    let actual_runtime = inner.time_used_in_current_quantum;
    inner.time_used_in_current_quantum = Duration::ZERO;

    if next_state == NextState::Waiting {
        // I/O-bound heuristic: EWMA of run bursts, voluntary-sleep counter.
        let prev = inner.avg_run_burst_ewma.as_micros() as u128;
        let sample = actual_runtime.as_micros() as u128;
        let next = ((sample * 300) + (prev * 700)) / 1000;
        inner.avg_run_burst_ewma = Duration::from_micros(next as u64);
        inner.voluntary_sleep_transitions += 1;
        inner.went_sleep = now;
    }

    let core_capacity = inner
        .core
        .map(|c| globals.core(c).performance_capacity)
        .unwrap_or(crate::config::NOMINAL_CAPACITY);
    let weight = inner.weight.max(1);
    let weighted_runtime = (actual_runtime.as_micros() as u128 * core_capacity as u128
        * crate::config::WEIGHT_SCALE as u128)
        / (crate::config::NOMINAL_CAPACITY as u128 * weight as u128);
    inner.vruntime = inner.vruntime.saturating_add(weighted_runtime as u64);
    inner.lag -= weighted_runtime as i64;

    // Rolling estimate of load: fraction of the quantum actually used.
    if inner.slice_duration.as_micros() > 0 {
        let pct = ((actual_runtime.as_micros() * 100) / inner.slice_duration.as_micros()).min(100);
        inner.load_pct = (((pct as u32) + 3 * inner.load_pct as u32) / 4) as u8;
    }

    match next_state {
        NextState::Ready => {
            inner.state = RunState::Ready;
            // Re-derive the entitlement, eligibility, and deadline for the
            // slice this thread is about to contend for next, the
            // same recomputation a fresh placement gets — otherwise a
            // thread that just ran would keep its stale (and now smallest)
            // deadline and monopolize the CPU.
            let active_thread_estimate = globals.cpu(cpu).total_thread_count().max(1) as u32;
            let ctx = EevdfContext {
                now,
                min_vruntime: globals.global_min_vruntime(),
                core_capacity,
                active_thread_estimate,
                is_new_or_relocated: false,
            };
            update_eevdf_parameters(&mut inner, &ctx, &globals.tunables.lock());
        }
        NextState::Waiting => {
            inner.state = RunState::Waiting;
            drop(inner);
            globals.cpu(cpu).run_queue.lock().remove(old.id);
            old.set_enqueued(false);
            return;
        }
        NextState::Dying => {
            inner.state = RunState::Dying;
            drop(inner);
            globals.cpu(cpu).run_queue.lock().remove(old.id);
            old.set_enqueued(false);
            return;
        }
    }
    drop(inner);
    globals.cpu(cpu).run_queue.lock().update(old.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eevdf::{update_eevdf_parameters, EevdfContext};
    use crate::ids::{CoreId, IrqVector, ThreadId};
    use crate::mode::low_latency::LowLatency;
    use crate::testutil;

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
    fn idle_runs_when_queue_empty() {
        let globals = testutil::small_globals(1, 1, 1);
        let mode = LowLatency;
        let assigner = FakeAssigner;
        let out = reschedule(&globals, &mode, &assigner, CpuId(0), None, NextState::Ready, Instant(0));
        assert!(out.is_idle);
    }

    #[test]
    fn selects_smallest_deadline_thread() {
        let globals = testutil::small_globals(1, 1, 1);
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        {
            let mut inner = t.lock();
            inner.cpu = Some(CpuId(0));
            inner.core = Some(CoreId(0));
            let ctx = EevdfContext {
                now: Instant(0),
                min_vruntime: 0,
                core_capacity: 1024,
                active_thread_estimate: 1,
                is_new_or_relocated: true,
            };
            update_eevdf_parameters(&mut inner, &ctx, &globals.tunables.lock());
        }
        globals.cpu(CpuId(0)).run_queue.lock().insert(t.clone());
        t.set_enqueued(true);

        let mode = LowLatency;
        let assigner = FakeAssigner;
        let out = reschedule(&globals, &mode, &assigner, CpuId(0), None, NextState::Ready, Instant(0));
        assert!(!out.is_idle);
        assert_eq!(out.next.id, ThreadId(1));
    }
}
