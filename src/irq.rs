// SPDX-License-Identifier: MPL-2.0

//! IRQ balancing: the periodic proactive balancer, task-contextual
//! re-evaluation run from the reschedule driver ("Mechanism A"), the
//! IRQ-task colocation map, and IRQ-follow-task after a migration.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Result, ScheduleErrorKind};
use crate::global::Globals;
use crate::ids::{CpuId, IrqVector, ThreadId};
use crate::iface::IrqAssigner;
use crate::thread::ThreadState;
use crate::time::Instant;

/// Per-IRQ "how busy is it" sample, injected by the caller rather than
/// measured by this crate: IRQ load accounting lives in the platform's
/// interrupt controller.
pub struct IrqLoadSample {
    pub irq: IrqVector,
    pub cpu: CpuId,
    pub load_permille: u32,
}

/// Mechanism A: when a highly latency-sensitive thread
/// is about to run on `cpu`, chase away whichever IRQ is currently sitting
/// on `cpu` if it interferes and isn't explicitly colocated with `next`,
/// and pull any IRQ `next` *does* want colocated back onto `cpu`.
/// `threshold_permille` is compared against `cpu`'s own load as a coarse
/// proxy for "this CPU is busy enough that an extra IRQ would interfere",
/// since the crate doesn't track per-IRQ load outside of periodic samples.
pub fn task_contextual_reevaluation(
    globals: &Globals,
    assigner: &dyn IrqAssigner,
    cpu: CpuId,
    next: &Arc<ThreadState>,
    threshold_permille: u32,
    now: Instant,
) {
    let tunables = *globals.tunables.lock();
    let now_us = now.as_micros();

    let pinned: Vec<IrqVector> = next.lock().affinitized_irqs.iter().collect();
    for irq in &pinned {
        if assigner.current_cpu_of_interrupt(*irq) == Some(cpu) {
            continue;
        }
        if globals.try_acquire_irq_cooldown(*irq, now_us, tunables.irq_move_cooldown.as_micros()) {
            let _ = assigner.assign_io_interrupt_to_cpu(*irq, cpu);
        }
    }

    if globals.cpu(cpu).load_permille() < threshold_permille {
        return;
    }
    let Some(target) = least_loaded_sibling_cpu(globals, cpu) else {
        return;
    };
    if target == cpu {
        return;
    }
    // Move every IRQ on `cpu` not pinned to `next` away, subject to cooldown.
    for candidate in candidate_irqs_on(globals, assigner, cpu) {
        if pinned.contains(&candidate) {
            continue;
        }
        if globals.try_acquire_irq_cooldown(candidate, now_us, tunables.irq_move_cooldown.as_micros()) {
            let _ = assigner.assign_io_interrupt_to_cpu(candidate, target);
        }
    }
}

/// Best-effort enumeration of IRQs currently on `cpu`, limited to IRQs this
/// crate already knows about through the colocation map (the platform is
/// the source of truth for the full IRQ table).
fn candidate_irqs_on(globals: &Globals, assigner: &dyn IrqAssigner, cpu: CpuId) -> Vec<IrqVector> {
    globals
        .irq_colocation
        .lock()
        .keys()
        .copied()
        .filter(|irq| assigner.current_cpu_of_interrupt(*irq) == Some(cpu))
        .collect()
}

/// Periodic proactive IRQ balancer: given live load samples for a
/// batch of IRQs, moves the busiest ones off their current CPU toward a
/// less-loaded CPU in the same core, subject to the per-IRQ cooldown and
/// `max_irqs_per_cycle`.
pub fn rebalance_irqs_from_samples(
    globals: &Globals,
    assigner: &dyn IrqAssigner,
    samples: &[IrqLoadSample],
    now: Instant,
) {
    let tunables = *globals.tunables.lock();
    let now_us = now.as_micros();

    let mut moved = 0usize;
    let mut busiest: Vec<&IrqLoadSample> = samples
        .iter()
        .filter(|s| s.load_permille >= tunables.irq_high_absolute_threshold * 10)
        .collect();
    busiest.sort_by(|a, b| b.load_permille.cmp(&a.load_permille));

    for sample in busiest {
        if moved >= tunables.max_irqs_per_cycle {
            break;
        }
        let Some(target) = least_loaded_sibling_cpu(globals, sample.cpu) else {
            continue;
        };
        if target == sample.cpu {
            continue;
        }
        let current_load = globals.cpu(sample.cpu).load_permille();
        let target_load = globals.cpu(target).load_permille();
        if current_load.saturating_sub(target_load) < tunables.irq_significant_difference * 10 {
            continue;
        }
        if !globals.try_acquire_irq_cooldown(sample.irq, now_us, tunables.irq_move_cooldown.as_micros()) {
            continue;
        }
        if assigner
            .assign_io_interrupt_to_cpu(sample.irq, target)
            .is_ok()
        {
            moved += 1;
        }
    }
}

/// IRQ-follow-task: after a thread with explicitly colocated IRQs
/// migrates, chase those IRQs to the thread's new CPU.
pub fn follow_task(
    globals: &Globals,
    assigner: &dyn IrqAssigner,
    thread: &ThreadState,
    new_cpu: CpuId,
    now: Instant,
) {
    let tunables = *globals.tunables.lock();
    let now_us = now.as_micros();
    let irqs: Vec<IrqVector> = thread.lock().affinitized_irqs.iter().collect();
    for irq in irqs {
        if assigner.current_cpu_of_interrupt(irq) == Some(new_cpu) {
            continue;
        }
        if !globals.try_acquire_irq_cooldown(irq, now_us, tunables.irq_move_cooldown.as_micros()) {
            continue;
        }
        let _ = assigner.assign_io_interrupt_to_cpu(irq, new_cpu);
    }
}

/// Records or clears a thread's explicit IRQ colocation, enforcing the
/// `MAX_AFFINITIZED_IRQS` cap.
pub fn set_colocation(
    globals: &Globals,
    thread: &ThreadState,
    irq: IrqVector,
    colocate: bool,
) -> Result<()> {
    let mut inner = thread.lock();
    if colocate {
        if !inner.affinitized_irqs.push(irq) {
            return Err(ScheduleErrorKind::OutOfMemory.into());
        }
        globals.irq_colocation.lock().insert(irq, thread.id);
    } else {
        inner.affinitized_irqs.remove(irq);
        let mut map = globals.irq_colocation.lock();
        if map.get(&irq) == Some(&thread.id) {
            map.remove(&irq);
        }
    }
    Ok(())
}

/// Drops every colocation entry for a thread being destroyed, so a stale
/// `ThreadId` never lingers in the map.
pub fn clear_thread_colocations(globals: &Globals, thread: &ThreadId) {
    globals.irq_colocation.lock().retain(|_, tid| *tid != *thread);
}

fn least_loaded_sibling_cpu(globals: &Globals, cpu: CpuId) -> Option<CpuId> {
    let core = globals.cpu(cpu).core;
    globals
        .core(core)
        .cpus
        .iter()
        .copied()
        .filter(|c| globals.is_cpu_enabled(*c))
        .min_by_key(|c| globals.cpu(*c).load_permille())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    struct FakeAssigner;
    impl IrqAssigner for FakeAssigner {
        fn assign_io_interrupt_to_cpu(&self, _irq: IrqVector, _cpu: CpuId) -> Result<()> {
            Ok(())
        }
        fn current_cpu_of_interrupt(&self, _irq: IrqVector) -> Option<CpuId> {
            None
        }
    }

    #[test]
    fn rebalance_moves_busiest_irq_off_loaded_cpu() {
        let globals = testutil::small_globals(1, 1, 2);
        globals.cpu(CpuId(0)).update_load(950, 1000);
        globals.cpu(CpuId(1)).update_load(50, 1000);
        let samples = [IrqLoadSample {
            irq: IrqVector(7),
            cpu: CpuId(0),
            load_permille: 900,
        }];
        let assigner = FakeAssigner;
        rebalance_irqs_from_samples(&globals, &assigner, &samples, Instant(10_000));
        // No panics, and the cooldown was actually claimed.
        assert!(!globals.try_acquire_irq_cooldown(IrqVector(7), 10_000, 50_000));
    }

    #[test]
    fn set_colocation_respects_capacity() {
        let globals = testutil::small_globals(1, 1, 1);
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        for i in 0..crate::config::MAX_AFFINITIZED_IRQS {
            set_colocation(&globals, &t, IrqVector(i as u32), true).unwrap();
        }
        assert!(set_colocation(&globals, &t, IrqVector(999), true).is_err());
    }
}
