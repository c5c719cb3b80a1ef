// SPDX-License-Identifier: MPL-2.0

//! The scheduler's single public entry point, analogous to how
//! `aster_frame::task::scheduler::GlobalScheduler` is the one thing
//! `aster-nix` talks to: owns the globals and every injected collaborator,
//! and exposes the exported operations as inherent methods.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::OperatingMode;
use crate::core_entry::{CoreEntry, PackageEntry};
use crate::cpu_entry::CpuEntry;
use crate::eevdf::{update_eevdf_parameters, EevdfContext};
use crate::error::{Result, ScheduleErrorKind};
use crate::global::Globals;
use crate::iface::{CpuTimer, InterProcessorInterrupt, IrqAssigner};
use crate::ids::{CpuId, IrqVector};
use crate::irq;
use crate::mode::low_latency::LowLatency;
use crate::mode::power_saving::PowerSaving;
use crate::mode::ModePolicy;
use crate::reschedule::{self, NextState, RescheduleOutcome};
use crate::thread::ThreadState;
use crate::time::{Clock, Duration, Instant};
use crate::topology::Topology;
use crate::weight::{self, PRIORITY_IDLE, PRIORITY_MAX};

static LOW_LATENCY: LowLatency = LowLatency;
static POWER_SAVING: PowerSaving = PowerSaving;

const LATENCY_NICE_MIN: i8 = -20;
const LATENCY_NICE_MAX: i8 = 19;

/// Every collaborator the embedding kernel injects at construction time.
/// Bundled into one struct so `Scheduler::new` takes one argument instead
/// of five.
pub struct Collaborators {
    pub topology: Box<dyn Topology>,
    pub clock: Box<dyn Clock>,
    pub timer: Box<dyn CpuTimer>,
    pub ipi: Box<dyn InterProcessorInterrupt>,
    pub irq_assigner: Box<dyn IrqAssigner>,
}

/// The crate's single public entry point.
pub struct Scheduler {
    globals: Globals,
    collaborators: Collaborators,
}

impl Scheduler {
    pub fn new(
        cpus: Vec<CpuEntry>,
        cores: Vec<CoreEntry>,
        packages: Vec<PackageEntry>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            globals: Globals::new(cpus, cores, packages),
            collaborators,
        }
    }

    fn mode_policy(&self) -> &'static dyn ModePolicy {
        match self.globals.mode() {
            OperatingMode::LowLatency => &LOW_LATENCY,
            OperatingMode::PowerSaving => &POWER_SAVING,
        }
    }

    fn now(&self) -> Instant {
        self.collaborators.clock.now()
    }

    /// Places a newly-runnable (or woken) thread onto its chosen CPU's run
    /// queue.
    pub fn enqueue_in_run_queue(&self, thread: Arc<ThreadState>) -> Result<()> {
        if thread.is_enqueued() {
            return Ok(());
        }
        let now = self.now();
        let mode = self.mode_policy();

        let cpu = {
            let inner = thread.lock();
            mode.choose_core(&self.globals, self.collaborators.topology.as_ref(), &inner, now)
        };
        if !self.globals.is_cpu_enabled(cpu) {
            return Err(ScheduleErrorKind::InvalidArgument.into());
        }
        let core = self.globals.cpu(cpu).core;
        let core_capacity = self.globals.core(core).performance_capacity;
        let active_thread_estimate = self.globals.core(core).cpus.iter()
            .map(|c| self.globals.cpu(*c).total_thread_count() as u32)
            .sum::<u32>()
            .saturating_add(1);

        {
            let mut inner = thread.lock();
            let is_new_or_relocated = inner.core != Some(core);
            inner.cpu = Some(cpu);
            inner.core = Some(core);
            let ctx = EevdfContext {
                now,
                min_vruntime: self.globals.global_min_vruntime(),
                core_capacity,
                active_thread_estimate,
                is_new_or_relocated,
            };
            update_eevdf_parameters(&mut inner, &ctx, &self.globals.tunables.lock());
        }

        self.globals.cpu(cpu).run_queue.lock().insert(thread.clone());
        thread.set_enqueued(true);
        self.collaborators
            .timer
            .arm_oneshot(cpu, thread.lock().slice_duration);
        Ok(())
    }

    /// Runs the reschedule driver for `cpu` and arms its timer for the
    /// resulting slice.
    pub fn reschedule(
        &self,
        cpu: CpuId,
        old: Option<Arc<ThreadState>>,
        next_state: NextState,
    ) -> Result<RescheduleOutcome> {
        if !self.globals.is_cpu_enabled(cpu) {
            return Err(ScheduleErrorKind::InvalidArgument.into());
        }
        let now = self.now();
        let outcome = reschedule::reschedule(
            &self.globals,
            self.mode_policy(),
            self.collaborators.irq_assigner.as_ref(),
            cpu,
            old,
            next_state,
            now,
        );
        if outcome.is_idle {
            self.collaborators.timer.cancel(cpu);
        } else {
            self.collaborators.timer.arm_oneshot(cpu, outcome.slice);
        }
        Ok(outcome)
    }

    /// Changes a thread's base priority, recomputing its weight and EEVDF
    /// parameters in place.
    pub fn set_thread_priority(&self, thread: &Arc<ThreadState>, priority: i32) -> Result<()> {
        if !(PRIORITY_IDLE..=PRIORITY_MAX).contains(&priority) {
            return Err(ScheduleErrorKind::InvalidArgument.into());
        }
        let now = self.now();
        let (core, cpu) = {
            let mut inner = thread.lock();
            inner.priority = priority;
            inner.weight = weight::weight(priority);
            (inner.core, inner.cpu)
        };
        if let (Some(core), Some(cpu)) = (core, cpu) {
            let core_capacity = self.globals.core(core).performance_capacity;
            let active_thread_estimate = self.globals.cpu(cpu).total_thread_count().max(1) as u32;
            let mut inner = thread.lock();
            let ctx = EevdfContext {
                now,
                min_vruntime: self.globals.global_min_vruntime(),
                core_capacity,
                active_thread_estimate,
                is_new_or_relocated: false,
            };
            update_eevdf_parameters(&mut inner, &ctx, &self.globals.tunables.lock());
            drop(inner);
            if thread.is_enqueued() {
                self.globals.cpu(cpu).run_queue.lock().update(thread.id);
            }
        }
        Ok(())
    }

    /// Enables or disables a CPU, draining its run queue onto its siblings
    /// first. Serialized behind the global barrier.
    pub fn set_cpu_enabled(&self, cpu: CpuId, enabled: bool) -> Result<()> {
        if cpu.index() >= self.globals.cpus.len() {
            return Err(ScheduleErrorKind::InvalidArgument.into());
        }
        let _barrier = self.globals.global_barrier();
        self.globals.set_cpu_enabled_bit(cpu, enabled);
        self.mode_policy().set_cpu_enabled(&self.globals, cpu, enabled);

        if !enabled {
            let stranded: Vec<Arc<ThreadState>> = {
                let mut rq = self.globals.cpu(cpu).run_queue.lock();
                let mut drained = Vec::new();
                while let Some(t) = rq.pop_minimum() {
                    t.set_enqueued(false);
                    drained.push(t);
                }
                drained
            };
            for t in stranded {
                self.enqueue_in_run_queue(t)?;
            }
        }
        Ok(())
    }

    /// Switches the global operating mode. Serialized behind the global
    /// barrier.
    pub fn set_operation_mode(&self, mode: OperatingMode) -> Result<()> {
        let _barrier = self.globals.global_barrier();
        self.globals.set_mode(mode);
        let policy: &'static dyn ModePolicy = match mode {
            OperatingMode::LowLatency => &LOW_LATENCY,
            OperatingMode::PowerSaving => &POWER_SAVING,
        };
        policy.switch_to_mode(&self.globals);
        Ok(())
    }

    /// A best-effort upper bound on how long `thread` might wait before it
    /// next runs: its own slice length times the number of threads on its
    /// context CPU whose
    /// `virtual_deadline` precedes its own.
    pub fn estimate_max_scheduling_latency(&self, thread: &Arc<ThreadState>) -> Result<Duration> {
        let inner = thread.lock();
        let Some(cpu) = inner.cpu else {
            return Err(ScheduleErrorKind::NoSuchThread.into());
        };
        let my_deadline = inner.virtual_deadline;
        let my_slice = inner.slice_duration;
        drop(inner);

        let rq = self.globals.cpu(cpu).run_queue.lock();
        let ahead = rq
            .peek_k(rq.count())
            .into_iter()
            .filter(|t| t.lock().virtual_deadline <= my_deadline)
            .count() as u64;
        Ok(Duration::from_micros(my_slice.as_micros().saturating_mul(ahead.max(1))))
    }

    pub fn get_latency_nice(&self, thread: &Arc<ThreadState>) -> i8 {
        thread.lock().latency_nice
    }

    /// Sets a thread's latency-nice value, re-running its EEVDF parameters
    /// so the new slice scaling takes effect immediately.
    pub fn set_latency_nice(&self, thread: &Arc<ThreadState>, value: i8) -> Result<()> {
        if !(LATENCY_NICE_MIN..=LATENCY_NICE_MAX).contains(&value) {
            return Err(ScheduleErrorKind::InvalidArgument.into());
        }
        let now = self.now();
        let (core, cpu) = {
            let mut inner = thread.lock();
            inner.latency_nice = value;
            (inner.core, inner.cpu)
        };
        if let (Some(core), Some(cpu)) = (core, cpu) {
            let core_capacity = self.globals.core(core).performance_capacity;
            let active_thread_estimate = self.globals.cpu(cpu).total_thread_count().max(1) as u32;
            let mut inner = thread.lock();
            let ctx = EevdfContext {
                now,
                min_vruntime: self.globals.global_min_vruntime(),
                core_capacity,
                active_thread_estimate,
                is_new_or_relocated: false,
            };
            update_eevdf_parameters(&mut inner, &ctx, &self.globals.tunables.lock());
            drop(inner);
            if thread.is_enqueued() {
                self.globals.cpu(cpu).run_queue.lock().update(thread.id);
            }
        }
        Ok(())
    }

    /// Explicitly colocates (or un-colocates) an IRQ vector with a thread.
    pub fn set_irq_task_colocation(
        &self,
        thread: &Arc<ThreadState>,
        irq: IrqVector,
        colocate: bool,
    ) -> Result<()> {
        irq::set_colocation(&self.globals, thread, irq, colocate)
    }

    /// Removes a destroyed thread's state from every scheduler-owned map.
    /// Thread lifecycle itself is out of scope; cleanup of *this crate's*
    /// bookkeeping is in scope.
    pub fn on_thread_destroyed(&self, thread: &Arc<ThreadState>) {
        if let Some(cpu) = thread.lock().cpu {
            self.globals.cpu(cpu).run_queue.lock().remove(thread.id);
        }
        thread.set_enqueued(false);
        irq::clear_thread_colocations(&self.globals, &thread.id);
    }

    /// Runs one periodic load-balancing pass, intended to be driven by a
    /// platform timer at the cadence `Tunables::balance_interval_*` bounds.
    pub fn run_periodic_balance(&self) -> usize {
        let now = self.now();
        crate::balance::run_balance_cycle(
            &self.globals,
            self.mode_policy(),
            self.collaborators.ipi.as_ref(),
            self.collaborators.irq_assigner.as_ref(),
            now,
        )
    }

    /// Refreshes `global_min_vruntime` from every enabled CPU, intended to
    /// run alongside `run_periodic_balance`.
    pub fn refresh_global_min_vruntime(&self) {
        self.globals.refresh_global_min_vruntime();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    use crate::ids::{CoreId, ThreadId};
    use crate::testutil;
    use crate::topology::StaticTopology;
    use crate::weight::{PRIORITY_NORMAL_BASE, PRIORITY_REALTIME_THRESHOLD};

    struct FakeClock(AtomicU64);
    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            Instant(self.0.load(Ordering::Relaxed))
        }
    }

    struct NoopTimer;
    impl CpuTimer for NoopTimer {
        fn arm_oneshot(&self, _cpu: CpuId, _delay: Duration) {}
        fn cancel(&self, _cpu: CpuId) {}
    }

    struct NoopIpi;
    impl InterProcessorInterrupt for NoopIpi {
        fn send_reschedule(&self, _cpu: CpuId) {}
    }

    struct NoopAssigner;
    impl IrqAssigner for NoopAssigner {
        fn assign_io_interrupt_to_cpu(&self, _irq: IrqVector, _cpu: CpuId) -> Result<()> {
            Ok(())
        }
        fn current_cpu_of_interrupt(&self, _irq: IrqVector) -> Option<CpuId> {
            None
        }
    }

    fn scheduler(packages: u32, cores_per_package: u32, smt_width: u32) -> Scheduler {
        let (cpus, cores, pkgs) = testutil::small_scheduler_parts(packages, cores_per_package, smt_width);
        Scheduler::new(
            cpus,
            cores,
            pkgs,
            Collaborators {
                topology: Box::new(StaticTopology::uniform(packages, cores_per_package, smt_width)),
                clock: Box::new(FakeClock(AtomicU64::new(0))),
                timer: Box::new(NoopTimer),
                ipi: Box::new(NoopIpi),
                irq_assigner: Box::new(NoopAssigner),
            },
        )
    }

    fn big_little_scheduler(packages: u32, cores_per_package: u32) -> Scheduler {
        let (cpus, cores, pkgs) = testutil::big_little_scheduler_parts(packages, cores_per_package);
        Scheduler::new(
            cpus,
            cores,
            pkgs,
            Collaborators {
                topology: Box::new(StaticTopology::big_little(packages, cores_per_package, 1, 1)),
                clock: Box::new(FakeClock(AtomicU64::new(0))),
                timer: Box::new(NoopTimer),
                ipi: Box::new(NoopIpi),
                irq_assigner: Box::new(NoopAssigner),
            },
        )
    }

    /// S1: two equal-weight threads on one CPU each get a turn before either
    /// repeats, and their vruntimes stay close together (fairness).
    #[test]
    fn s1_equal_weight_threads_alternate_fairly() {
        let sched = scheduler(1, 1, 1);
        let a = ThreadState::new(ThreadId(1), PRIORITY_NORMAL_BASE, Instant(0));
        let b = ThreadState::new(ThreadId(2), PRIORITY_NORMAL_BASE, Instant(0));
        sched.enqueue_in_run_queue(a.clone()).unwrap();
        sched.enqueue_in_run_queue(b.clone()).unwrap();

        let first = sched
            .reschedule(CpuId(0), None, NextState::Ready)
            .unwrap()
            .next;
        let running = if first.id == a.id { a.clone() } else { b.clone() };
        let other = if first.id == a.id { b.clone() } else { a.clone() };

        running.lock().time_used_in_current_quantum = Duration::from_millis(4);
        let second = sched
            .reschedule(CpuId(0), Some(running.clone()), NextState::Ready)
            .unwrap()
            .next;
        // Having just used a slice, `running` should not immediately repeat
        // ahead of a thread that hasn't run yet.
        assert_eq!(second.id, other.id);

        let diff = if running.lock().vruntime > other.lock().vruntime {
            running.lock().vruntime - other.lock().vruntime
        } else {
            other.lock().vruntime - running.lock().vruntime
        };
        assert!(diff < 100_000);
    }

    /// S2: a thread with roughly double the weight of another accrues
    /// vruntime at roughly half the rate for the same wall-clock runtime.
    #[test]
    fn s2_double_weight_accrues_vruntime_at_half_rate() {
        let sched = scheduler(1, 1, 1);
        let heavy = ThreadState::new(ThreadId(1), PRIORITY_NORMAL_BASE + 5, Instant(0));
        let light = ThreadState::new(ThreadId(2), PRIORITY_NORMAL_BASE, Instant(0));
        sched.enqueue_in_run_queue(heavy.clone()).unwrap();
        sched.enqueue_in_run_queue(light.clone()).unwrap();

        let heavy_weight = heavy.lock().weight;
        let light_weight = light.lock().weight;
        assert!(heavy_weight > light_weight);

        heavy.lock().time_used_in_current_quantum = Duration::from_millis(4);
        let _ = sched.reschedule(CpuId(0), Some(heavy.clone()), NextState::Ready);
        light.lock().time_used_in_current_quantum = Duration::from_millis(4);
        let _ = sched.reschedule(CpuId(0), Some(light.clone()), NextState::Ready);

        // Same wall-clock runtime, heavier weight must yield less vruntime
        // accrued (service is divided by weight).
        assert!(heavy.lock().vruntime < light.lock().vruntime);
    }

    /// S3: a thread with an earlier virtual deadline preempts one already
    /// selected once both are eligible.
    #[test]
    fn s3_earlier_deadline_preempts() {
        let sched = scheduler(1, 1, 1);
        let background = ThreadState::new(ThreadId(1), PRIORITY_NORMAL_BASE, Instant(0));
        sched.enqueue_in_run_queue(background.clone()).unwrap();
        let picked = sched
            .reschedule(CpuId(0), None, NextState::Ready)
            .unwrap()
            .next;
        assert_eq!(picked.id, background.id);

        // A real-time thread has far higher weight and thus a much smaller
        // virtual deadline relative to its own vruntime baseline.
        let urgent = ThreadState::new(ThreadId(2), PRIORITY_REALTIME_THRESHOLD, Instant(0));
        sched.enqueue_in_run_queue(urgent.clone()).unwrap();

        let next = sched
            .reschedule(CpuId(0), Some(background.clone()), NextState::Ready)
            .unwrap()
            .next;
        assert_eq!(next.id, urgent.id);
    }

    /// S4: a CPU about to go idle steals a runnable thread from a busy
    /// sibling rather than running its idle thread.
    #[test]
    fn s4_idle_cpu_steals_from_busy_sibling() {
        let sched = scheduler(1, 1, 2);
        let busy_cpu = CpuId(1);
        let a = ThreadState::new(ThreadId(1), PRIORITY_NORMAL_BASE, Instant(0));
        let b = ThreadState::new(ThreadId(2), PRIORITY_NORMAL_BASE, Instant(0));
        for t in [&a, &b] {
            let mut inner = t.lock();
            inner.cpu = Some(busy_cpu);
            inner.core = Some(CoreId(0));
            inner.slice_duration = Duration::from_millis(4);
            inner.eligible_time = Instant(0);
        }
        {
            let mut rq = sched.globals.cpu(busy_cpu).run_queue.lock();
            rq.insert(a.clone());
            rq.insert(b.clone());
        }
        a.set_enqueued(true);
        b.set_enqueued(true);

        let outcome = sched
            .reschedule(CpuId(0), None, NextState::Ready)
            .unwrap();
        assert!(!outcome.is_idle);
        assert!(outcome.next.id == a.id || outcome.next.id == b.id);
    }

    /// S5: a P-critical thread is placed on the Big core in a big.LITTLE
    /// topology, never on a Little core.
    #[test]
    fn s5_pcritical_thread_prefers_big_core() {
        let sched = big_little_scheduler(1, 2);
        let urgent = ThreadState::new(ThreadId(1), PRIORITY_REALTIME_THRESHOLD, Instant(0));
        sched.enqueue_in_run_queue(urgent.clone()).unwrap();
        let core = urgent.lock().core.unwrap();
        assert_eq!(sched.globals.core(core).core_type, crate::topology::CoreType::Big);
    }

    /// S6: an IRQ explicitly colocated with a thread is reassigned to the
    /// thread's CPU once the thread is scheduled there.
    #[test]
    fn s6_irq_follows_colocated_thread() {
        let sched = scheduler(1, 1, 2);
        let t = ThreadState::new(ThreadId(1), PRIORITY_REALTIME_THRESHOLD, Instant(0));
        sched.set_irq_task_colocation(&t, IrqVector(7), true).unwrap();
        sched.enqueue_in_run_queue(t.clone()).unwrap();

        let cpu = t.lock().cpu.unwrap();
        let outcome = sched.reschedule(cpu, None, NextState::Ready).unwrap();
        assert_eq!(outcome.next.id, t.id);
        // Mechanism A should have attempted to pull IRQ 7 onto `cpu`; with a
        // no-op assigner this can't be observed via assignment state, but
        // the colocation entry itself must persist across the reschedule.
        assert!(sched
            .globals
            .irq_colocation
            .lock()
            .get(&IrqVector(7))
            .copied()
            == Some(t.id));
    }
}
