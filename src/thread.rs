// SPDX-License-Identifier: MPL-2.0

//! Per-thread scheduling state and the small fixed-capacity containers it
//! needs (cpu mask, affinitized-IRQ list).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::MAX_AFFINITIZED_IRQS;
use crate::ids::{CoreId, CpuId, IrqVector, ThreadId};
use crate::sync::SpinLock;
use crate::time::{Duration, Instant};
use crate::weight::{self, is_realtime_priority};

/// Coarse task classification used by core selection and migration.
/// Computed on demand from priority, latency-nice and the cached
/// `load_pct`, never stored redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadClass {
    /// Real-time-display-or-higher priority, or strongly latency-sensitive
    /// (`latency_nice` very negative): prefers Big/Uniform cores.
    PCritical,
    /// Strongly prefers efficiency (`latency_nice` very positive, low load):
    /// prefers Little cores.
    EPreferring,
    /// Neither extreme; placement is driven by load/fit alone.
    Flexible,
}

/// A thread's lifecycle state as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Running,
    Waiting,
    Dying,
}

/// A small fixed-capacity set, used for `cpumask`. Supports up to 128
/// logical CPUs, which comfortably covers every topology this crate's test
/// harness constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u128);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(u128::MAX)
    }

    pub fn set(&mut self, cpu: CpuId) {
        self.0 |= 1u128 << (cpu.0 % 128);
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        (self.0 & (1u128 << (cpu.0 % 128))) != 0
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        (self.0 & other.0) != 0
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Fixed-capacity list of IRQ vectors explicitly colocated with a thread
/// (capacity `MAX_AFFINITIZED_IRQS`).
#[derive(Debug, Clone, Default)]
pub struct AffinitizedIrqs {
    items: [Option<IrqVector>; MAX_AFFINITIZED_IRQS],
    len: usize,
}

impl AffinitizedIrqs {
    pub fn contains(&self, irq: IrqVector) -> bool {
        self.items[..self.len].iter().any(|i| *i == Some(irq))
    }

    pub fn push(&mut self, irq: IrqVector) -> bool {
        if self.contains(irq) {
            return true;
        }
        if self.len >= self.items.len() {
            return false;
        }
        self.items[self.len] = Some(irq);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, irq: IrqVector) {
        if let Some(pos) = self.items[..self.len].iter().position(|i| *i == Some(irq)) {
            for i in pos..self.len - 1 {
                self.items[i] = self.items[i + 1];
            }
            self.len -= 1;
            self.items[self.len] = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IrqVector> + '_ {
        self.items[..self.len].iter().filter_map(|i| *i)
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.items.len()
    }
}

/// The EEVDF bookkeeping and placement state for one thread.
///
/// Mutations happen under `thread.lock` (the lowest level of the lock
/// hierarchy); the lock is modeled here as wrapping the whole mutable
/// record, the same "data + lock" pairing the design notes recommend in
/// place of per-field atomics.
pub struct ThreadState {
    pub id: ThreadId,
    inner: SpinLock<Inner>,
    /// Whether the thread is currently present in some per-CPU run queue.
    /// Kept outside the lock as an atomic so work-stealing and the balancer
    /// can cheaply skip threads already known to be elsewhere without
    /// contending the thread lock.
    enqueued: AtomicBool,
}

pub struct Inner {
    pub priority: i32,
    pub latency_nice: i8,
    pub weight: u64,

    pub vruntime: u64,
    pub lag: i64,
    pub eligible_time: Instant,
    pub virtual_deadline: u64,
    pub slice_duration: Duration,
    pub time_used_in_current_quantum: Duration,

    pub state: RunState,
    pub core: Option<CoreId>,
    pub cpu: Option<CpuId>,
    pub previous_cpu: Option<CpuId>,

    pub went_sleep: Instant,
    pub went_sleep_active: Instant,
    pub last_migration_time: Instant,

    pub avg_run_burst_ewma: Duration,
    pub voluntary_sleep_transitions: u64,
    /// EWMA-smoothed fraction of nominal capacity this thread tends to
    /// consume, in percent (0-100). Drives the big.LITTLE classification
    /// and the load-balancer's benefit score.
    pub load_pct: u8,

    pub affinitized_irqs: AffinitizedIrqs,
    pub cpumask: CpuMask,
    pub pinned_to_cpu: Option<CpuId>,
}

impl ThreadState {
    pub fn new(id: ThreadId, priority: i32, now: Instant) -> Arc<Self> {
        let weight = weight::weight(priority);
        Arc::new(Self {
            id,
            enqueued: AtomicBool::new(false),
            inner: SpinLock::new(Inner {
                priority,
                latency_nice: 0,
                weight,
                vruntime: 0,
                lag: 0,
                eligible_time: now,
                virtual_deadline: 0,
                slice_duration: Duration::ZERO,
                time_used_in_current_quantum: Duration::ZERO,
                state: RunState::Ready,
                core: None,
                cpu: None,
                previous_cpu: None,
                went_sleep: now,
                went_sleep_active: now,
                last_migration_time: Instant(0),
                avg_run_burst_ewma: Duration::ZERO,
                voluntary_sleep_transitions: 0,
                load_pct: 0,
                affinitized_irqs: AffinitizedIrqs::default(),
                cpumask: CpuMask::all(),
                pinned_to_cpu: None,
            }),
        })
    }

    pub fn lock(&self) -> crate::sync::SpinLockGuard<'_, Inner> {
        self.inner.lock()
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    pub fn set_enqueued(&self, val: bool) {
        self.enqueued.store(val, Ordering::Release);
    }

    /// Is this thread real-time / latency-critical enough that IRQ
    /// balancing should chase interfering IRQs away from it.
    pub fn is_highly_latency_sensitive(inner: &Inner) -> bool {
        is_realtime_priority(inner.priority) || inner.latency_nice < -10
    }

    /// Coarse classification used by mode policy and the balancer.
    pub fn classify(inner: &Inner) -> ThreadClass {
        if is_realtime_priority(inner.priority) || inner.latency_nice <= -10 {
            ThreadClass::PCritical
        } else if inner.latency_nice >= 10 && inner.load_pct < 20 {
            ThreadClass::EPreferring
        } else {
            ThreadClass::Flexible
        }
    }
}

/// `≈1.2ⁿ` per latency-nice step, scaling the slice length.
/// Fixed-point ratio (1.2 scaled by 1000) to stay integer-only.
pub fn latency_nice_factor_permille(latency_nice: i8) -> i64 {
    const RATIO_NUM: i64 = 1_200;
    const RATIO_DEN: i64 = 1_000;
    let mut factor = 1_000i64;
    if latency_nice >= 0 {
        for _ in 0..latency_nice {
            factor = (factor * RATIO_NUM) / RATIO_DEN;
        }
    } else {
        for _ in 0..(-latency_nice) {
            factor = (factor * RATIO_DEN) / RATIO_NUM;
        }
    }
    factor.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpumask_basic() {
        let mut m = CpuMask::empty();
        assert!(!m.contains(CpuId(3)));
        m.set(CpuId(3));
        assert!(m.contains(CpuId(3)));
        assert!(!m.contains(CpuId(4)));
    }

    #[test]
    fn affinitized_irqs_capacity() {
        let mut list = AffinitizedIrqs::default();
        for i in 0..MAX_AFFINITIZED_IRQS {
            assert!(list.push(IrqVector(i as u32)));
        }
        assert!(list.is_full());
        assert!(!list.push(IrqVector(999)));
        list.remove(IrqVector(0));
        assert!(!list.is_full());
        assert!(list.push(IrqVector(999)));
    }

    #[test]
    fn latency_nice_factor_monotone() {
        assert!(latency_nice_factor_permille(10) > latency_nice_factor_permille(0));
        assert!(latency_nice_factor_permille(-10) < latency_nice_factor_permille(0));
        assert_eq!(latency_nice_factor_permille(0), 1000);
    }

    #[test]
    fn classify_realtime_is_pcritical() {
        let t = ThreadState::new(ThreadId(1), 170, Instant(0));
        let inner = t.lock();
        assert_eq!(ThreadState::classify(&inner), ThreadClass::PCritical);
    }
}
