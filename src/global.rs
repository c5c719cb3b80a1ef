// SPDX-License-Identifier: MPL-2.0

//! Global scheduler state: the enabled-CPU bitset, the sharded core-load
//! heaps, the advance-only `global_min_vruntime`, current mode, the
//! Small-Task Core pointer, and per-IRQ cooldown timestamps.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hashbrown::HashMap;

use crate::config::{OperatingMode, Tunables};
use crate::core_entry::{CoreEntry, PackageEntry, ShardedLoadHeaps};
use crate::cpu_entry::CpuEntry;
use crate::error::sched_panic;
use crate::ids::{CoreId, CpuId, IrqVector, PackageId};
use crate::sync::{RwLock, SpinLock};

/// Globals own every CPU/core/package entry and the cross-cutting atomics
/// the scheduler needs. A `Scheduler` holds exactly one `Globals`.
pub struct Globals {
    pub cpus: Vec<CpuEntry>,
    pub cores: Vec<CoreEntry>,
    pub packages: Vec<PackageEntry>,

    enabled_cpus: RwLock<EnabledCpuSet>,

    /// Sharded min-max heaps of cores by load, queried with a high/normal
    /// predicate; see `DESIGN.md` for why this crate consolidates both
    /// shard groups into one sharded structure rather than maintaining two
    /// physically separate heaps.
    pub load_heaps: ShardedLoadHeaps,

    /// Advance-only; computed from per-CPU reported minimums.
    global_min_vruntime: AtomicU64,

    mode: SpinLock<OperatingMode>,
    pub tunables: SpinLock<Tunables>,

    /// The current Small-Task Core, if Power-Saving has designated one.
    /// `u32::MAX` encodes "none"; updated via CAS, losers re-read whichever
    /// legitimate value won.
    small_task_core: AtomicU32,

    /// Per-IRQ cooldown timestamps, CAS-guarded so only one CPU performs a
    /// given IRQ's move within the cooldown.
    irq_cooldowns: SpinLock<HashMap<IrqVector, u64>>,

    /// IRQ -> thread colocation map, mutated only through
    /// `set_irq_task_colocation`.
    pub irq_colocation: SpinLock<HashMap<IrqVector, crate::ids::ThreadId>>,

    global_barrier: core::sync::atomic::AtomicBool,
}

const NO_STC: u32 = u32::MAX;

struct EnabledCpuSet(u128);

impl EnabledCpuSet {
    fn all(n: u32) -> Self {
        if n >= 128 {
            Self(u128::MAX)
        } else {
            Self((1u128 << n) - 1)
        }
    }

    fn contains(&self, cpu: CpuId) -> bool {
        (self.0 & (1u128 << (cpu.0 % 128))) != 0
    }

    fn set(&mut self, cpu: CpuId, enabled: bool) {
        let bit = 1u128 << (cpu.0 % 128);
        if enabled {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl Globals {
    pub fn new(cpus: Vec<CpuEntry>, cores: Vec<CoreEntry>, packages: Vec<PackageEntry>) -> Self {
        let load_heaps = ShardedLoadHeaps::new(cores.len());
        let n_cpus = cpus.len() as u32;
        Self {
            cpus,
            cores,
            packages,
            enabled_cpus: RwLock::new(EnabledCpuSet::all(n_cpus)),
            load_heaps,
            global_min_vruntime: AtomicU64::new(0),
            mode: SpinLock::new(OperatingMode::LowLatency),
            tunables: SpinLock::new(Tunables::defaults()),
            small_task_core: AtomicU32::new(NO_STC),
            irq_cooldowns: SpinLock::new(HashMap::new()),
            irq_colocation: SpinLock::new(HashMap::new()),
            global_barrier: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn cpu(&self, id: CpuId) -> &CpuEntry {
        self.cpus.get(id.index()).unwrap_or_else(|| {
            sched_panic!("invariant violated: CpuId {:?} out of range (len {})", id, self.cpus.len())
        })
    }

    pub fn core(&self, id: CoreId) -> &CoreEntry {
        self.cores.get(id.index()).unwrap_or_else(|| {
            sched_panic!("invariant violated: CoreId {:?} out of range (len {})", id, self.cores.len())
        })
    }

    pub fn package(&self, id: PackageId) -> &PackageEntry {
        self.packages.get(id.index()).unwrap_or_else(|| {
            sched_panic!("invariant violated: PackageId {:?} out of range (len {})", id, self.packages.len())
        })
    }

    pub fn is_cpu_enabled(&self, cpu: CpuId) -> bool {
        self.enabled_cpus.read().contains(cpu)
    }

    pub fn set_cpu_enabled_bit(&self, cpu: CpuId, enabled: bool) {
        self.enabled_cpus.write().set(cpu, enabled);
    }

    pub fn mode(&self) -> OperatingMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        *self.mode.lock() = mode;
    }

    pub fn global_min_vruntime(&self) -> u64 {
        self.global_min_vruntime.load(Ordering::Acquire)
    }

    /// Folds a per-CPU reported minimum into the global value using
    /// atomic-max semantics, guaranteeing monotonicity.
    pub fn report_min_vruntime(&self, candidate: u64) {
        let mut prev = self.global_min_vruntime.load(Ordering::Relaxed);
        while candidate > prev {
            match self.global_min_vruntime.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Recomputes `global_min_vruntime` from every enabled CPU's cached
    /// `min_vruntime`. Intended to run from the periodic timer alongside
    /// the load balancer.
    pub fn refresh_global_min_vruntime(&self) {
        let mut min = u64::MAX;
        for cpu in &self.cpus {
            if !cpu.is_enabled() {
                continue;
            }
            min = min.min(cpu.run_queue.lock().min_vruntime());
        }
        if min != u64::MAX {
            self.report_min_vruntime(min);
        }
    }

    pub fn small_task_core(&self) -> Option<CoreId> {
        let v = self.small_task_core.load(Ordering::Acquire);
        if v == NO_STC {
            None
        } else {
            Some(CoreId(v))
        }
    }

    /// CAS-based STC redesignation. Returns the core that ended up
    /// installed, which may be `candidate`, the unchanged incumbent, or
    /// (rarely) a third core a racing CPU just installed; callers must
    /// re-read and accept whichever legitimate value won rather than retry
    /// indefinitely.
    pub fn try_set_small_task_core(&self, expected: Option<CoreId>, candidate: CoreId) -> Option<CoreId> {
        let expected_raw = expected.map(|c| c.0).unwrap_or(NO_STC);
        match self.small_task_core.compare_exchange(
            expected_raw,
            candidate.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(candidate),
            Err(actual) => {
                if actual == NO_STC {
                    None
                } else {
                    Some(CoreId(actual))
                }
            }
        }
    }

    /// Guards a single IRQ's move with a CAS on its cooldown timestamp.
    /// Returns `true` if the caller won the race and may proceed to
    /// reassign the IRQ.
    pub fn try_acquire_irq_cooldown(&self, irq: IrqVector, now_us: u64, cooldown_us: u64) -> bool {
        let mut map = self.irq_cooldowns.lock();
        let last = map.get(&irq).copied().unwrap_or(0);
        if now_us.saturating_sub(last) < cooldown_us {
            return false;
        }
        map.insert(irq, now_us);
        true
    }

    pub fn global_barrier(&self) -> crate::sync::GlobalBarrier<'_> {
        crate::sync::GlobalBarrier::acquire(&self.global_barrier)
    }
}
