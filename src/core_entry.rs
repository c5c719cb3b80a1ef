// SPDX-License-Identifier: MPL-2.0

//! Per-core and per-package entries, plus the sharded core-load heaps the
//! load balancer and IRQ balancer consult, which avoid the single-lock
//! contention of one global heap.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::NOMINAL_CAPACITY;
use crate::ids::{CoreId, CpuId, PackageId};
use crate::sync::RwLock;
use crate::topology::CoreType;

bitflags! {
    /// Snapshot of a core's boolean state, for introspection/debug commands
    /// rather than internal control flow (those read the individual atomics
    /// directly to avoid assembling a snapshot on the hot path).
    pub struct CoreFlags: u8 {
        const HIGH_LOAD = 0b0000_0001;
        const DEFUNCT   = 0b0000_0010;
    }
}

pub struct CoreEntry {
    pub id: CoreId,
    pub package: PackageId,
    pub cpus: Vec<CpuId>,
    pub core_type: CoreType,
    pub performance_capacity: u32,
    pub energy_efficiency: u32,

    load: core::sync::atomic::AtomicU32,
    high_load: core::sync::atomic::AtomicBool,
    defunct: core::sync::atomic::AtomicBool,
    idle_cpu_count: core::sync::atomic::AtomicU32,
}

impl CoreEntry {
    pub fn new(
        id: CoreId,
        package: PackageId,
        cpus: Vec<CpuId>,
        core_type: CoreType,
        performance_capacity: u32,
        energy_efficiency: u32,
    ) -> Self {
        let idle_cpu_count = cpus.len() as u32;
        Self {
            id,
            package,
            cpus,
            core_type,
            performance_capacity,
            energy_efficiency,
            load: core::sync::atomic::AtomicU32::new(0),
            high_load: core::sync::atomic::AtomicBool::new(false),
            defunct: core::sync::atomic::AtomicBool::new(false),
            idle_cpu_count: core::sync::atomic::AtomicU32::new(idle_cpu_count),
        }
    }

    pub fn load_permille(&self) -> u32 {
        self.load.load(core::sync::atomic::Ordering::Relaxed)
    }

    /// Load normalized against this core's capacity (so a Little core at
    /// its own max looks "100%" just like a saturated Big core), used by
    /// the big.LITTLE-aware imbalance gate.
    pub fn normalized_load(&self) -> u32 {
        let raw = self.load_permille();
        ((raw as u64 * NOMINAL_CAPACITY as u64) / self.performance_capacity.max(1) as u64) as u32
    }

    pub fn set_load_permille(&self, load: u32) {
        self.load.store(load, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_high_load(&self) -> bool {
        self.high_load.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_high_load(&self, high: bool) {
        self.high_load
            .store(high, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_defunct(&self, defunct: bool) {
        self.defunct
            .store(defunct, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn idle_cpu_count(&self) -> u32 {
        self.idle_cpu_count.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_idle_cpu_count(&self, count: u32) {
        self.idle_cpu_count
            .store(count, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn flags(&self) -> CoreFlags {
        let mut flags = CoreFlags::empty();
        if self.is_high_load() {
            flags |= CoreFlags::HIGH_LOAD;
        }
        if self.is_defunct() {
            flags |= CoreFlags::DEFUNCT;
        }
        flags
    }
}

pub struct PackageEntry {
    pub id: PackageId,
    pub cores: Vec<CoreId>,
    /// Idle-core list, behind its own lock.
    pub idle_cores: RwLock<Vec<CoreId>>,
}

impl PackageEntry {
    pub fn new(id: PackageId, cores: Vec<CoreId>) -> Self {
        Self {
            id,
            cores,
            idle_cores: RwLock::new(Vec::new()),
        }
    }
}

/// Number of shards for the global core-load heaps. Picking the shard index
/// as `core_id mod N` bounds writer contention without a single global
/// lock.
pub const LOAD_HEAP_SHARDS: usize = 8;

/// A sharded min-max view over core load, used for "pick the most-loaded
/// core" (source selection) and "pick the least-loaded core" (target
/// selection) in the load balancer's pair-selection phase, without a single
/// global lock.
///
/// Each shard independently tracks the core with the highest and lowest
/// normalized load it has seen among the cores assigned to it; the caller
/// scans all shards (cheap: `LOAD_HEAP_SHARDS` is small and fixed) to find
/// the global extremum. This trades perfect freshness for the ability to
/// update one core's entry by touching only its shard's lock.
pub struct ShardedLoadHeaps {
    shards: Vec<RwLock<Vec<CoreId>>>,
}

impl ShardedLoadHeaps {
    pub fn new(core_count: usize) -> Self {
        let mut shards = Vec::with_capacity(LOAD_HEAP_SHARDS);
        for _ in 0..LOAD_HEAP_SHARDS {
            shards.push(RwLock::new(Vec::new()));
        }
        let mut heaps = Self { shards };
        for i in 0..core_count {
            heaps.insert(CoreId(i as u32));
        }
        heaps
    }

    fn shard_index(core: CoreId) -> usize {
        core.index() % LOAD_HEAP_SHARDS
    }

    pub fn insert(&mut self, core: CoreId) {
        self.shards[Self::shard_index(core)].write().push(core);
    }

    /// Picks the core with the highest `normalized_load()` among candidates
    /// in this set of shards, skipping defunct cores.
    pub fn max_load<'a>(
        &self,
        cores: &'a [CoreEntry],
        exclude: impl Fn(CoreId) -> bool,
    ) -> Option<CoreId> {
        let mut best: Option<(CoreId, u32)> = None;
        for shard in &self.shards {
            for &core_id in shard.read().iter() {
                if exclude(core_id) {
                    continue;
                }
                let entry = &cores[core_id.index()];
                if entry.is_defunct() {
                    continue;
                }
                let load = entry.normalized_load();
                if best.map(|(_, b)| load > b).unwrap_or(true) {
                    best = Some((core_id, load));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    pub fn min_load<'a>(
        &self,
        cores: &'a [CoreEntry],
        exclude: impl Fn(CoreId) -> bool,
    ) -> Option<CoreId> {
        let mut best: Option<(CoreId, u32)> = None;
        for shard in &self.shards {
            for &core_id in shard.read().iter() {
                if exclude(core_id) {
                    continue;
                }
                let entry = &cores[core_id.index()];
                if entry.is_defunct() {
                    continue;
                }
                let load = entry.normalized_load();
                if best.map(|(_, b)| load < b).unwrap_or(true) {
                    best = Some((core_id, load));
                }
            }
        }
        best.map(|(id, _)| id)
    }
}
