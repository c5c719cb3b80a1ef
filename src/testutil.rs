// SPDX-License-Identifier: MPL-2.0

//! Test-only harness builders, mirroring the shape of
//! `nexa-sys-nexa-os/tests/src/mock/scheduler.rs`'s mock topology helpers.
//! Gated behind `#[cfg(test)]` in `lib.rs`; nothing here is reachable from a
//! non-test build.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::core_entry::{CoreEntry, PackageEntry};
use crate::cpu_entry::CpuEntry;
use crate::global::Globals;
use crate::ids::{CoreId, CpuId, PackageId, ThreadId};
use crate::thread::ThreadState;
use crate::time::Instant;
use crate::topology::{CoreType, StaticTopology};
use crate::weight::PRIORITY_IDLE;

/// Builds a `Globals` for a uniform-performance topology with `packages`
/// packages, `cores_per_package` cores each, and `smt_width` logical CPUs
/// per core.
pub fn small_globals(packages: u32, cores_per_package: u32, smt_width: u32) -> Globals {
    build_globals(packages, cores_per_package, smt_width, |_| {
        (CoreType::UniformPerformance, 1024, 1024)
    })
}

/// Builds a `Globals` for a big.LITTLE topology with one Big core per
/// package and `cores_per_package - 1` Little cores.
pub fn small_globals_big_little(packages: u32, cores_per_package: u32) -> Globals {
    build_globals(packages, cores_per_package, 1, |local_core| {
        if local_core == 0 {
            (CoreType::Big, 1024, 600)
        } else {
            (CoreType::Little, 600, 1024)
        }
    })
}

pub fn uniform_topology(packages: u32, cores_per_package: u32, smt_width: u32) -> StaticTopology {
    StaticTopology::uniform(packages, cores_per_package, smt_width)
}

pub fn big_little_topology(
    packages: u32,
    cores_per_package: u32,
    smt_width: u32,
    big_cores_per_package: u32,
) -> StaticTopology {
    StaticTopology::big_little(packages, cores_per_package, smt_width, big_cores_per_package)
}

fn build_globals(
    packages: u32,
    cores_per_package: u32,
    smt_width: u32,
    classify: impl Fn(u32) -> (CoreType, u32, u32),
) -> Globals {
    let (cpus, cores, packages_vec) = build_parts(packages, cores_per_package, smt_width, classify);
    Globals::new(cpus, cores, packages_vec)
}

/// Like `build_globals`, but returns the raw parts `Scheduler::new` takes
/// directly, for tests that want a full `Scheduler` rather than a bare
/// `Globals`.
#[allow(clippy::type_complexity)]
pub fn build_parts(
    packages: u32,
    cores_per_package: u32,
    smt_width: u32,
    classify: impl Fn(u32) -> (CoreType, u32, u32),
) -> (Vec<CpuEntry>, Vec<CoreEntry>, Vec<PackageEntry>) {
    let mut cores = Vec::new();
    let mut cpus = Vec::new();
    let mut cores_of_package: Vec<Vec<CoreId>> = alloc::vec![Vec::new(); packages as usize];

    let mut next_cpu = 0u32;
    let mut next_idle_id = 1_000_000u64;
    for pkg in 0..packages {
        for local_core in 0..cores_per_package {
            let core_id = CoreId(pkg * cores_per_package + local_core);
            cores_of_package[pkg as usize].push(core_id);

            let (core_type, capacity, efficiency) = classify(local_core);
            let mut core_cpus = Vec::new();
            for _ in 0..smt_width {
                let cpu_id = CpuId(next_cpu);
                core_cpus.push(cpu_id);

                let idle = ThreadState::new(ThreadId(next_idle_id), PRIORITY_IDLE, Instant(0));
                next_idle_id += 1;
                cpus.push(CpuEntry::new(cpu_id, core_id, idle));

                next_cpu += 1;
            }
            cores.push(CoreEntry::new(
                core_id,
                PackageId(pkg),
                core_cpus,
                core_type,
                capacity,
                efficiency,
            ));
        }
    }

    let packages_vec: Vec<PackageEntry> = cores_of_package
        .into_iter()
        .enumerate()
        .map(|(i, core_ids)| PackageEntry::new(PackageId(i as u32), core_ids))
        .collect();

    (cpus, cores, packages_vec)
}

/// Uniform-topology parts for building a full `Scheduler` in tests.
pub fn small_scheduler_parts(
    packages: u32,
    cores_per_package: u32,
    smt_width: u32,
) -> (Vec<CpuEntry>, Vec<CoreEntry>, Vec<PackageEntry>) {
    build_parts(packages, cores_per_package, smt_width, |_| {
        (CoreType::UniformPerformance, 1024, 1024)
    })
}

/// big.LITTLE-topology parts for building a full `Scheduler` in tests.
pub fn big_little_scheduler_parts(
    packages: u32,
    cores_per_package: u32,
) -> (Vec<CpuEntry>, Vec<CoreEntry>, Vec<PackageEntry>) {
    build_parts(packages, cores_per_package, 1, |local_core| {
        if local_core == 0 {
            (CoreType::Big, 1024, 600)
        } else {
            (CoreType::Little, 600, 1024)
        }
    })
}

/// A thread builder for tests that need more than the defaults
/// `ThreadState::new` provides.
pub fn thread_with(id: u64, priority: i32, now: Instant) -> Arc<ThreadState> {
    ThreadState::new(ThreadId(id), priority, now)
}
