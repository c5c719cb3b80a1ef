// SPDX-License-Identifier: MPL-2.0

//! The injected CPU topology: an SMT -> core -> package nesting tree, plus
//! the big.LITTLE core-type vocabulary used by work-stealing, the load
//! balancer, and IRQ balancing.

use alloc::vec::Vec;

use crate::ids::{CoreId, CpuId, PackageId};

/// big.LITTLE core classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreType {
    Big,
    Little,
    UniformPerformance,
    Unknown,
}

/// The topology tree: SMT siblings -> core -> package, injected by the
/// embedding kernel rather than discovered by this crate.
pub trait Topology: Send + Sync {
    fn num_cpus(&self) -> u32;
    fn num_cores(&self) -> u32;
    fn num_packages(&self) -> u32;

    fn core_of(&self, cpu: CpuId) -> CoreId;
    fn package_of(&self, core: CoreId) -> PackageId;

    /// Other logical CPUs sharing `cpu`'s physical core (excludes `cpu`
    /// itself).
    fn smt_siblings(&self, cpu: CpuId) -> &[CpuId];

    /// All logical CPUs belonging to `core`.
    fn cpus_of_core(&self, core: CoreId) -> &[CpuId];

    /// All cores belonging to `package`.
    fn cores_of_package(&self, package: PackageId) -> &[CoreId];

    fn core_type(&self, core: CoreId) -> CoreType;

    /// Nominal = 1024; a `Little` core might report 600, a `Big` core 1024
    /// or more.
    fn performance_capacity(&self, core: CoreId) -> u32;

    /// Higher is more energy-efficient per unit of work, used to break ties
    /// between same-capacity cores in Power-Saving mode.
    fn energy_efficiency(&self, core: CoreId) -> u32;
}

/// A simple, data-driven [`Topology`] implementation sufficient for test
/// harnesses and for kernels that enumerate topology once at boot and never
/// mutate it afterwards (CPUs are only ever enabled/disabled, never added or
/// removed).
pub struct StaticTopology {
    core_of: Vec<CoreId>,
    package_of: Vec<PackageId>,
    cpus_of_core: Vec<Vec<CpuId>>,
    cores_of_package: Vec<Vec<CoreId>>,
    core_type: Vec<CoreType>,
    capacity: Vec<u32>,
    efficiency: Vec<u32>,
}

impl StaticTopology {
    /// Builds a uniform topology: `packages` packages, each with
    /// `cores_per_package` cores, each with `smt_width` logical CPUs, all of
    /// `CoreType::UniformPerformance` at nominal capacity.
    pub fn uniform(packages: u32, cores_per_package: u32, smt_width: u32) -> Self {
        Self::build(packages, cores_per_package, smt_width, |_| {
            (CoreType::UniformPerformance, 1024, 1024)
        })
    }

    /// Builds a big.LITTLE topology where `big_cores_per_package` of each
    /// package's cores are `Big` (capacity 1024) and the rest are `Little`
    /// (capacity 600, higher efficiency).
    pub fn big_little(
        packages: u32,
        cores_per_package: u32,
        smt_width: u32,
        big_cores_per_package: u32,
    ) -> Self {
        Self::build(packages, cores_per_package, smt_width, move |local_core| {
            if local_core < big_cores_per_package {
                (CoreType::Big, 1024, 600)
            } else {
                (CoreType::Little, 600, 1024)
            }
        })
    }

    fn build(
        packages: u32,
        cores_per_package: u32,
        smt_width: u32,
        classify: impl Fn(u32) -> (CoreType, u32, u32),
    ) -> Self {
        let total_cores = packages * cores_per_package;
        let mut core_of = Vec::new();
        let mut package_of = Vec::with_capacity(total_cores as usize);
        let mut cpus_of_core = Vec::with_capacity(total_cores as usize);
        let mut cores_of_package = alloc::vec![Vec::new(); packages as usize];
        let mut core_type = Vec::with_capacity(total_cores as usize);
        let mut capacity = Vec::with_capacity(total_cores as usize);
        let mut efficiency = Vec::with_capacity(total_cores as usize);

        let mut next_cpu = 0u32;
        for pkg in 0..packages {
            for local_core in 0..cores_per_package {
                let core_id = CoreId(pkg * cores_per_package + local_core);
                package_of.push(PackageId(pkg));
                cores_of_package[pkg as usize].push(core_id);

                let (ty, cap, eff) = classify(local_core);
                core_type.push(ty);
                capacity.push(cap);
                efficiency.push(eff);

                let mut cpus = Vec::with_capacity(smt_width as usize);
                for _ in 0..smt_width {
                    cpus.push(CpuId(next_cpu));
                    core_of.push(core_id);
                    next_cpu += 1;
                }
                cpus_of_core.push(cpus);
            }
        }

        Self {
            core_of,
            package_of,
            cpus_of_core,
            cores_of_package,
            core_type,
            capacity,
            efficiency,
        }
    }
}

impl Topology for StaticTopology {
    fn num_cpus(&self) -> u32 {
        self.core_of.len() as u32
    }

    fn num_cores(&self) -> u32 {
        self.cpus_of_core.len() as u32
    }

    fn num_packages(&self) -> u32 {
        self.cores_of_package.len() as u32
    }

    fn core_of(&self, cpu: CpuId) -> CoreId {
        self.core_of[cpu.index()]
    }

    fn package_of(&self, core: CoreId) -> PackageId {
        self.package_of[core.index()]
    }

    fn smt_siblings(&self, cpu: CpuId) -> &[CpuId] {
        &self.cpus_of_core[self.core_of(cpu).index()]
    }

    fn cpus_of_core(&self, core: CoreId) -> &[CpuId] {
        &self.cpus_of_core[core.index()]
    }

    fn cores_of_package(&self, package: PackageId) -> &[CoreId] {
        &self.cores_of_package[package.index()]
    }

    fn core_type(&self, core: CoreId) -> CoreType {
        self.core_type[core.index()]
    }

    fn performance_capacity(&self, core: CoreId) -> u32 {
        self.capacity[core.index()]
    }

    fn energy_efficiency(&self, core: CoreId) -> u32 {
        self.efficiency[core.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_topology_shapes() {
        let topo = StaticTopology::uniform(2, 4, 2);
        assert_eq!(topo.num_packages(), 2);
        assert_eq!(topo.num_cores(), 8);
        assert_eq!(topo.num_cpus(), 16);
        assert_eq!(topo.smt_siblings(CpuId(0)).len(), 2);
    }

    #[test]
    fn big_little_topology_classifies_cores() {
        let topo = StaticTopology::big_little(1, 4, 1, 1);
        assert_eq!(topo.core_type(CoreId(0)), CoreType::Big);
        assert_eq!(topo.core_type(CoreId(1)), CoreType::Little);
        assert!(topo.performance_capacity(CoreId(0)) > topo.performance_capacity(CoreId(1)));
    }
}
