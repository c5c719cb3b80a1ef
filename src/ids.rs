// SPDX-License-Identifier: MPL-2.0

//! Newtype identifiers for the scheduling domain, in the style of
//! `kernel/aster-nix/src/sched/nice.rs`'s `Nice`/`Priority` newtypes: a bare
//! `u32`/`u64` threaded through dozens of call sites invites mixing up a CPU
//! id with a core id, so each gets its own type.

/// Identifier for a thread, stable for the thread's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Identifier for a logical CPU (an SMT hardware thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

/// Identifier for a physical core (a group of SMT-sibling CPUs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u32);

/// Identifier for a package/socket (a group of cores).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub u32);

/// An IRQ vector number, as handed to `assign_io_interrupt_to_cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqVector(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl CoreId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl PackageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
