// SPDX-License-Identifier: MPL-2.0

//! The per-CPU entry: owns the run queue, the idle thread, load EWMAs, the
//! SMT-aware desirability key, and steal cooldown timers.

use alloc::sync::Arc;

use crate::ids::{CoreId, CpuId};
use crate::runqueue::RunQueue;
use crate::sync::SpinLock;
use crate::thread::ThreadState;
use crate::time::Instant;

pub struct CpuEntry {
    pub id: CpuId,
    pub core: CoreId,
    pub run_queue: SpinLock<RunQueue>,
    pub idle_thread: Arc<ThreadState>,
    enabled: core::sync::atomic::AtomicBool,

    /// EWMA of instantaneous load, in permille of nominal capacity.
    load: core::sync::atomic::AtomicU32,
    /// SMT-aware desirability key, recomputed whenever a sibling's load
    /// changes. Lower is more desirable as a migration/wake target.
    smt_key: core::sync::atomic::AtomicU32,

    next_steal_attempt_time: SpinLock<Instant>,
    last_stolen_from_time: SpinLock<Instant>,
}

impl CpuEntry {
    pub fn new(id: CpuId, core: CoreId, idle_thread: Arc<ThreadState>) -> Self {
        Self {
            id,
            core,
            run_queue: SpinLock::new(RunQueue::new()),
            idle_thread,
            enabled: core::sync::atomic::AtomicBool::new(true),
            load: core::sync::atomic::AtomicU32::new(0),
            smt_key: core::sync::atomic::AtomicU32::new(0),
            next_steal_attempt_time: SpinLock::new(Instant(0)),
            last_stolen_from_time: SpinLock::new(Instant(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled
            .store(enabled, core::sync::atomic::Ordering::Release);
    }

    pub fn load_permille(&self) -> u32 {
        self.load.load(core::sync::atomic::Ordering::Relaxed)
    }

    /// Folds a new instantaneous sample into the load EWMA. `alpha_permille`
    /// is the EWMA smoothing weight given to the new sample, in permille.
    pub fn update_load(&self, sample_permille: u32, alpha_permille: u32) {
        let prev = self.load.load(core::sync::atomic::Ordering::Relaxed) as u64;
        let sample = sample_permille as u64;
        let alpha = alpha_permille as u64;
        let next = (sample * alpha + prev * (1000 - alpha)) / 1000;
        self.load
            .store(next as u32, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn smt_key(&self) -> u32 {
        self.smt_key.load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_smt_key(&self, key: u32) {
        self.smt_key.store(key, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn next_steal_attempt_time(&self) -> Instant {
        *self.next_steal_attempt_time.lock()
    }

    pub fn set_next_steal_attempt_time(&self, at: Instant) {
        *self.next_steal_attempt_time.lock() = at;
    }

    pub fn last_stolen_from_time(&self) -> Instant {
        *self.last_stolen_from_time.lock()
    }

    pub fn set_last_stolen_from_time(&self, at: Instant) {
        *self.last_stolen_from_time.lock() = at;
    }

    pub fn total_thread_count(&self) -> usize {
        self.run_queue.lock().count()
    }
}
