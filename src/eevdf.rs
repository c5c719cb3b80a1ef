// SPDX-License-Identifier: MPL-2.0

//! EEVDF parameter update: the pure arithmetic that derives
//! `lag`, `eligible_time`, `virtual_deadline` and `slice_duration` from a
//! thread's current `vruntime`, its weight, and the context CPU's capacity
//! and active-thread estimate.

use crate::config::{Tunables, NOMINAL_CAPACITY, WEIGHT_SCALE};
use crate::thread::{latency_nice_factor_permille, Inner};
use crate::time::{Duration, Instant};

/// Caps the wall-clock delay derived from a deeply negative lag so a single
/// thread's `eligible_time` can never be scheduled arbitrarily far in the
/// future.
const MAX_ELIGIBLE_DELAY: Duration = Duration::from_millis(1000);

/// Inputs to [`update_eevdf_parameters`] beyond the thread's own state.
pub struct EevdfContext {
    pub now: Instant,
    /// The context CPU's cached `min_vruntime`, or the global minimum if
    /// the thread has no context CPU yet.
    pub min_vruntime: u64,
    pub core_capacity: u32,
    /// Estimated number of active weighted threads on the context CPU,
    /// used to derive the wall-clock slice.
    pub active_thread_estimate: u32,
    pub is_new_or_relocated: bool,
}

/// Implements the 9-step EEVDF parameter-update algorithm. Pure arithmetic;
/// the only failure mode (division by zero) is guarded by falling back to
/// nominal capacity and weight 1.
pub fn update_eevdf_parameters(inner: &mut Inner, ctx: &EevdfContext, tunables: &Tunables) {
    let weight = if inner.weight == 0 {
        log::warn!("thread has zero weight during EEVDF update; falling back to weight 1");
        1
    } else {
        inner.weight
    };
    let core_capacity = if ctx.core_capacity == 0 {
        log::warn!("context CPU reported zero capacity; falling back to nominal");
        NOMINAL_CAPACITY
    } else {
        ctx.core_capacity
    };

    // Step 2: clamp the "dowry" a waking/relocated thread brings.
    if ctx.is_new_or_relocated {
        let half_slice_weighted = estimate_half_slice_weighted(ctx, tunables, weight, core_capacity);
        let floor = ctx.min_vruntime.saturating_sub(half_slice_weighted);
        if inner.vruntime < floor {
            inner.vruntime = floor;
        }
    }

    // Step 3: wall-clock slice from target latency / active threads,
    // adjusted by latency-nice, clamped to [min_granularity, max_slice].
    let active = ctx.active_thread_estimate.max(1) as u64;
    let base_slice_us = tunables.target_latency.as_micros() / active;
    let nice_factor = latency_nice_factor_permille(inner.latency_nice);
    let adjusted_us = (base_slice_us as i64 * nice_factor / 1000).max(0) as u64;
    let slice_wallclock = Duration::from_micros(
        adjusted_us
            .max(tunables.min_granularity.as_micros())
            .min(tunables.max_slice.as_micros()),
    );

    // Step 4: normalize to target-core capacity.
    let slice_work = (slice_wallclock.as_micros() as u128 * core_capacity as u128)
        / NOMINAL_CAPACITY as u128;

    // Step 5: weighted entitlement.
    let ent = ((slice_work * WEIGHT_SCALE as u128) / weight as u128) as u64;

    // Step 6: lag.
    let service = inner.vruntime.saturating_sub(ctx.min_vruntime);
    inner.lag = ent as i64 - service as i64;

    // Step 7: eligibility.
    if inner.lag >= 0 {
        inner.eligible_time = ctx.now;
    } else {
        let neg_lag = (-inner.lag) as u128;
        let delay_us = (neg_lag * weight as u128 * NOMINAL_CAPACITY as u128)
            / (WEIGHT_SCALE as u128 * core_capacity as u128);
        let delay = Duration::from_micros(delay_us.min(u64::MAX as u128) as u64)
            .min(MAX_ELIGIBLE_DELAY)
            .max(tunables.min_granularity);
        inner.eligible_time = ctx.now + delay;
    }

    // Step 8.
    inner.virtual_deadline = inner.vruntime.saturating_add(ent);

    // Step 9.
    inner.slice_duration = slice_wallclock;
}

fn estimate_half_slice_weighted(
    ctx: &EevdfContext,
    tunables: &Tunables,
    weight: u64,
    core_capacity: u32,
) -> u64 {
    let active = ctx.active_thread_estimate.max(1) as u64;
    let slice_us = (tunables.target_latency.as_micros() / active)
        .max(tunables.min_granularity.as_micros())
        .min(tunables.max_slice.as_micros());
    let slice_work = (slice_us as u128 * core_capacity as u128) / NOMINAL_CAPACITY as u128;
    let ent = (slice_work * WEIGHT_SCALE as u128) / weight as u128;
    (ent / 2) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;
    use crate::thread::ThreadState;

    fn ctx(now: u64, min_vruntime: u64) -> EevdfContext {
        EevdfContext {
            now: Instant(now),
            min_vruntime,
            core_capacity: NOMINAL_CAPACITY,
            active_thread_estimate: 1,
            is_new_or_relocated: false,
        }
    }

    #[test]
    fn zero_lag_is_immediately_eligible() {
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let tunables = Tunables::defaults();
        let mut inner = t.lock();
        inner.vruntime = 0;
        let c = ctx(1000, 0);
        update_eevdf_parameters(&mut inner, &c, &tunables);
        assert!(inner.lag >= 0);
        assert_eq!(inner.eligible_time, Instant(1000));
    }

    #[test]
    fn ahead_of_schedule_thread_is_not_yet_eligible() {
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let tunables = Tunables::defaults();
        let mut inner = t.lock();
        // Far ahead of min_vruntime: negative lag, so eligible_time is in
        // the future.
        inner.vruntime = 10_000_000;
        let c = ctx(1000, 0);
        update_eevdf_parameters(&mut inner, &c, &tunables);
        assert!(inner.lag < 0);
        assert!(inner.eligible_time > Instant(1000));
    }

    #[test]
    fn virtual_deadline_is_vruntime_plus_entitlement() {
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let tunables = Tunables::defaults();
        let mut inner = t.lock();
        inner.vruntime = 500;
        let c = ctx(0, 0);
        update_eevdf_parameters(&mut inner, &c, &tunables);
        let ent = inner.virtual_deadline - inner.vruntime;
        assert!(ent > 0);
    }

    #[test]
    fn division_by_zero_capacity_falls_back_to_nominal() {
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let tunables = Tunables::defaults();
        let mut inner = t.lock();
        let mut c = ctx(0, 0);
        c.core_capacity = 0;
        // Must not panic.
        update_eevdf_parameters(&mut inner, &c, &tunables);
    }

    #[test]
    fn new_thread_dowry_is_bounded() {
        let t = ThreadState::new(ThreadId(1), 120, Instant(0));
        let tunables = Tunables::defaults();
        let mut inner = t.lock();
        inner.vruntime = 0;
        let mut c = ctx(0, 1_000_000);
        c.is_new_or_relocated = true;
        update_eevdf_parameters(&mut inner, &c, &tunables);
        assert!(inner.vruntime >= 1_000_000 / 2);
    }
}
