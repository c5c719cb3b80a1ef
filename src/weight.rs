// SPDX-License-Identifier: MPL-2.0

//! EEVDF weight derivation.
//!
//! Mirrors the shape of `kernel/aster-nix/src/sched/nice.rs`'s `Nice`/
//! `Priority` newtype conversion, generalized from a single linear priority
//! band to the three bands this scheduler needs: idle, normal (nice-scaled),
//! and real-time (power-of-two boosted).

use crate::config::WEIGHT_SCALE;

/// Lowest priority value handled by [`weight`]; priorities below this are
/// clamped to the idle weight.
pub const PRIORITY_IDLE: i32 = 0;

/// Priority of the baseline ("nice 0") normal-band thread.
pub const PRIORITY_NORMAL_BASE: i32 = 120;

/// Priorities at or above this threshold are real-time.
pub const PRIORITY_REALTIME_THRESHOLD: i32 = 160;

/// Highest priority this scheduler recognizes.
pub const PRIORITY_MAX: i32 = 199;

const WEIGHT_IDLE: u64 = 1;
const WEIGHT_MIN_ACTIVE: u64 = 15;
const WEIGHT_MAX: u64 = 10_000_000;

/// A thread is classified real-time once its priority reaches this
/// threshold.
pub fn is_realtime_priority(priority: i32) -> bool {
    priority >= PRIORITY_REALTIME_THRESHOLD
}

/// Derives the EEVDF weight for a given base `priority`, further scaled by
/// `latency_nice` only insofar as latency-nice affects slice length, never
/// weight (the two are kept orthogonal: weight comes from `priority`,
/// `latency_nice` only scales `slice_duration`). Pure: callers recompute
/// eagerly whenever `priority` changes.
pub fn weight(priority: i32) -> u64 {
    if priority <= PRIORITY_IDLE {
        return WEIGHT_IDLE;
    }

    if is_realtime_priority(priority) {
        // Real-time bands multiply the normal band's top by powers of two;
        // each step above the threshold doubles the prior step's weight,
        // capped so arithmetic never overflows a u64 in later EEVDF scaling.
        let steps = (priority - PRIORITY_REALTIME_THRESHOLD).min(20) as u32;
        let top = geometric_weight(PRIORITY_REALTIME_THRESHOLD - 1);
        return top.saturating_mul(1u64 << steps).min(WEIGHT_MAX);
    }

    geometric_weight(priority).clamp(WEIGHT_MIN_ACTIVE, WEIGHT_MAX)
}

/// `≈1.0915` per priority step (`≈1.25` per nice level, and 5 priority steps
/// per nice level in this scheduler's numbering), anchored at
/// `WEIGHT_SCALE` for `PRIORITY_NORMAL_BASE`.
fn geometric_weight(priority: i32) -> u64 {
    let steps_above_base = priority - PRIORITY_NORMAL_BASE;
    // Fixed-point ratio of 1.0915, scaled by 10_000, avoids floating point
    // on a path that may run with interrupts disabled.
    const RATIO_NUM: i64 = 10_915;
    const RATIO_DEN: i64 = 10_000;

    let mut w = WEIGHT_SCALE as i64;
    if steps_above_base >= 0 {
        for _ in 0..steps_above_base {
            w = (w * RATIO_NUM) / RATIO_DEN;
        }
    } else {
        for _ in 0..(-steps_above_base) {
            w = (w * RATIO_DEN) / RATIO_NUM;
        }
    }
    w.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_base_is_nominal_scale() {
        assert_eq!(weight(PRIORITY_NORMAL_BASE), WEIGHT_SCALE);
    }

    #[test]
    fn higher_priority_yields_higher_weight() {
        assert!(weight(PRIORITY_NORMAL_BASE + 5) > weight(PRIORITY_NORMAL_BASE));
        assert!(weight(PRIORITY_NORMAL_BASE - 5) < weight(PRIORITY_NORMAL_BASE));
    }

    #[test]
    fn idle_priority_is_weight_one() {
        assert_eq!(weight(PRIORITY_IDLE), WEIGHT_IDLE);
        assert_eq!(weight(-5), WEIGHT_IDLE);
    }

    #[test]
    fn realtime_band_boosts_progressively() {
        assert!(is_realtime_priority(PRIORITY_REALTIME_THRESHOLD));
        let a = weight(PRIORITY_REALTIME_THRESHOLD);
        let b = weight(PRIORITY_REALTIME_THRESHOLD + 1);
        assert!(b > a);
        assert!(a > weight(PRIORITY_REALTIME_THRESHOLD - 1));
    }

    #[test]
    fn weight_never_exceeds_cap() {
        assert!(weight(PRIORITY_MAX) <= WEIGHT_MAX);
    }

    #[test]
    fn minimum_active_floor_enforced() {
        // Very low but still-active (non-idle) priorities are floored.
        assert!(weight(1) >= WEIGHT_MIN_ACTIVE);
    }
}
