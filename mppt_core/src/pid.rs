//! Integer PID with rate limiting and clamp-driven anti-windup.
//!
//! The order inside `step` matters for closed-loop behavior: the upward rate
//! limit is applied before the range clamp, and each clamp rewrites the
//! integral so that `integral == output - (P + D)` afterwards.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidConstants {
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,
}

impl PidConstants {
    pub const fn new(kp: i32, ki: i32, kd: i32) -> Self {
        Self { kp, ki, kd }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidState {
    pub previous_output: i64,
    pub previous_error: i64,
    pub integral: i64,
}

impl PidState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Output range and slew limit for one PID instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidLimits {
    pub out_min: i64,
    pub out_max: i64,
    pub max_step_up: i64,
}

/// Advance one PID instance by a tick and return its output.
pub fn step(error: i64, state: &mut PidState, k: PidConstants, limits: PidLimits) -> i64 {
    let u = error
        .saturating_mul(i64::from(k.kp))
        .saturating_add(i64::from(k.kd).saturating_mul(error.saturating_sub(state.previous_error)));
    state.integral = state
        .integral
        .saturating_add(error.saturating_mul(i64::from(k.ki)));
    let mut candidate = u.saturating_add(state.integral);

    // Rate limit
    if candidate.saturating_sub(state.previous_output) > limits.max_step_up {
        candidate = state.previous_output + limits.max_step_up;
        state.integral = candidate.saturating_sub(u);
    }

    // Range clamp
    if candidate > limits.out_max {
        candidate = limits.out_max;
        state.integral = candidate.saturating_sub(u);
    }
    if candidate < limits.out_min {
        candidate = limits.out_min;
        state.integral = candidate.saturating_sub(u);
    }

    state.previous_output = candidate;
    state.previous_error = error;
    candidate
}
