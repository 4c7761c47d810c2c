//! Fixed-point domains shared by the control loop and the PID engine.
//!
//! PID outputs live in a widened domain (`duty << OUTPUT_SHIFT`) so the
//! integral term keeps sub-count resolution; the duty cycle handed to the power
//! stage is a plain right shift of that value.

/// Bits between the PID output domain and the duty-cycle domain.
pub const OUTPUT_SHIFT: u32 = 14;

/// Duty-cycle domain bounds. `DUTY_MAX` is 80% of the switching period left
/// after the auxiliary window: `(1300 - 55) * 8 / 10`.
pub const DUTY_MIN: u16 = 0;
pub const DUTY_MAX: u16 = 996;

/// PID output domain bounds.
pub const OUT_MIN: i64 = duty_to_output(DUTY_MIN);
pub const OUT_MAX: i64 = duty_to_output(DUTY_MAX);

/// Largest upward step the PID output may take in one tick.
pub const MAX_STEP_UP: i64 = OUT_MAX >> 3;

/// Hard output-voltage ceiling in raw ADC counts (170 V through the divider).
pub const ABS_MAX_VOUT_RAW: i32 = 4026;
/// Hard input-voltage floor in raw ADC counts (26 V through the divider).
pub const ABS_MIN_VIN_RAW: i32 = 657;

#[inline]
pub const fn duty_to_output(duty: u16) -> i64 {
    (duty as i64) << OUTPUT_SHIFT
}

/// Scale a PID output to the duty domain and clamp to `[DUTY_MIN, DUTY_MAX]`.
#[inline]
pub fn output_to_duty(output: i64) -> u16 {
    let duty = (output >> OUTPUT_SHIFT).clamp(i64::from(DUTY_MIN), i64::from(DUTY_MAX));
    u16::try_from(duty).unwrap_or(DUTY_MAX)
}
