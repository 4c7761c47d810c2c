//! Common rate/period helpers for mppt_core.

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Default tracking rate.
pub const TRACK_HZ: u32 = 32;
/// Default control (sampling) rate.
pub const CONTROL_HZ: u32 = 1160;
/// Default supervisor telemetry cadence.
pub const TELEMETRY_PERIOD_MS: u64 = 800;

/// Compute the period in microseconds for a given rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Compute the period in milliseconds for a given rate in Hz.
#[inline]
pub fn period_ms(hz: u32) -> u64 {
    (MILLIS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Whole ticks of a `hz` task that fit into `ms` milliseconds (truncating).
#[inline]
pub fn period_to_ticks(ms: u32, hz: u32) -> u32 {
    let ticks = u64::from(ms) * u64::from(hz) / MILLIS_PER_SEC;
    u32::try_from(ticks).unwrap_or(u32::MAX)
}
