//! `From` implementations bridging `mppt_config` types to `mppt_core` types.

use mppt_traits::Channel;

use crate::calibration::{Calibration, Linear};
use crate::config::ControllerConfig;
use crate::pid::PidConstants;
use crate::runtime::Rates;
use crate::tracking::AlgorithmTag;
use crate::util::period_to_ticks;

// ── PidConstants ─────────────────────────────────────────────────────────────

impl From<&mppt_config::PidCfg> for PidConstants {
    fn from(c: &mppt_config::PidCfg) -> Self {
        Self::new(c.kp, c.ki, c.kd)
    }
}

// ── Calibration ──────────────────────────────────────────────────────────────

impl From<mppt_config::LinearCal> for Linear {
    fn from(c: mppt_config::LinearCal) -> Self {
        Self::new(c.m, c.b)
    }
}

impl From<&mppt_config::CalibrationCfg> for Calibration {
    /// Board defaults with any configured channels overlaid.
    fn from(c: &mppt_config::CalibrationCfg) -> Self {
        let mut cal = Self::default();
        let overrides = [
            (Channel::AmbientTemp, c.ambient_temp),
            (Channel::HeatsinkTemp, c.heatsink_temp),
            (Channel::Rail15V, c.rail_15v),
            (Channel::OutputVoltage, c.vout),
            (Channel::InputCurrent, c.iin),
            (Channel::InputVoltage, c.vin),
        ];
        for (channel, lin) in overrides {
            if let Some(lin) = lin {
                cal.set(channel, lin.into());
            }
        }
        cal
    }
}

// ── AlgorithmTag ─────────────────────────────────────────────────────────────

impl From<mppt_config::Algorithm> for AlgorithmTag {
    fn from(a: mppt_config::Algorithm) -> Self {
        match a {
            mppt_config::Algorithm::OpenLoop => Self::OpenLoop,
            mppt_config::Algorithm::Pando => Self::PerturbAndObserve,
            mppt_config::Algorithm::IvSweep => Self::IvSweep,
            mppt_config::Algorithm::Manual => Self::Manual,
        }
    }
}

// ── Rates ────────────────────────────────────────────────────────────────────

impl From<&mppt_config::RuntimeCfg> for Rates {
    fn from(c: &mppt_config::RuntimeCfg) -> Self {
        Self {
            control_hz: c.control_hz,
            track_hz: c.track_hz,
            telemetry_ms: c.telemetry_ms,
        }
    }
}

// ── ControllerConfig ─────────────────────────────────────────────────────────

impl From<&mppt_config::Config> for ControllerConfig {
    /// First-run image seeded from the TOML `[controller]` and PID sections.
    /// Periods are converted at the configured tracking rate; the result is
    /// unsealed.
    fn from(c: &mppt_config::Config) -> Self {
        let hz = c.runtime.track_hz;
        let ticks = |ms: u32| u16::try_from(period_to_ticks(ms, hz)).unwrap_or(u16::MAX);
        Self {
            max_output_voltage: c.controller.max_vout_mv,
            min_input_voltage: c.controller.min_vin_mv,
            algorithm: c.controller.algorithm.into(),
            input_pid: (&c.input_pid).into(),
            output_pid: (&c.output_pid).into(),
            openloop_ratio: c.controller.openloop_ratio,
            perturb_step: c.controller.perturb_step,
            openloop_retrack_period: ticks(c.controller.openloop_retrack_ms),
            ivsweep_sample_period: ticks(c.controller.ivsweep_sample_ms),
            ivsweep_step_size: c.controller.ivsweep_step_mv,
            ..Self::default()
        }
    }
}
