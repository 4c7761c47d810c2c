//! Per-sample protection against out-of-bounds voltages and a released fault
//! line.
//!
//! `evaluate` is pure; `ControlShared::panic` applies a trip. The check runs on
//! the instantaneous samples of every control tick, so a trip lands within one
//! sample period.

use mppt_traits::PowerStage;

use crate::error::FaultKind;
use crate::fixed_point::{ABS_MAX_VOUT_RAW, ABS_MIN_VIN_RAW};
use crate::shared::ControlShared;
use crate::status::ControlOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyInputs {
    pub vout_raw: i32,
    pub vin_raw: i32,
    pub tracking_enabled: bool,
    pub fault_signal_asserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Trip(FaultKind),
    /// Safe, but tracking is off: hold the minimum duty.
    Idle,
    Run,
}

/// Classify one sample. Voltage limits are checked even when tracking is off.
pub fn evaluate(inputs: SafetyInputs) -> Verdict {
    if inputs.vout_raw > ABS_MAX_VOUT_RAW {
        Verdict::Trip(FaultKind::OutputOverVoltage)
    } else if inputs.vin_raw < ABS_MIN_VIN_RAW {
        Verdict::Trip(FaultKind::InputUnderVoltage)
    } else if !inputs.tracking_enabled {
        Verdict::Idle
    } else if !inputs.fault_signal_asserted {
        Verdict::Trip(FaultKind::FpgaShutdown)
    } else {
        Verdict::Run
    }
}

impl<P: PowerStage> ControlShared<P> {
    /// Take the power stage down and record `kind`.
    pub fn panic(&mut self, kind: FaultKind) {
        if let Err(e) = self.power_stage.set_enabled(false) {
            tracing::error!(error = %e, "failed to disable power stage");
        }
        self.status.set_tracking(false);
        self.output = ControlOutput::default();
        if self.errors.record(kind) {
            tracing::warn!(kind = %kind, code = kind.code(), "power stage panic");
        }
    }

    /// Stop tracking without recording a fault (configuration changes, shutdown).
    pub fn disable_tracking(&mut self) {
        if let Err(e) = self.power_stage.set_enabled(false) {
            tracing::error!(error = %e, "failed to disable power stage");
        }
        self.status.set_tracking(false);
        self.output = ControlOutput::default();
    }
}
