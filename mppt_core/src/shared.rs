//! State shared between the control task, the tracking task and the
//! supervisor.
//!
//! Everything the control tick touches lives in one `ControlShared` behind a
//! single mutex. `SharedControlState::critical` is the only way in, so every
//! read-modify-write is one closure and no half-updated setpoint or average
//! is ever observed.

use std::sync::{Mutex, PoisonError};

use mppt_traits::{Channel, PowerStage};

use crate::aggregator::SampleAggregator;
use crate::calibration::Calibration;
use crate::config::ControllerConfig;
use crate::error::FaultKind;
use crate::fixed_point::{MAX_STEP_UP, OUT_MAX, OUT_MIN};
use crate::pid::{PidConstants, PidLimits, PidState};
use crate::status::{ControlOutput, TrackerStatus};

/// Raw-domain limits derived from the persisted millivolt limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub max_vout_raw: i32,
    pub min_vin_raw: i32,
}

impl Thresholds {
    pub fn derive(cfg: &ControllerConfig, cal: &Calibration) -> Self {
        Self {
            max_vout_raw: cal.to_raw(Channel::OutputVoltage, cfg.max_output_voltage),
            min_vin_raw: cal.to_raw(Channel::InputVoltage, cfg.min_input_voltage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopParams {
    pub input: PidConstants,
    pub output: PidConstants,
    pub limits: PidLimits,
}

impl LoopParams {
    pub const LIMITS: PidLimits = PidLimits {
        out_min: OUT_MIN,
        out_max: OUT_MAX,
        max_step_up: MAX_STEP_UP,
    };

    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self {
            input: cfg.input_pid,
            output: cfg.output_pid,
            limits: Self::LIMITS,
        }
    }
}

/// Last-error slot with a per-episode report latch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSlot {
    last: Option<FaultKind>,
    latched: Option<FaultKind>,
}

impl ErrorSlot {
    /// Record `kind`. Returns false when the same kind was already recorded
    /// in this episode.
    pub fn record(&mut self, kind: FaultKind) -> bool {
        if self.latched == Some(kind) {
            return false;
        }
        self.latched = Some(kind);
        self.last = Some(kind);
        true
    }

    /// Hand the pending error to the reporter.
    pub fn take(&mut self) -> Option<FaultKind> {
        self.last.take()
    }

    /// Start a new episode; called when tracking is re-enabled.
    pub fn rearm(&mut self) {
        self.latched = None;
    }
}

/// Everything guarded by the control lock.
#[derive(Debug)]
pub struct ControlShared<P> {
    pub(crate) aggregator: SampleAggregator,
    pub(crate) status: TrackerStatus,
    pub(crate) target: i32,
    pub(crate) thresholds: Thresholds,
    pub(crate) params: LoopParams,
    pub(crate) input_pid: PidState,
    pub(crate) output_pid: PidState,
    pub(crate) output: ControlOutput,
    pub(crate) errors: ErrorSlot,
    pub(crate) missed_frames: u32,
    pub(crate) power_stage: P,
}

impl<P: PowerStage> ControlShared<P> {
    pub fn new(power_stage: P, cfg: &ControllerConfig, cal: &Calibration) -> Self {
        let thresholds = Thresholds::derive(cfg, cal);
        Self {
            aggregator: SampleAggregator::new(),
            status: TrackerStatus::default(),
            target: thresholds.min_vin_raw,
            thresholds,
            params: LoopParams::from_config(cfg),
            input_pid: PidState::default(),
            output_pid: PidState::default(),
            output: ControlOutput::default(),
            errors: ErrorSlot::default(),
            missed_frames: 0,
            power_stage,
        }
    }

    pub fn status(&self) -> TrackerStatus {
        self.status
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    /// Write the setpoint, clamped to the input floor. Returns what was stored.
    pub fn set_target(&mut self, raw: i32) -> i32 {
        self.target = raw.max(self.thresholds.min_vin_raw);
        self.target
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn output(&self) -> ControlOutput {
        self.output
    }

    pub fn params(&self) -> LoopParams {
        self.params
    }

    pub fn pid_states(&self) -> (PidState, PidState) {
        (self.input_pid, self.output_pid)
    }

    pub fn aggregator(&self) -> &SampleAggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut SampleAggregator {
        &mut self.aggregator
    }

    pub fn power_stage(&self) -> &P {
        &self.power_stage
    }

    pub fn power_stage_mut(&mut self) -> &mut P {
        &mut self.power_stage
    }

    pub fn take_error(&mut self) -> Option<FaultKind> {
        self.errors.take()
    }

    /// Recompute the raw-domain limits. A raised floor lifts the setpoint.
    pub fn set_thresholds(&mut self, cfg: &ControllerConfig, cal: &Calibration) {
        self.thresholds = Thresholds::derive(cfg, cal);
        self.target = self.target.max(self.thresholds.min_vin_raw);
    }

    /// Install new loop gains after a configuration change.
    pub fn set_loop_params(&mut self, cfg: &ControllerConfig) {
        self.params = LoopParams::from_config(cfg);
    }

    /// Filtered reading converted to milli-units.
    pub fn filtered_milli(&self, channel: Channel, cal: &Calibration) -> i32 {
        cal.to_milli(channel, self.aggregator.read_filtered(channel))
    }
}

pub struct SharedControlState<P> {
    inner: Mutex<ControlShared<P>>,
}

impl<P> SharedControlState<P> {
    pub fn new(shared: ControlShared<P>) -> Self {
        Self {
            inner: Mutex::new(shared),
        }
    }

    /// Run `f` with exclusive access to the control state.
    ///
    /// A poisoned lock is recovered: no closure leaves the state half-written
    /// at a panic point that matters for the next tick.
    pub fn critical<R>(&self, f: impl FnOnce(&mut ControlShared<P>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn into_inner(self) -> ControlShared<P> {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the tracker needs from the control side.
pub trait ControlPort {
    /// Drain the Vin and Iin block averages. `None` when either has no fresh
    /// samples.
    fn refresh_averages(&self) -> Option<(i32, i32)>;
    /// Store a raw setpoint, clamped to the input floor; returns the stored value.
    fn set_target_raw(&self, raw: i32) -> i32;
    fn target_raw(&self) -> i32;
    /// Whether the input loop was pinned at the top of its range last tick.
    fn saturated(&self) -> bool;
}

impl<P: PowerStage> ControlPort for SharedControlState<P> {
    fn refresh_averages(&self) -> Option<(i32, i32)> {
        self.critical(|s| {
            let vin = s.aggregator.read_average(Channel::InputVoltage);
            let iin = s.aggregator.read_average(Channel::InputCurrent);
            vin.zip(iin)
        })
    }

    fn set_target_raw(&self, raw: i32) -> i32 {
        self.critical(|s| s.set_target(raw))
    }

    fn target_raw(&self) -> i32 {
        self.critical(|s| s.target)
    }

    fn saturated(&self) -> bool {
        self.critical(|s| s.output.saturated)
    }
}
