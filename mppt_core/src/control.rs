//! The high-rate control tick: aggregate, protect, regulate.
//!
//! Two PID instances run every tick. The output loop holds Vout under its
//! ceiling, the input loop holds Vin at the tracker's setpoint, and the lower
//! of the two outputs drives the duty cycle. Whichever loop yields the lower
//! output is the binding constraint.

use mppt_traits::{AnalogFrontEnd, Channel, PowerStage, SampleFrame};

use crate::error::{FaultKind, Result};
use crate::fixed_point::{DUTY_MIN, OUT_MAX, output_to_duty};
use crate::hw_error::boxed;
use crate::pid;
use crate::safety::{SafetyInputs, Verdict, evaluate};
use crate::shared::{ControlShared, SharedControlState};
use crate::status::{ActiveLoop, ControlOutput};

/// Consecutive front-end failures tolerated before tripping `SampleStall`.
pub const MAX_MISSED_FRAMES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The front end delivered no frame.
    Missed,
    Tripped(FaultKind),
    Idle,
    Regulated(ControlOutput),
}

/// Minimum-selection between the output and input loop results.
///
/// Returns the combined output and the loop that produced it. Ties go to the
/// output loop.
#[inline]
pub fn arbitrate(out_result: i64, in_result: i64) -> (i64, ActiveLoop) {
    if out_result > in_result {
        (in_result, ActiveLoop::Input)
    } else {
        (out_result, ActiveLoop::Output)
    }
}

/// Read one frame outside the lock, then run the tick inside it.
pub fn sample_and_tick<F, P>(front_end: &mut F, shared: &SharedControlState<P>) -> TickOutcome
where
    F: AnalogFrontEnd + ?Sized,
    P: PowerStage,
{
    match front_end.sample() {
        Ok(frame) => shared.critical(|s| s.tick(&frame)),
        Err(e) => {
            tracing::warn!(error = %e, "analog front end read failed; tick skipped");
            match shared.critical(ControlShared::missed_frame) {
                Some(kind) => TickOutcome::Tripped(kind),
                None => TickOutcome::Missed,
            }
        }
    }
}

impl<P: PowerStage> ControlShared<P> {
    /// Run one control tick on a fresh sample frame.
    pub fn tick(&mut self, frame: &SampleFrame) -> TickOutcome {
        self.missed_frames = 0;
        self.aggregator.on_frame(frame);

        let vout = i32::from(frame.get(Channel::OutputVoltage));
        let vin = i32::from(frame.get(Channel::InputVoltage));
        let tracking_enabled = self.status.tracking_enabled();
        // The fault line is only meaningful while the stage is enabled.
        let fault_signal_asserted = tracking_enabled && self.power_stage.fault_signal_asserted();

        match evaluate(SafetyInputs {
            vout_raw: vout,
            vin_raw: vin,
            tracking_enabled,
            fault_signal_asserted,
        }) {
            Verdict::Trip(kind) => {
                self.panic(kind);
                return TickOutcome::Tripped(kind);
            }
            Verdict::Idle => {
                self.apply_duty(DUTY_MIN);
                self.output.duty = DUTY_MIN;
                self.output.saturated = false;
                return TickOutcome::Idle;
            }
            Verdict::Run => {}
        }

        let limits = self.params.limits;
        let out_result = pid::step(
            i64::from(vout) - i64::from(self.thresholds.max_vout_raw),
            &mut self.output_pid,
            self.params.output,
            limits,
        );
        let in_result = pid::step(
            i64::from(vin) - i64::from(self.target),
            &mut self.input_pid,
            self.params.input,
            limits,
        );

        let (combined, active_loop) = arbitrate(out_result, in_result);
        self.status.set_active_loop(active_loop);

        let duty = output_to_duty(combined);
        self.apply_duty(duty);

        self.output = ControlOutput {
            duty,
            active_loop,
            saturated: in_result >= OUT_MAX,
        };
        TickOutcome::Regulated(self.output)
    }

    /// Account for a frame the front end failed to deliver.
    ///
    /// Returns the fault when the stall limit is reached while tracking.
    pub fn missed_frame(&mut self) -> Option<FaultKind> {
        self.missed_frames = self.missed_frames.saturating_add(1);
        if self.missed_frames >= MAX_MISSED_FRAMES && self.status.tracking_enabled() {
            self.panic(FaultKind::SampleStall);
            return Some(FaultKind::SampleStall);
        }
        None
    }

    /// Bring the power stage up from a clean slate.
    pub fn start_tracking(&mut self) -> Result<()> {
        self.input_pid.reset();
        self.output_pid.reset();
        self.output = ControlOutput::default();
        self.status.set_active_loop(ActiveLoop::Input);
        self.errors.rearm();
        self.missed_frames = 0;

        let enabled = self
            .power_stage
            .reset_fault_latch()
            .and_then(|()| self.power_stage.set_duty_cycle(DUTY_MIN))
            .and_then(|()| self.power_stage.set_enabled(true));
        if let Err(e) = enabled {
            self.status.set_tracking(false);
            return Err(eyre::Report::new(boxed(&e)));
        }
        self.status.set_tracking(true);
        tracing::info!(target_raw = self.target, "tracking enabled");
        Ok(())
    }

    fn apply_duty(&mut self, duty: u16) {
        if let Err(e) = self.power_stage.set_duty_cycle(duty) {
            tracing::warn!(error = %e, duty, "failed to set duty cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::config::ControllerConfig;
    use crate::mocks::MockPowerStage;
    use rstest::rstest;

    fn frame(vout: u16, vin: u16) -> SampleFrame {
        SampleFrame::default()
            .with(Channel::OutputVoltage, vout)
            .with(Channel::InputVoltage, vin)
            .with(Channel::InputCurrent, 100)
    }

    fn tracking() -> ControlShared<MockPowerStage> {
        let mut s = ControlShared::new(
            MockPowerStage::default(),
            &ControllerConfig::default(),
            &Calibration::default(),
        );
        s.set_target(2000);
        s.start_tracking().unwrap();
        s
    }

    #[rstest]
    #[case(10, 20, 10, ActiveLoop::Output)]
    #[case(20, 10, 10, ActiveLoop::Input)]
    #[case(15, 15, 15, ActiveLoop::Output)]
    #[case(500, 800, 500, ActiveLoop::Output)]
    #[case(800, 500, 500, ActiveLoop::Input)]
    fn arbitration_picks_minimum(
        #[case] out: i64,
        #[case] inp: i64,
        #[case] combined: i64,
        #[case] active: ActiveLoop,
    ) {
        assert_eq!(arbitrate(out, inp), (combined, active));
    }

    #[test]
    fn idle_holds_minimum_duty() {
        let mut s = ControlShared::new(
            MockPowerStage::default(),
            &ControllerConfig::default(),
            &Calibration::default(),
        );
        assert_eq!(s.tick(&frame(3000, 2000)), TickOutcome::Idle);
        assert_eq!(s.power_stage().last_duty(), Some(DUTY_MIN));
        // fault line is not consulted while idle
        assert_eq!(s.power_stage().fault_reads(), 0);
    }

    #[test]
    fn input_loop_binds_when_vin_above_target() {
        let mut s = tracking();
        let out = s.tick(&frame(3000, 2100));
        let TickOutcome::Regulated(o) = out else {
            panic!("expected regulation, got {out:?}");
        };
        assert_eq!(o.active_loop, ActiveLoop::Input);
        assert!(s.status().contains(crate::status::TrackerStatus::INPUT_LOOP_ACTIVE));
        // e_in = 100 -> 700_000 + 40_000, inside the first rate-limited step
        assert_eq!(o.duty, output_to_duty(740_000));
        assert!(!o.saturated);
    }

    #[test]
    fn output_ceiling_takes_over() {
        let mut s = tracking();
        for _ in 0..50 {
            s.tick(&frame(3000, 3000));
        }
        let out = s.tick(&frame(3700, 3000));
        let TickOutcome::Regulated(o) = out else {
            panic!("expected regulation, got {out:?}");
        };
        assert_eq!(o.active_loop, ActiveLoop::Output);
        // output loop backs off from the rail while the input loop stays pinned
        assert_eq!(o.duty, 568);
        assert!(s.status().contains(crate::status::TrackerStatus::OUTPUT_LOOP_ACTIVE));
    }

    #[test]
    fn sustained_high_vin_saturates_input_loop() {
        let mut s = tracking();
        let mut last = None;
        for _ in 0..12 {
            last = Some(s.tick(&frame(1000, 4000)));
        }
        let Some(TickOutcome::Regulated(o)) = last else {
            panic!("expected regulation");
        };
        assert!(o.saturated);
        assert_eq!(s.pid_states().0.previous_output, OUT_MAX);
    }

    #[test]
    fn released_fault_line_trips() {
        let mut s = tracking();
        s.power_stage_mut().release_fault_line();
        assert_eq!(
            s.tick(&frame(3000, 2000)),
            TickOutcome::Tripped(FaultKind::FpgaShutdown)
        );
        assert!(!s.status().tracking_enabled());
        assert!(!s.power_stage().is_enabled());
        assert_eq!(s.take_error(), Some(FaultKind::FpgaShutdown));
    }

    #[test]
    fn stall_trips_after_limit() {
        let mut s = tracking();
        for _ in 1..MAX_MISSED_FRAMES {
            assert_eq!(s.missed_frame(), None);
        }
        assert_eq!(s.missed_frame(), Some(FaultKind::SampleStall));
        assert!(!s.status().tracking_enabled());
    }

    #[test]
    fn restart_resets_pids_and_rearms() {
        let mut s = tracking();
        s.tick(&frame(3000, 2500));
        s.panic(FaultKind::InputUnderVoltage);
        assert!(s.take_error().is_some());
        s.start_tracking().unwrap();
        assert_eq!(s.pid_states().0, crate::pid::PidState::default());
        assert_eq!(s.status().active_loop(), Some(ActiveLoop::Input));
        assert!(s.power_stage().latch_resets() >= 2);
        s.panic(FaultKind::InputUnderVoltage);
        assert_eq!(s.take_error(), Some(FaultKind::InputUnderVoltage));
    }
}
