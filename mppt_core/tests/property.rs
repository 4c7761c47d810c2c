use mppt_core::fixed_point::{ABS_MAX_VOUT_RAW, ABS_MIN_VIN_RAW, DUTY_MAX};
use mppt_core::mocks::MockPowerStage;
use mppt_core::shared::ControlShared;
use mppt_core::{Calibration, ControllerConfig, TickOutcome, TrackerStatus};
use mppt_traits::{Channel, SampleFrame};
use proptest::prelude::*;

fn tracking_state() -> ControlShared<MockPowerStage> {
    let mut s = ControlShared::new(
        MockPowerStage::default(),
        &ControllerConfig::default(),
        &Calibration::default(),
    );
    s.set_target(2500);
    s.start_tracking().unwrap();
    s
}

proptest! {
    #[test]
    fn duty_and_loop_bits_stay_consistent(
        frames in prop::collection::vec((0u16..4096, 0u16..4096), 1..300),
    ) {
        let mut s = tracking_state();
        for (vout, vin) in frames {
            let frame = SampleFrame::default()
                .with(Channel::OutputVoltage, vout)
                .with(Channel::InputVoltage, vin);
            let outcome = s.tick(&frame);
            let st = s.status();
            let both = TrackerStatus::INPUT_LOOP_ACTIVE.bits() | TrackerStatus::OUTPUT_LOOP_ACTIVE.bits();
            prop_assert_ne!(st.bits() & both, both);
            prop_assert!(s.output().duty <= DUTY_MAX);
            if let Some(d) = s.power_stage().last_duty() {
                prop_assert!(d <= DUTY_MAX);
            }
            match outcome {
                TickOutcome::Tripped(_) => {
                    prop_assert!(i32::from(vout) > ABS_MAX_VOUT_RAW || i32::from(vin) < ABS_MIN_VIN_RAW);
                    prop_assert!(!st.tracking_enabled());
                    prop_assert!(!s.power_stage().is_enabled());
                }
                TickOutcome::Regulated(_) => prop_assert!(st.tracking_enabled()),
                TickOutcome::Idle | TickOutcome::Missed => prop_assert!(!st.tracking_enabled()),
            }
        }
    }

    #[test]
    fn in_range_samples_never_trip(
        frames in prop::collection::vec((0u16..=4026, 657u16..4096), 1..300),
    ) {
        let mut s = tracking_state();
        for (vout, vin) in frames {
            let frame = SampleFrame::default()
                .with(Channel::OutputVoltage, vout)
                .with(Channel::InputVoltage, vin);
            let is_regulated = matches!(s.tick(&frame), TickOutcome::Regulated(_));
            prop_assert!(is_regulated);
        }
    }
}
