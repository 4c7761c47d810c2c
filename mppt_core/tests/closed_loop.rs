use mppt_core::config::ParamId;
use mppt_core::{
    AlgorithmTag, Calibration, Command, Controller, ControllerConfig, FaultKind, MemoryStore,
    TickOutcome,
};
use mppt_hardware::{ChannelScale, PlantParams, PvPlant, SimFrontEnd, SimPowerStage};
use mppt_traits::{Channel, TelemetryChannel};

use mppt_core::mocks::RecordingTelemetry;

/// Control ticks per tracking tick at the nominal 1160 Hz / 32 Hz rates.
const TRACK_EVERY: u32 = 36;
const POLL_EVERY: u32 = 6;
const ONE_SECOND: u32 = 1160;

fn scales(cal: &Calibration) -> [ChannelScale; Channel::COUNT] {
    Channel::ALL.map(|c| {
        let l = cal.get(c);
        ChannelScale { m: l.m, b: l.b }
    })
}

struct Rig {
    plant: PvPlant,
    ctl: Controller<SimFrontEnd, SimPowerStage>,
    telemetry: RecordingTelemetry,
    store: MemoryStore,
    tick: u32,
}

impl Rig {
    fn new(cfg: ControllerConfig) -> Self {
        let plant = PvPlant::new(PlantParams::default());
        let cal = Calibration::default();
        let telemetry = RecordingTelemetry::new();
        let store = MemoryStore::new();
        let ctl = Controller::builder()
            .with_front_end(plant.front_end(scales(&cal)))
            .with_power_stage(plant.power_stage())
            .with_store(store.clone())
            .with_telemetry(telemetry.clone())
            .with_first_run_config(cfg)
            .build()
            .unwrap();
        Self {
            plant,
            ctl,
            telemetry,
            store,
            tick: 0,
        }
    }

    fn drive(&mut self, ticks: u32) {
        for _ in 0..ticks {
            let n = self.tick;
            self.ctl.sample_tick();
            if n % TRACK_EVERY == 0 {
                self.ctl.track_tick();
            }
            if n % POLL_EVERY == 0 {
                self.ctl.poll_at(u64::from(n) * 1000 / 1160).unwrap();
            }
            self.tick += 1;
        }
    }
}

#[test]
fn perturb_and_observe_finds_maximum_power() {
    let mut rig = Rig::new(ControllerConfig::default());
    rig.drive(10 * ONE_SECOND);

    let op = rig.plant.operating_point();
    // default panel peaks near 102.6 V / 582 W
    assert!(op.power_mw() > 550_000.0, "{op:?}");
    assert!((95_000.0..110_000.0).contains(&op.vin_mv), "{op:?}");
    assert!(rig.ctl.status().tracking_enabled());
    assert!(rig.ctl.faults().is_empty(), "{:?}", rig.ctl.faults());

    assert_eq!(rig.telemetry.last(TelemetryChannel::Status), Some(0b011));
    assert!(rig.telemetry.last(TelemetryChannel::PandoPower).unwrap() > 0);
    let vin = rig.telemetry.last(TelemetryChannel::InputVoltage).unwrap();
    assert!((95_000..110_000).contains(&vin), "{vin}");
}

#[test]
fn open_loop_holds_fixed_fraction_of_open_circuit() {
    let cfg = ControllerConfig {
        algorithm: AlgorithmTag::OpenLoop,
        ..ControllerConfig::default()
    };
    let mut rig = Rig::new(cfg);
    rig.drive(5 * ONE_SECOND);
    let op = rig.plant.operating_point();
    // 80% of the ~120 V sampled at start
    assert!((93_000.0..99_000.0).contains(&op.vin_mv), "{op:?}");
    assert!(op.power_mw() > 500_000.0, "{op:?}");
}

#[test]
fn iv_sweep_traces_the_panel_curve_and_returns() {
    let mut rig = Rig::new(ControllerConfig::default());
    let sweep = rig.ctl.start_iv_sweep().unwrap();
    assert!(rig.ctl.start_iv_sweep().is_none());

    rig.drive(14 * ONE_SECOND);
    assert_eq!(rig.ctl.algorithm(), AlgorithmTag::PerturbAndObserve);

    let points: Vec<_> = sweep.collect();
    assert!(points.len() > 200, "{}", points.len());
    assert!(points[0].vin_mv > 110_000, "{:?}", points[0]);
    let last = points.last().unwrap();
    assert!(last.vin_mv - 300 < 30_000, "{last:?}");
    assert!(last.iin_ma > 5_500, "{last:?}");
    let peak = points
        .iter()
        .max_by_key(|p| i64::from(p.vin_mv) * i64::from(p.iin_ma))
        .unwrap();
    assert!((95_000..110_000).contains(&peak.vin_mv), "{peak:?}");
    assert!(!rig.telemetry.values(TelemetryChannel::SweepInputVoltage).is_empty());
    assert!(rig.ctl.faults().is_empty());
}

#[test]
fn released_fault_line_trips_then_recovers() {
    let mut rig = Rig::new(ControllerConfig::default());
    rig.drive(2 * ONE_SECOND);
    assert!(rig.ctl.status().tracking_enabled());

    rig.plant.trip_fault();
    assert_eq!(
        rig.ctl.sample_tick(),
        TickOutcome::Tripped(FaultKind::FpgaShutdown)
    );
    assert!(!rig.plant.is_enabled());

    rig.drive(2 * ONE_SECOND);
    assert_eq!(rig.ctl.faults(), &[FaultKind::FpgaShutdown]);
    assert_eq!(rig.telemetry.errors(), vec![FaultKind::FpgaShutdown.code()]);
    assert!(rig.ctl.status().tracking_enabled());
    assert!(rig.plant.is_enabled());
}

#[test]
fn stalled_front_end_trips_sample_stall() {
    let mut rig = Rig::new(ControllerConfig::default());
    rig.drive(ONE_SECOND);
    rig.plant.fail_next_samples(8);
    let outcomes: Vec<_> = (0..8).map(|_| rig.ctl.sample_tick()).collect();
    assert!(outcomes[..7].iter().all(|o| *o == TickOutcome::Missed));
    assert_eq!(outcomes[7], TickOutcome::Tripped(FaultKind::SampleStall));
    rig.drive(ONE_SECOND);
    assert!(rig.ctl.faults().contains(&FaultKind::SampleStall));
    assert!(rig.ctl.status().tracking_enabled());
}

#[test]
fn raised_input_floor_is_respected_after_parameter_write() {
    let mut rig = Rig::new(ControllerConfig::default());
    rig.drive(3 * ONE_SECOND);
    let writes = rig.store.writes();

    rig.ctl
        .command_sender()
        .send(Command::SetParameter {
            param: ParamId::MinInputVoltage,
            value: 105_000,
        })
        .unwrap();
    rig.drive(4 * ONE_SECOND);

    assert_eq!(rig.store.writes(), writes + 1);
    assert_eq!(rig.ctl.config().min_input_voltage, 105_000);
    let op = rig.plant.operating_point();
    assert!(op.vin_mv > 103_500.0, "{op:?}");
    assert!(rig.ctl.status().tracking_enabled());
}

#[test]
fn manual_target_holds_until_changed() {
    let mut rig = Rig::new(ControllerConfig::default());
    let tx = rig.ctl.command_sender();
    tx.send(Command::SelectAlgorithm(AlgorithmTag::Manual)).unwrap();
    tx.send(Command::SetTarget { millivolts: 110_000 }).unwrap();
    rig.drive(3 * ONE_SECOND);
    let op = rig.plant.operating_point();
    assert!((108_500.0..111_500.0).contains(&op.vin_mv), "{op:?}");
    assert_eq!(rig.ctl.algorithm(), AlgorithmTag::Manual);
}
