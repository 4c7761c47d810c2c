//! Command implementations: simulated hardware assembly, controller runs and
//! persisted-configuration maintenance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use mppt_config::Config;
use mppt_core::error::{MpptError, Result as CoreResult};
use mppt_core::hw_error::boxed;
use mppt_core::{
    AlgorithmTag, Calibration, Command, Controller, ControllerConfig, FaultKind, FileStore,
    IvPoint, ParamId, Rates, SweepPoll, fatal_halt, load_config, persist_config,
};
use mppt_hardware::{ChannelScale, PlantParams, PvPlant, SimFrontEnd, SimPowerStage};
use mppt_traits::{AnalogFrontEnd, Channel, ConfigStore, MonotonicClock};

use crate::cli::{AlgorithmArg, RtArgs};
use crate::telemetry::LogTelemetry;

pub type SimController = Controller<SimFrontEnd, SimPowerStage>;

/// Everything a command needs from the TOML plus the optional CSV overlay.
#[derive(Debug, Clone)]
pub struct Setup {
    pub cfg: Config,
    pub calibration: Calibration,
}

impl Setup {
    pub fn new(cfg: Config, csv: Option<&mppt_config::CalibrationCfg>) -> Self {
        let cal_cfg = match csv {
            Some(overlay) => cfg.calibration.merged(overlay),
            None => cfg.calibration,
        };
        let calibration = Calibration::from(&cal_cfg);
        Self { cfg, calibration }
    }

    fn store(&self) -> FileStore {
        FileStore::new(self.cfg.store.path.clone())
    }

    fn first_run(&self) -> ControllerConfig {
        ControllerConfig::from(&self.cfg)
    }
}

pub fn plant_params(sim: &mppt_config::SimulationCfg) -> PlantParams {
    PlantParams {
        voc_mv: f64::from(sim.voc_mv),
        isc_ma: f64::from(sim.isc_ma),
        knee_mv: f64::from(sim.knee_mv),
        battery_mv: f64::from(sim.battery_mv),
        max_draw_ma: f64::from(sim.max_draw_ma),
        ..PlantParams::default()
    }
}

/// The simulated board's ADC scaling; fixed regardless of configured calibration.
fn board_scales() -> [ChannelScale; Channel::COUNT] {
    let board = Calibration::default();
    Channel::ALL.map(|c| {
        let l = board.get(c);
        ChannelScale { m: l.m, b: l.b }
    })
}

/// Wire a controller to a fresh simulated plant.
///
/// On a corrupt persisted image the fatal signalling loop runs until
/// `shutdown` is raised, then the error is returned.
fn build_controller(
    setup: &Setup,
    shutdown: &AtomicBool,
) -> CoreResult<(PvPlant, SimController)> {
    let plant = PvPlant::new(plant_params(&setup.cfg.simulation));
    let built = Controller::builder()
        .with_front_end(plant.front_end(board_scales()))
        .with_power_stage(plant.power_stage())
        .with_store(setup.store())
        .with_telemetry(LogTelemetry::default())
        .with_calibration(setup.calibration)
        .with_rates(Rates::from(&setup.cfg.runtime))
        .with_first_run_config(setup.first_run())
        .build();
    match built {
        Ok(ctl) => Ok((plant, ctl)),
        Err(e) => {
            if matches!(e.downcast_ref::<MpptError>(), Some(MpptError::ConfigCorrupt(_))) {
                let mut stage = plant.power_stage();
                let mut telemetry = LogTelemetry::default();
                fatal_halt(
                    &mut stage,
                    &mut telemetry,
                    FaultKind::ConfigCorrupt,
                    &MonotonicClock::new(),
                    shutdown,
                );
            }
            Err(e)
        }
    }
}

/// Raise `shutdown` after `after`, or return early once someone else does.
fn arm_deadline(shutdown: Arc<AtomicBool>, after: Duration) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let deadline = Instant::now() + after;
        while !shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                shutdown.store(true, Ordering::Release);
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    })
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed_ms: u64,
    pub algorithm: AlgorithmTag,
    pub duty: u16,
    pub status: u8,
    pub vin_mv: i32,
    pub iin_ma: i32,
    pub vout_mv: i32,
    pub control_ticks: u64,
    pub track_ticks: u64,
    pub control_overruns: u64,
    pub faults: Vec<FaultKind>,
}

impl RunSummary {
    pub fn power_mw(&self) -> i64 {
        i64::from(self.vin_mv) * i64::from(self.iin_ma) / 1000
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "elapsed_ms": self.elapsed_ms,
            "algorithm": self.algorithm.to_string(),
            "duty": self.duty,
            "status": self.status,
            "vin_mv": self.vin_mv,
            "iin_ma": self.iin_ma,
            "vout_mv": self.vout_mv,
            "power_mw": self.power_mw(),
            "control_ticks": self.control_ticks,
            "track_ticks": self.track_ticks,
            "control_overruns": self.control_overruns,
            "faults": self.faults.iter().map(ToString::to_string).collect::<Vec<_>>(),
        })
    }
}

pub fn run_controller(
    setup: &Setup,
    duration: Duration,
    algorithm: Option<AlgorithmArg>,
    target_mv: Option<i32>,
    rt: &RtArgs,
    shutdown: &Arc<AtomicBool>,
) -> CoreResult<RunSummary> {
    let deadline = arm_deadline(Arc::clone(shutdown), duration);
    let result = run_until_shutdown(setup, algorithm, target_mv, rt, shutdown);
    shutdown.store(true, Ordering::Release);
    let _ = deadline.join();
    result
}

fn run_until_shutdown(
    setup: &Setup,
    algorithm: Option<AlgorithmArg>,
    target_mv: Option<i32>,
    rt: &RtArgs,
    shutdown: &AtomicBool,
) -> CoreResult<RunSummary> {
    let (_plant, mut ctl) = build_controller(setup, shutdown)?;
    let tx = ctl.command_sender();
    let algorithm = match (algorithm, target_mv) {
        (_, Some(_)) => Some(AlgorithmTag::Manual),
        (Some(a), None) => Some(AlgorithmTag::from(mppt_config::Algorithm::from(a))),
        (None, None) => None,
    };
    if let Some(tag) = algorithm {
        tracing::info!(algorithm = %tag, "selecting algorithm for this run");
        send(&tx, Command::SelectAlgorithm(tag))?;
    }
    if let Some(mv) = target_mv {
        send(&tx, Command::SetTarget { millivolts: mv })?;
    }

    let hook = crate::rt::setup(rt);
    let started = Instant::now();
    let report = mppt_core::run(&mut ctl, shutdown, hook)?;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Ok(RunSummary {
        elapsed_ms,
        algorithm: ctl.algorithm(),
        duty: report.last_output.duty,
        status: report.last_status.bits(),
        vin_mv: ctl.reading_milli(Channel::InputVoltage),
        iin_ma: ctl.reading_milli(Channel::InputCurrent),
        vout_mv: ctl.reading_milli(Channel::OutputVoltage),
        control_ticks: report.control_ticks,
        track_ticks: report.track_ticks,
        control_overruns: report.control_overruns,
        faults: report.faults,
    })
}

fn send(tx: &crossbeam_channel::Sender<Command>, cmd: Command) -> CoreResult<()> {
    tx.send(cmd)
        .map_err(|e| eyre::Report::new(MpptError::State(format!("command queue closed: {e}"))))
}

/// Trigger one IV sweep and collect its points while the runtime drives it.
pub fn run_sweep(
    setup: &Setup,
    timeout: Duration,
    rt: &RtArgs,
    shutdown: &Arc<AtomicBool>,
) -> CoreResult<Vec<IvPoint>> {
    let deadline = arm_deadline(Arc::clone(shutdown), timeout);
    let result = sweep_until_done(setup, rt, shutdown);
    shutdown.store(true, Ordering::Release);
    let _ = deadline.join();
    let (points, finished) = result?;
    if !finished {
        return Err(eyre::Report::new(MpptError::Timeout))
            .wrap_err(format!("IV sweep did not finish within {} ms", timeout.as_millis()));
    }
    Ok(points)
}

fn sweep_until_done(
    setup: &Setup,
    rt: &RtArgs,
    shutdown: &Arc<AtomicBool>,
) -> CoreResult<(Vec<IvPoint>, bool)> {
    let (_plant, mut ctl) = build_controller(setup, shutdown)?;
    let sweep = ctl
        .start_iv_sweep()
        .ok_or_else(|| eyre::Report::new(MpptError::State("IV sweep already running".into())))?;

    let collector = {
        let shutdown = Arc::clone(shutdown);
        std::thread::spawn(move || {
            let mut points = Vec::new();
            while !shutdown.load(Ordering::Acquire) {
                match sweep.next_timeout(Duration::from_millis(20)) {
                    SweepPoll::Point(p) => points.push(p),
                    SweepPoll::Pending => {}
                    SweepPoll::Finished => {
                        shutdown.store(true, Ordering::Release);
                        return (points, true);
                    }
                }
            }
            (points, false)
        })
    };

    let hook = crate::rt::setup(rt);
    let run = mppt_core::run(&mut ctl, shutdown, hook);
    let collected = collector
        .join()
        .map_err(|_| eyre::Report::new(MpptError::State("sweep collector panicked".into())))?;
    run?;
    tracing::info!(points = collected.0.len(), finished = collected.1, "sweep collected");
    Ok(collected)
}

/// Field values in the units `config set` accepts.
pub fn param_value(cfg: &ControllerConfig, param: ParamId, track_hz: u32) -> i64 {
    let ms = |ticks: u16| u64::from(ticks) * 1000 / u64::from(track_hz.max(1));
    match param {
        ParamId::MaxOutputVoltage => i64::from(cfg.max_output_voltage),
        ParamId::MinInputVoltage => i64::from(cfg.min_input_voltage),
        ParamId::Algorithm => i64::from(cfg.algorithm.id()),
        ParamId::InputKp => i64::from(cfg.input_pid.kp),
        ParamId::InputKi => i64::from(cfg.input_pid.ki),
        ParamId::InputKd => i64::from(cfg.input_pid.kd),
        ParamId::OutputKp => i64::from(cfg.output_pid.kp),
        ParamId::OutputKi => i64::from(cfg.output_pid.ki),
        ParamId::OutputKd => i64::from(cfg.output_pid.kd),
        ParamId::OpenloopRatio => i64::from(cfg.openloop_ratio),
        ParamId::PerturbStep => i64::from(cfg.perturb_step),
        ParamId::OpenloopRetrackPeriod => {
            i64::try_from(ms(cfg.openloop_retrack_period)).unwrap_or(i64::MAX)
        }
        ParamId::IvsweepSamplePeriod => {
            i64::try_from(ms(cfg.ivsweep_sample_period)).unwrap_or(i64::MAX)
        }
        ParamId::IvsweepStepSize => i64::from(cfg.ivsweep_step_size),
    }
}

fn load_image(store: &mut FileStore) -> CoreResult<Option<ControllerConfig>> {
    let image = store.load().map_err(|e| eyre::Report::new(boxed(&e)))?;
    image
        .map(|bytes| {
            ControllerConfig::from_bytes(&bytes)
                .map_err(|e| eyre::Report::new(MpptError::ConfigCorrupt(e)))
        })
        .transpose()
}

pub fn config_show(setup: &Setup) -> CoreResult<ControllerConfig> {
    let mut store = setup.store();
    load_image(&mut store)?.ok_or_else(|| {
        eyre::Report::new(MpptError::Config(format!(
            "no persisted configuration at {}",
            store.path().display()
        )))
    })
}

pub fn config_reset(setup: &Setup) -> CoreResult<ControllerConfig> {
    let mut store = setup.store();
    let mut cfg = setup.first_run();
    persist_config(&mut store, &mut cfg)?;
    tracing::info!(path = %store.path().display(), "configuration reset to first-run defaults");
    Ok(cfg)
}

fn parse_value(param: ParamId, value: &str) -> CoreResult<i32> {
    if let Ok(v) = value.parse::<i32>() {
        return Ok(v);
    }
    if param == ParamId::Algorithm {
        let tags = [
            AlgorithmTag::OpenLoop,
            AlgorithmTag::PerturbAndObserve,
            AlgorithmTag::IvSweep,
            AlgorithmTag::Manual,
        ];
        if let Some(tag) = tags.into_iter().find(|t| t.to_string() == value) {
            return Ok(i32::from(tag.id()));
        }
    }
    Err(eyre::Report::new(MpptError::Config(format!(
        "invalid value '{value}' for {param}"
    ))))
}

pub fn config_set(setup: &Setup, param: &str, value: &str) -> CoreResult<ControllerConfig> {
    let param: ParamId = param.parse().map_err(eyre::Report::new)?;
    let value = parse_value(param, value)?;
    let mut store = setup.store();
    let mut cfg = load_config(&mut store, &setup.first_run())?;
    cfg.apply_parameter(param, value, setup.cfg.runtime.track_hz)
        .map_err(eyre::Report::new)?;
    persist_config(&mut store, &mut cfg)?;
    tracing::info!(%param, value, "parameter written");
    Ok(cfg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Empty,
    Valid,
}

/// Verify the persisted image and take one reading from the simulated front end.
pub fn self_check(setup: &Setup) -> CoreResult<StoreState> {
    let mut store = setup.store();
    let state = match load_image(&mut store)? {
        Some(_) => StoreState::Valid,
        None => StoreState::Empty,
    };
    let plant = PvPlant::new(plant_params(&setup.cfg.simulation));
    let mut fe = plant.front_end(board_scales());
    let frame = fe.sample().map_err(|e| eyre::Report::new(boxed(&e)))?;
    let vin = setup
        .calibration
        .to_milli(Channel::InputVoltage, i32::from(frame.get(Channel::InputVoltage)));
    tracing::debug!(vin_mv = vin, "front end answered");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn setup_in(dir: &tempfile::TempDir) -> Setup {
        let toml = format!(
            "[store]\npath = {:?}\n",
            dir.path().join("controller.bin").display().to_string()
        );
        let cfg = mppt_config::load_toml(&toml).unwrap();
        Setup::new(cfg, None)
    }

    #[rstest]
    #[case("pando", 1)]
    #[case("manual", 4)]
    #[case("3", 3)]
    fn algorithm_values_accept_names_and_ids(#[case] raw: &str, #[case] id: i32) {
        assert_eq!(parse_value(ParamId::Algorithm, raw).unwrap(), id);
    }

    #[test]
    fn names_are_only_accepted_for_algorithm() {
        assert!(parse_value(ParamId::MinInputVoltage, "pando").is_err());
    }

    #[test]
    fn param_values_report_periods_in_ms() {
        let cfg = ControllerConfig::default();
        assert_eq!(param_value(&cfg, ParamId::OpenloopRetrackPeriod, 32), 10_000);
        assert_eq!(param_value(&cfg, ParamId::MinInputVoltage, 32), 30_000);
    }

    #[test]
    fn set_then_show_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup_in(&dir);
        assert!(config_show(&setup).is_err());
        config_set(&setup, "min_vin_mv", "45000").unwrap();
        let shown = config_show(&setup).unwrap();
        assert_eq!(shown.min_input_voltage, 45_000);
        assert!(shown.is_sealed());
        assert_eq!(self_check(&setup).unwrap(), StoreState::Valid);
    }

    #[test]
    fn out_of_range_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let setup = setup_in(&dir);
        config_reset(&setup).unwrap();
        let before = std::fs::read(dir.path().join("controller.bin")).unwrap();
        let err = config_set(&setup, "max_vout_mv", "999999").unwrap_err();
        assert!(err.downcast_ref::<mppt_core::ConfigError>().is_some());
        let after = std::fs::read(dir.path().join("controller.bin")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn plant_params_follow_simulation_section() {
        let sim = mppt_config::SimulationCfg {
            voc_mv: 60_000,
            ..mppt_config::SimulationCfg::default()
        };
        let p = plant_params(&sim);
        assert_eq!(p.voc_mv, 60_000.0);
        assert_eq!(p.duty_full, PlantParams::default().duty_full);
    }
}
