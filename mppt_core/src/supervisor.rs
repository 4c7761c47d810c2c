//! Main-loop supervision: commands, periodic telemetry, start conditions and
//! configuration changes.
//!
//! The supervisor never touches the power stage directly except through the
//! control lock, and always takes the tracker lock before the control lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::Receiver;
use mppt_traits::{Channel, Clock, ConfigStore, PowerStage, Telemetry, TelemetryChannel};

use crate::calibration::Calibration;
use crate::command::Command;
use crate::config::{ControllerConfig, ParamId, persist_config};
use crate::error::{FaultKind, Result};
use crate::shared::SharedControlState;
use crate::tracking::{IvPoint, Tracker};

/// Live streaming window after a set-and-tune command.
pub const TUNE_WINDOW_MS: u64 = 300;

const FLASH_MS: u64 = 250;
const FLASH_PAUSE_MS: u64 = 2000;

/// Telemetry channels carrying scaled channel readings, in send order.
const SCALED_CHANNELS: [(Channel, TelemetryChannel); 6] = [
    (Channel::InputVoltage, TelemetryChannel::InputVoltage),
    (Channel::InputCurrent, TelemetryChannel::InputCurrent),
    (Channel::OutputVoltage, TelemetryChannel::OutputVoltage),
    (Channel::HeatsinkTemp, TelemetryChannel::HeatsinkTemp),
    (Channel::Rail15V, TelemetryChannel::Rail15V),
    (Channel::AmbientTemp, TelemetryChannel::AmbientTemp),
];

pub(crate) fn lock_tracker(tracker: &Mutex<Tracker>) -> std::sync::MutexGuard<'_, Tracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Supervisor {
    store: Box<dyn ConfigStore + Send>,
    telemetry: Box<dyn Telemetry + Send>,
    config: ControllerConfig,
    calibration: Calibration,
    commands: Receiver<Command>,
    track_hz: u32,
    telemetry_ms: u64,
    next_telemetry_ms: u64,
    tune_until_ms: Option<u64>,
    faults: Vec<FaultKind>,
}

impl core::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("telemetry_ms", &self.telemetry_ms)
            .field("tune_until_ms", &self.tune_until_ms)
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Box<dyn ConfigStore + Send>,
        telemetry: Box<dyn Telemetry + Send>,
        config: ControllerConfig,
        calibration: Calibration,
        commands: Receiver<Command>,
        track_hz: u32,
        telemetry_ms: u64,
    ) -> Self {
        Self {
            store,
            telemetry,
            config,
            calibration,
            commands,
            track_hz,
            telemetry_ms: telemetry_ms.max(1),
            next_telemetry_ms: 0,
            tune_until_ms: None,
            faults: Vec::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Faults reported so far, oldest first.
    pub fn faults(&self) -> &[FaultKind] {
        &self.faults
    }

    /// One main-loop iteration at `now_ms` since controller start.
    pub fn poll<P: PowerStage>(
        &mut self,
        now_ms: u64,
        shared: &SharedControlState<P>,
        tracker: &Mutex<Tracker>,
    ) -> Result<()> {
        let mut first_err = None;
        while let Ok(cmd) = self.commands.try_recv() {
            if let Err(e) = self.handle(cmd, now_ms, shared, tracker) {
                tracing::warn!(error = %e, ?cmd, "command failed");
                first_err.get_or_insert(e);
            }
        }

        if now_ms >= self.next_telemetry_ms {
            self.next_telemetry_ms = now_ms + self.telemetry_ms;
            self.send_telemetry(shared, tracker);
        }

        self.stream_tuning(now_ms, shared);
        self.try_enable_tracking(shared);

        first_err.map_or(Ok(()), Err)
    }

    pub fn handle<P: PowerStage>(
        &mut self,
        cmd: Command,
        now_ms: u64,
        shared: &SharedControlState<P>,
        tracker: &Mutex<Tracker>,
    ) -> Result<()> {
        match cmd {
            Command::SelectAlgorithm(tag) => lock_tracker(tracker).switch_to(tag, shared),
            Command::SetTarget { millivolts } => {
                let raw = lock_tracker(tracker).set_voltage(shared, millivolts);
                tracing::debug!(millivolts, raw, "target set");
            }
            Command::StartIvSweep => {
                // Nobody holds the stream; points still reach telemetry.
                if lock_tracker(tracker).start_iv_sweep(shared).is_none() {
                    tracing::debug!("iv sweep already running");
                }
            }
            Command::SetAndTune { millivolts } => {
                lock_tracker(tracker).set_voltage(shared, millivolts);
                self.tune_until_ms = Some(now_ms + TUNE_WINDOW_MS);
            }
            Command::SetParameter { param, value } => {
                self.on_config_parameter_changed(param, value, shared, tracker)?;
            }
        }
        Ok(())
    }

    /// Apply a parameter write: stop, mutate, recompute, persist, restart.
    ///
    /// Tracking comes back through the normal start-condition check.
    pub fn on_config_parameter_changed<P: PowerStage>(
        &mut self,
        param: ParamId,
        value: i32,
        shared: &SharedControlState<P>,
        tracker: &Mutex<Tracker>,
    ) -> Result<()> {
        let mut next = self.config;
        next.apply_parameter(param, value, self.track_hz)
            .map_err(|e| eyre::Report::new(crate::error::MpptError::Config(e.to_string())))?;

        let mut tracker = lock_tracker(tracker);
        shared.critical(|s| s.disable_tracking());

        self.config = next;
        shared.critical(|s| {
            if param.affects_thresholds() {
                s.set_thresholds(&self.config, &self.calibration);
            }
            s.set_loop_params(&self.config);
        });
        tracker.reconfigure(&self.config);
        tracing::debug!(param = %param, value, "parameter written");

        let persisted = persist_config(self.store.as_mut(), &mut self.config);
        tracker.switch_to(self.config.algorithm, shared);
        persisted
    }

    /// Re-enable tracking once the filtered input and output are inside limits.
    pub fn try_enable_tracking<P: PowerStage>(&mut self, shared: &SharedControlState<P>) -> bool {
        let cal = self.calibration;
        let (min_vin, max_vout) = (
            self.config.min_input_voltage,
            self.config.max_output_voltage,
        );
        let result = shared.critical(|s| {
            if s.status().tracking_enabled() {
                return None;
            }
            let vin = s.filtered_milli(Channel::InputVoltage, &cal);
            let vout = s.filtered_milli(Channel::OutputVoltage, &cal);
            (vin >= min_vin && vout <= max_vout).then(|| s.start_tracking())
        });
        match result {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "could not enable tracking");
                false
            }
            None => false,
        }
    }

    fn send_telemetry<P: PowerStage>(&mut self, shared: &SharedControlState<P>, tracker: &Mutex<Tracker>) {
        let (points, power) = {
            let mut t = lock_tracker(tracker);
            (t.take_points(), t.last_power())
        };
        let cal = self.calibration;
        let (error, readings, status, duty) = shared.critical(|s| {
            let readings = SCALED_CHANNELS.map(|(ch, tc)| (tc, s.filtered_milli(ch, &cal)));
            (s.take_error(), readings, s.status(), s.output().duty)
        });

        if let Some(kind) = error {
            self.telemetry.report_error(kind.code());
            self.faults.push(kind);
        }
        for (channel, value) in readings {
            self.telemetry.send(channel, i64::from(value));
        }
        self.telemetry
            .send(TelemetryChannel::Status, i64::from(status.bits()));
        self.telemetry
            .send(TelemetryChannel::DutyCycle, i64::from(duty));
        if let Some(power) = power {
            self.telemetry.send(
                TelemetryChannel::PandoPower,
                i64::try_from(power).unwrap_or(i64::MAX),
            );
        }
        self.flush_points(&points);
    }

    fn flush_points(&mut self, points: &[IvPoint]) {
        for p in points {
            self.telemetry
                .send(TelemetryChannel::SweepInputVoltage, i64::from(p.vin_mv));
            self.telemetry
                .send(TelemetryChannel::SweepInputCurrent, i64::from(p.iin_ma));
        }
    }

    fn stream_tuning<P: PowerStage>(&mut self, now_ms: u64, shared: &SharedControlState<P>) {
        let Some(until) = self.tune_until_ms else {
            return;
        };
        if now_ms >= until {
            self.tune_until_ms = None;
            return;
        }
        let (vin, duty) = shared.critical(|s| {
            (
                s.aggregator().read_filtered(Channel::InputVoltage),
                s.output().duty,
            )
        });
        self.telemetry
            .send(TelemetryChannel::TuneInputVoltage, i64::from(vin));
        self.telemetry
            .send(TelemetryChannel::TuneDutyCycle, i64::from(duty));
    }
}

/// Unrecoverable stop: hold the stage off and signal `kind` until `shutdown`.
///
/// Each round reports the code and flashes the indicator `2 * code` times
/// (on/off pairs), then pauses.
pub fn fatal_halt<P, T, C>(
    power_stage: &mut P,
    telemetry: &mut T,
    kind: FaultKind,
    clock: &C,
    shutdown: &AtomicBool,
) where
    P: PowerStage + ?Sized,
    T: Telemetry + ?Sized,
    C: Clock + ?Sized,
{
    if let Err(e) = power_stage.set_enabled(false) {
        tracing::error!(error = %e, "failed to disable power stage");
    }
    tracing::error!(kind = %kind, code = kind.code(), "fatal fault; halting");
    loop {
        telemetry.report_error(kind.code());
        for i in 0..2 * u32::from(kind.code()) {
            telemetry.set_indicator(i % 2 == 0);
            clock.sleep(Duration::from_millis(FLASH_MS));
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        clock.sleep(Duration::from_millis(FLASH_PAUSE_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockPowerStage, RecordingTelemetry};
    use crate::shared::ControlShared;
    use crate::store::MemoryStore;
    use crate::tracking::AlgorithmTag;
    use mppt_traits::SampleFrame;
    use mppt_traits::clock::test_clock::TestClock;
    use std::sync::Arc;

    struct Rig {
        sup: Supervisor,
        shared: SharedControlState<MockPowerStage>,
        tracker: Mutex<Tracker>,
        telemetry: RecordingTelemetry,
        store: MemoryStore,
        tx: crossbeam_channel::Sender<Command>,
    }

    fn rig() -> Rig {
        let cfg = ControllerConfig::default().sealed();
        let cal = Calibration::default();
        let shared = SharedControlState::new(ControlShared::new(MockPowerStage::default(), &cfg, &cal));
        let tracker = Mutex::new(Tracker::new(&cfg, cal, 32));
        let telemetry = RecordingTelemetry::new();
        let store = MemoryStore::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let sup = Supervisor::new(
            Box::new(store.clone()),
            Box::new(telemetry.clone()),
            cfg,
            cal,
            rx,
            32,
            800,
        );
        Rig { sup, shared, tracker, telemetry, store, tx }
    }

    /// Feed enough frames for the halving filter to settle near `vin`/`vout`.
    fn settle(shared: &SharedControlState<MockPowerStage>, vout: u16, vin: u16) {
        let frame = SampleFrame::default()
            .with(Channel::OutputVoltage, vout)
            .with(Channel::InputVoltage, vin);
        for _ in 0..32 {
            shared.critical(|s| s.aggregator_mut().on_frame(&frame));
        }
    }

    #[test]
    fn start_conditions_gate_tracking() {
        let mut r = rig();
        assert!(!r.sup.try_enable_tracking(&r.shared));
        settle(&r.shared, 3000, 2500);
        assert!(r.sup.try_enable_tracking(&r.shared));
        assert!(r.shared.critical(|s| s.power_stage().is_enabled()));
        // already tracking
        assert!(!r.sup.try_enable_tracking(&r.shared));
    }

    #[test]
    fn output_above_ceiling_blocks_start() {
        let mut r = rig();
        settle(&r.shared, 3700, 2500);
        assert!(!r.sup.try_enable_tracking(&r.shared));
    }

    #[test]
    fn telemetry_runs_on_its_period_and_drains_errors() {
        let r = &mut rig();
        r.shared.critical(|s| s.panic(FaultKind::FpgaShutdown));
        r.sup.poll(0, &r.shared, &r.tracker).unwrap();
        assert_eq!(r.telemetry.errors(), vec![4]);
        assert_eq!(r.telemetry.values(TelemetryChannel::Status).len(), 1);

        r.sup.poll(799, &r.shared, &r.tracker).unwrap();
        assert_eq!(r.telemetry.values(TelemetryChannel::Status).len(), 1);
        r.sup.poll(800, &r.shared, &r.tracker).unwrap();
        assert_eq!(r.telemetry.values(TelemetryChannel::Status).len(), 2);
        assert_eq!(r.telemetry.errors(), vec![4]);
        assert_eq!(r.sup.faults(), &[FaultKind::FpgaShutdown]);
    }

    #[test]
    fn set_and_tune_streams_for_the_window() {
        let r = &mut rig();
        r.tx.send(Command::SetAndTune { millivolts: 60_000 }).unwrap();
        r.sup.poll(1000, &r.shared, &r.tracker).unwrap();
        r.sup.poll(1100, &r.shared, &r.tracker).unwrap();
        r.sup.poll(1300, &r.shared, &r.tracker).unwrap();
        assert_eq!(r.telemetry.values(TelemetryChannel::TuneDutyCycle).len(), 2);
        let raw = Calibration::default().to_raw(Channel::InputVoltage, 60_000);
        assert_eq!(r.shared.critical(|s| s.target()), raw);
    }

    #[test]
    fn parameter_write_persists_and_restarts_tracker() {
        let r = &mut rig();
        settle(&r.shared, 3000, 2500);
        assert!(r.sup.try_enable_tracking(&r.shared));

        r.tx.send(Command::SetParameter {
            param: ParamId::MinInputVoltage,
            value: 40_000,
        })
        .unwrap();
        r.tx.send(Command::SelectAlgorithm(AlgorithmTag::Manual)).unwrap();
        r.sup.poll(5, &r.shared, &r.tracker).unwrap();

        let stored = ControllerConfig::from_bytes(&r.store.image().unwrap()).unwrap();
        assert_eq!(stored.min_input_voltage, 40_000);
        assert_eq!(r.sup.config().min_input_voltage, 40_000);
        let floor = Calibration::default().to_raw(Channel::InputVoltage, 40_000);
        assert_eq!(r.shared.critical(|s| s.thresholds().min_vin_raw), floor);
        assert_eq!(lock_tracker(&r.tracker).algorithm(), AlgorithmTag::Manual);
        // filtered vin (~100 V) still clears the new floor
        assert!(r.shared.critical(|s| s.status().tracking_enabled()));
    }

    #[test]
    fn gain_write_updates_loop_params_and_keeps_limits() {
        let r = &mut rig();
        let before = r.shared.critical(|s| s.thresholds());
        r.sup
            .on_config_parameter_changed(ParamId::InputKp, 5000, &r.shared, &r.tracker)
            .unwrap();
        assert_eq!(r.shared.critical(|s| s.params().input.kp), 5000);
        assert_eq!(r.shared.critical(|s| s.thresholds()), before);
        assert_eq!(r.store.writes(), 1);

        r.sup
            .on_config_parameter_changed(ParamId::MaxOutputVoltage, 120_000, &r.shared, &r.tracker)
            .unwrap();
        let ceiling = Calibration::default().to_raw(Channel::OutputVoltage, 120_000);
        assert_eq!(r.shared.critical(|s| s.thresholds().max_vout_raw), ceiling);
        assert_ne!(ceiling, before.max_vout_raw);
    }

    #[test]
    fn rejected_parameter_leaves_tracking_alone() {
        let r = &mut rig();
        settle(&r.shared, 3000, 2500);
        assert!(r.sup.try_enable_tracking(&r.shared));
        let err = r
            .sup
            .on_config_parameter_changed(ParamId::MaxOutputVoltage, 200_000, &r.shared, &r.tracker)
            .unwrap_err();
        assert!(err.to_string().contains("max_vout_mv"), "{err}");
        assert!(r.shared.critical(|s| s.status().tracking_enabled()));
        assert_eq!(r.store.writes(), 0);
    }

    #[test]
    fn fatal_halt_flashes_code_until_shutdown() {
        struct StopAfterFirst {
            inner: RecordingTelemetry,
            stop: Arc<AtomicBool>,
        }
        impl Telemetry for StopAfterFirst {
            fn send(&mut self, c: TelemetryChannel, v: i64) {
                self.inner.send(c, v);
            }
            fn report_error(&mut self, code: u8) {
                self.inner.report_error(code);
                self.stop.store(true, Ordering::Release);
            }
            fn set_indicator(&mut self, on: bool) {
                self.inner.set_indicator(on);
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let rec = RecordingTelemetry::new();
        let mut t = StopAfterFirst {
            inner: rec.clone(),
            stop: Arc::clone(&stop),
        };
        let mut stage = MockPowerStage::default();
        stage.set_enabled(true).unwrap();
        let clock = TestClock::new();
        fatal_halt(&mut stage, &mut t, FaultKind::ConfigCorrupt, &clock, &stop);
        assert!(!stage.is_enabled());
        assert_eq!(rec.errors(), vec![1]);
        assert_eq!(rec.indicator_toggles(), 2);
        assert_eq!(clock.elapsed(), Duration::from_millis(2 * FLASH_MS));
    }
}
