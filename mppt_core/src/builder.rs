//! Type-state builder for `Controller`.
//!
//! `build()` only exists once a front end, a power stage and a configuration
//! store have been supplied. Everything else has a default: board calibration,
//! nominal rates, a discarding telemetry sink and the monotonic clock.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Sender;
use mppt_traits::{AnalogFrontEnd, Channel, Clock, ConfigStore, MonotonicClock, PowerStage, Telemetry};

use crate::calibration::Calibration;
use crate::command::Command;
use crate::config::{ControllerConfig, load_config};
use crate::control::{TickOutcome, sample_and_tick};
use crate::error::{BuildError, FaultKind, MpptError, Result};
use crate::fixed_point::DUTY_MIN;
use crate::hw_error::boxed;
use crate::mocks::NullTelemetry;
use crate::runtime::Rates;
use crate::shared::{ControlShared, SharedControlState};
use crate::status::{ControlOutput, TrackerStatus};
use crate::supervisor::{Supervisor, lock_tracker};
use crate::tracking::{AlgorithmTag, IvSweep, Tracker};

// ── Controller ───────────────────────────────────────────────────────────────

/// A wired controller. Drive it tick by tick, or hand it to `runtime::run`.
pub struct Controller<F, P> {
    pub(crate) shared: SharedControlState<P>,
    pub(crate) tracker: Mutex<Tracker>,
    pub(crate) supervisor: Supervisor,
    pub(crate) front_end: F,
    pub(crate) rates: Rates,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) epoch: Instant,
    calibration: Calibration,
    commands: Sender<Command>,
}

impl<F, P> core::fmt::Debug for Controller<F, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("rates", &self.rates)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Controller<(), ()> {
    /// Start building a Controller.
    pub fn builder() -> ControllerBuilder<Missing, Missing, Missing> {
        ControllerBuilder::default()
    }
}

impl<F: AnalogFrontEnd, P: PowerStage> Controller<F, P> {
    /// One control-rate step: sample, protect, regulate.
    pub fn sample_tick(&mut self) -> TickOutcome {
        sample_and_tick(&mut self.front_end, &self.shared)
    }

    /// One tracking-rate step.
    pub fn track_tick(&self) {
        lock_tracker(&self.tracker).tick(&self.shared);
    }

    /// One supervisor iteration at the clock's current time.
    pub fn poll(&mut self) -> Result<()> {
        let now = self.clock.ms_since(self.epoch);
        self.poll_at(now)
    }

    /// One supervisor iteration at an explicit time since start.
    pub fn poll_at(&mut self, now_ms: u64) -> Result<()> {
        self.supervisor.poll(now_ms, &self.shared, &self.tracker)
    }

    /// Handle for queueing commands from another thread.
    pub fn command_sender(&self) -> Sender<Command> {
        self.commands.clone()
    }

    pub fn start_iv_sweep(&self) -> Option<IvSweep> {
        lock_tracker(&self.tracker).start_iv_sweep(&self.shared)
    }

    /// Write a target immediately, bypassing the command queue.
    pub fn set_target_mv(&self, millivolts: i32) -> i32 {
        lock_tracker(&self.tracker).set_voltage(&self.shared, millivolts)
    }

    pub fn algorithm(&self) -> AlgorithmTag {
        lock_tracker(&self.tracker).algorithm()
    }

    pub fn status(&self) -> TrackerStatus {
        self.shared.critical(|s| s.status())
    }

    pub fn output(&self) -> ControlOutput {
        self.shared.critical(|s| s.output())
    }

    pub fn target_raw(&self) -> i32 {
        self.shared.critical(|s| s.target())
    }

    /// Filtered reading of `channel` in milli-units.
    pub fn reading_milli(&self, channel: Channel) -> i32 {
        let cal = self.calibration;
        self.shared.critical(|s| s.filtered_milli(channel, &cal))
    }

    pub fn config(&self) -> &ControllerConfig {
        self.supervisor.config()
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn rates(&self) -> Rates {
        self.rates
    }

    pub fn faults(&self) -> &[FaultKind] {
        self.supervisor.faults()
    }

    /// Direct access to the control state, e.g. to inspect the power stage.
    pub fn shared(&self) -> &SharedControlState<P> {
        &self.shared
    }

    /// Disable the power stage and stop tracking.
    pub fn shutdown(&self) {
        self.shared.critical(|s| s.disable_tracking());
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `Controller`. `F` and `P` are the front-end and power-stage
/// types once supplied.
pub struct ControllerBuilder<F, P, S> {
    front_end: Option<F>,
    power_stage: Option<P>,
    store: Option<Box<dyn ConfigStore + Send>>,
    telemetry: Option<Box<dyn Telemetry + Send>>,
    calibration: Option<Calibration>,
    rates: Option<Rates>,
    first_run: Option<ControllerConfig>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    _s: PhantomData<S>,
}

impl Default for ControllerBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            front_end: None,
            power_stage: None,
            store: None,
            telemetry: None,
            calibration: None,
            rates: None,
            first_run: None,
            clock: None,
            _s: PhantomData,
        }
    }
}

impl<F, P, S> ControllerBuilder<F, P, S> {
    pub fn with_front_end<G: AnalogFrontEnd>(self, front_end: G) -> ControllerBuilder<G, P, S> {
        ControllerBuilder {
            front_end: Some(front_end),
            power_stage: self.power_stage,
            store: self.store,
            telemetry: self.telemetry,
            calibration: self.calibration,
            rates: self.rates,
            first_run: self.first_run,
            clock: self.clock,
            _s: PhantomData,
        }
    }

    pub fn with_power_stage<Q: PowerStage>(self, power_stage: Q) -> ControllerBuilder<F, Q, S> {
        ControllerBuilder {
            front_end: self.front_end,
            power_stage: Some(power_stage),
            store: self.store,
            telemetry: self.telemetry,
            calibration: self.calibration,
            rates: self.rates,
            first_run: self.first_run,
            clock: self.clock,
            _s: PhantomData,
        }
    }

    pub fn with_store(self, store: impl ConfigStore + Send + 'static) -> ControllerBuilder<F, P, Set> {
        ControllerBuilder {
            front_end: self.front_end,
            power_stage: self.power_stage,
            store: Some(Box::new(store)),
            telemetry: self.telemetry,
            calibration: self.calibration,
            rates: self.rates,
            first_run: self.first_run,
            clock: self.clock,
            _s: PhantomData,
        }
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: impl Telemetry + Send + 'static) -> Self {
        self.telemetry = Some(Box::new(telemetry));
        self
    }

    #[must_use]
    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = Some(calibration);
        self
    }

    #[must_use]
    pub fn with_rates(mut self, rates: Rates) -> Self {
        self.rates = Some(rates);
        self
    }

    /// Configuration written when the store turns out to be empty.
    #[must_use]
    pub fn with_first_run_config(mut self, cfg: ControllerConfig) -> Self {
        self.first_run = Some(cfg);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
}

fn validate_rates(r: &Rates) -> std::result::Result<(), BuildError> {
    if r.control_hz == 0 {
        return Err(BuildError::InvalidConfig("control_hz must be > 0"));
    }
    if r.track_hz == 0 {
        return Err(BuildError::InvalidConfig("track_hz must be > 0"));
    }
    if r.track_hz > r.control_hz {
        return Err(BuildError::InvalidConfig("track_hz must be <= control_hz"));
    }
    if r.telemetry_ms == 0 {
        return Err(BuildError::InvalidConfig("telemetry_ms must be >= 1"));
    }
    Ok(())
}

impl<F: AnalogFrontEnd, P: PowerStage, S> ControllerBuilder<F, P, S> {
    /// Validate, load the persisted configuration and wire everything up.
    ///
    /// The power stage is disabled before the store is read; on a corrupt
    /// image it stays disabled and `MpptError::ConfigCorrupt` is returned.
    pub fn try_build(self) -> Result<Controller<F, P>> {
        let rates = self.rates.unwrap_or_default();
        validate_rates(&rates).map_err(eyre::Report::new)?;
        let mut store = self
            .store
            .ok_or_else(|| eyre::Report::new(BuildError::MissingStore))?;
        let (Some(front_end), Some(mut power_stage)) = (self.front_end, self.power_stage) else {
            return Err(eyre::Report::new(MpptError::State(
                "front end and power stage must both be set".into(),
            )));
        };

        power_stage
            .set_enabled(false)
            .and_then(|()| power_stage.set_duty_cycle(DUTY_MIN))
            .map_err(|e| eyre::Report::new(boxed(&e)))?;

        let first_run = self.first_run.unwrap_or_default();
        let config = load_config(store.as_mut(), &first_run)?;
        let calibration = self.calibration.unwrap_or_default();

        let shared = SharedControlState::new(ControlShared::new(power_stage, &config, &calibration));
        let mut tracker = Tracker::new(&config, calibration, rates.track_hz);
        tracker.switch_to(config.algorithm, &shared);

        let (commands, rx) = crossbeam_channel::unbounded();
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Box::new(NullTelemetry));
        let supervisor = Supervisor::new(
            store,
            telemetry,
            config,
            calibration,
            rx,
            rates.track_hz,
            rates.telemetry_ms,
        );
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let epoch = clock.now();

        tracing::info!(
            algorithm = %config.algorithm,
            max_vout_mv = config.max_output_voltage,
            min_vin_mv = config.min_input_voltage,
            "controller ready"
        );

        Ok(Controller {
            shared,
            tracker: Mutex::new(tracker),
            supervisor,
            front_end,
            rates,
            clock,
            epoch,
            calibration,
            commands,
        })
    }
}

impl<F: AnalogFrontEnd, P: PowerStage> ControllerBuilder<F, P, Set> {
    pub fn build(self) -> Result<Controller<F, P>> {
        self.try_build()
    }
}
