//! Simulated photovoltaic panel, converter and battery.
//!
//! One `PvPlant` is shared between the simulated front end and power stage.
//! The panel follows a single-diode curve `I(V) = Isc * (1 - exp((V - Voc)/knee))`;
//! the input capacitor integrates the difference between panel current and the
//! converter's draw once per front-end sample, so the plant only advances when
//! the control task samples it.

use crate::error::HwError;
use mppt_traits::{AnalogFrontEnd, BoxError, Channel, PowerStage, SampleFrame};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const ADC_MAX: u16 = 4095;

/// Raw ADC readings for the channels the plant does not model.
const AMBIENT_RAW: u16 = 1700;
const HEATSINK_RAW: u16 = 140;

/// Inverse of the controller's `(raw*m + b)/1000` calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelScale {
    pub m: i32,
    pub b: i32,
}

impl ChannelScale {
    pub fn to_raw(self, milli: f64) -> u16 {
        if self.m == 0 {
            return 0;
        }
        let raw = (milli * 1000.0 - f64::from(self.b)) / f64::from(self.m);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let raw = raw.clamp(0.0, f64::from(ADC_MAX)) as u16;
        raw
    }
}

#[derive(Debug, Clone)]
pub struct PlantParams {
    pub voc_mv: f64,
    pub isc_ma: f64,
    pub knee_mv: f64,
    pub battery_mv: f64,
    pub battery_mohm: f64,
    /// Converter input current at full duty.
    pub max_draw_ma: f64,
    pub duty_full: u16,
    /// Input capacitor response, millivolts per milliamp of imbalance per sample.
    pub cap_mv_per_ma: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            voc_mv: 120_000.0,
            isc_ma: 6_000.0,
            knee_mv: 6_000.0,
            battery_mv: 110_000.0,
            battery_mohm: 50.0,
            max_draw_ma: 8_000.0,
            duty_full: 996,
            cap_mv_per_ma: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OperatingPoint {
    pub vin_mv: f64,
    pub iin_ma: f64,
    pub vout_mv: f64,
}

impl OperatingPoint {
    pub fn power_mw(&self) -> f64 {
        self.vin_mv * self.iin_ma / 1000.0
    }
}

#[derive(Debug)]
struct PlantState {
    vin_mv: f64,
    duty: u16,
    enabled: bool,
    fault_latched: bool,
    irradiance_permille: u16,
    battery_mv: f64,
    failing_samples: u32,
}

/// Shared handle to the simulated plant; clones observe the same state.
#[derive(Debug, Clone)]
pub struct PvPlant {
    params: Arc<PlantParams>,
    state: Arc<Mutex<PlantState>>,
}

impl PvPlant {
    pub fn new(params: PlantParams) -> Self {
        let state = PlantState {
            vin_mv: params.voc_mv,
            duty: 0,
            enabled: false,
            fault_latched: false,
            irradiance_permille: 1000,
            battery_mv: params.battery_mv,
            failing_samples: 0,
        };
        Self {
            params: Arc::new(params),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn params(&self) -> &PlantParams {
        &self.params
    }

    fn panel_current(&self, st: &PlantState, vin_mv: f64) -> f64 {
        let p = &*self.params;
        let isc = p.isc_ma * f64::from(st.irradiance_permille) / 1000.0;
        let exponent = ((vin_mv - p.voc_mv) / p.knee_mv).min(50.0);
        isc * (1.0 - exponent.exp())
    }

    fn draw(&self, st: &PlantState) -> f64 {
        if !st.enabled || st.fault_latched {
            return 0.0;
        }
        self.params.max_draw_ma * f64::from(st.duty) / f64::from(self.params.duty_full.max(1))
    }

    fn point(&self, st: &PlantState) -> OperatingPoint {
        let iin = self.draw(st);
        let power_mw = st.vin_mv * iin / 1000.0;
        let iout_ma = if st.battery_mv > 0.0 {
            power_mw * 1000.0 / st.battery_mv
        } else {
            0.0
        };
        OperatingPoint {
            vin_mv: st.vin_mv,
            iin_ma: iin,
            vout_mv: st.battery_mv + iout_ma * self.params.battery_mohm / 1000.0,
        }
    }

    /// Advance the input capacitor by one sample period.
    fn step(&self, st: &mut PlantState) {
        let imbalance = self.panel_current(st, st.vin_mv) - self.draw(st);
        st.vin_mv = (st.vin_mv + imbalance * self.params.cap_mv_per_ma).max(0.0);
    }

    pub fn operating_point(&self) -> OperatingPoint {
        let st = self.lock();
        self.point(&st)
    }

    pub fn duty(&self) -> u16 {
        self.lock().duty
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn set_irradiance(&self, permille: u16) {
        self.lock().irradiance_permille = permille.min(1000);
    }

    pub fn set_battery_mv(&self, mv: f64) {
        self.lock().battery_mv = mv;
    }

    /// Latch a power-stage shutdown, as the protection logic would on overcurrent.
    pub fn trip_fault(&self) {
        self.lock().fault_latched = true;
    }

    /// Make the next `n` front-end samples fail.
    pub fn fail_next_samples(&self, n: u32) {
        self.lock().failing_samples = n;
    }

    pub fn front_end(&self, scales: [ChannelScale; Channel::COUNT]) -> SimFrontEnd {
        SimFrontEnd {
            plant: self.clone(),
            scales,
        }
    }

    pub fn power_stage(&self) -> SimPowerStage {
        SimPowerStage {
            plant: self.clone(),
        }
    }
}

/// Front end that samples the plant through the inverse calibration.
#[derive(Debug, Clone)]
pub struct SimFrontEnd {
    plant: PvPlant,
    scales: [ChannelScale; Channel::COUNT],
}

impl SimFrontEnd {
    fn scale(&self, ch: Channel) -> ChannelScale {
        self.scales[ch.index()]
    }
}

impl AnalogFrontEnd for SimFrontEnd {
    fn sample(&mut self) -> Result<SampleFrame, BoxError> {
        let mut st = self.plant.lock();
        if st.failing_samples > 0 {
            st.failing_samples -= 1;
            return Err(Box::new(HwError::Timeout));
        }
        self.plant.step(&mut st);
        let op = self.plant.point(&st);
        drop(st);

        let frame = SampleFrame::default()
            .with(Channel::AmbientTemp, AMBIENT_RAW)
            .with(Channel::HeatsinkTemp, HEATSINK_RAW)
            .with(Channel::Rail15V, self.scale(Channel::Rail15V).to_raw(15_000.0))
            .with(
                Channel::OutputVoltage,
                self.scale(Channel::OutputVoltage).to_raw(op.vout_mv),
            )
            .with(
                Channel::InputCurrent,
                self.scale(Channel::InputCurrent).to_raw(op.iin_ma),
            )
            .with(
                Channel::InputVoltage,
                self.scale(Channel::InputVoltage).to_raw(op.vin_mv),
            );
        Ok(frame)
    }
}

/// Power stage that drives the plant's converter draw.
#[derive(Debug, Clone)]
pub struct SimPowerStage {
    plant: PvPlant,
}

impl PowerStage for SimPowerStage {
    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), BoxError> {
        if duty > self.plant.params.duty_full {
            return Err(Box::new(HwError::DutyOutOfRange(duty)));
        }
        self.plant.lock().duty = duty;
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), BoxError> {
        let mut st = self.plant.lock();
        if enabled && st.fault_latched {
            return Err(Box::new(HwError::FaultLatched));
        }
        if st.enabled != enabled {
            tracing::debug!(enabled, "sim power stage");
        }
        st.enabled = enabled;
        Ok(())
    }

    fn fault_signal_asserted(&mut self) -> bool {
        !self.plant.lock().fault_latched
    }

    fn reset_fault_latch(&mut self) -> Result<(), BoxError> {
        self.plant.lock().fault_latched = false;
        Ok(())
    }
}
