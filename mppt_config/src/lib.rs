#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and calibration parsing for the MPPT controller.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `[controller]` only seeds the persisted controller image on first run;
//!   after that the sealed image in `[store].path` is authoritative.
//! - The calibration CSV loader fits one linear `(m, b)` pair per channel and
//!   refits once without outliers.
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Absolute bounds that no configuration may exceed, in millivolts.
pub mod limits {
    /// Output ceiling accepted for `max_vout_mv`.
    pub const ABS_MAX_VOUT_MV: i32 = 170_000;
    /// Input floor accepted for `min_vin_mv`.
    pub const ABS_MIN_VIN_MV: i32 = 26_000;
    /// Probe target the tracker parks at while re-measuring the panel.
    pub const ABS_MAX_VIN_MV: i32 = 150_000;
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeCfg {
    /// Sample + control task rate.
    pub control_hz: u32,
    /// Tracking state machine rate.
    pub track_hz: u32,
    /// Main-loop telemetry cadence.
    pub telemetry_ms: u64,
}

impl Default for RuntimeCfg {
    fn default() -> Self {
        Self {
            control_hz: 1160,
            track_hz: 32,
            telemetry_ms: 800,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    OpenLoop,
    #[default]
    Pando,
    IvSweep,
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerCfg {
    pub max_vout_mv: i32,
    pub min_vin_mv: i32,
    pub algorithm: Algorithm,
    /// Open-loop target as a per-mille fraction of the sampled input voltage.
    pub openloop_ratio: u16,
    pub openloop_retrack_ms: u32,
    /// P&O perturbation in raw ADC counts.
    pub perturb_step: u16,
    pub ivsweep_step_mv: u16,
    pub ivsweep_sample_ms: u32,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            max_vout_mv: 154_000,
            min_vin_mv: 30_000,
            algorithm: Algorithm::Pando,
            openloop_ratio: 800,
            openloop_retrack_ms: 10_000,
            perturb_step: 12,
            ivsweep_step_mv: 300,
            ivsweep_sample_ms: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PidCfg {
    pub kp: i32,
    pub ki: i32,
    #[serde(default)]
    pub kd: i32,
}

fn default_input_pid() -> PidCfg {
    PidCfg {
        kp: 7000,
        ki: 400,
        kd: 0,
    }
}

fn default_output_pid() -> PidCfg {
    PidCfg {
        kp: -10_000,
        ki: -30,
        kd: 0,
    }
}

/// Linear conversion `milli = (raw * m + b) / 1000`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LinearCal {
    pub m: i32,
    pub b: i32,
}

/// Per-channel calibration overrides; absent channels use the board defaults.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CalibrationCfg {
    pub ambient_temp: Option<LinearCal>,
    pub heatsink_temp: Option<LinearCal>,
    pub rail_15v: Option<LinearCal>,
    pub vout: Option<LinearCal>,
    pub iin: Option<LinearCal>,
    pub vin: Option<LinearCal>,
}

impl CalibrationCfg {
    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<LinearCal>> {
        match name {
            "ambient_temp" => Some(&mut self.ambient_temp),
            "heatsink_temp" => Some(&mut self.heatsink_temp),
            "rail_15v" => Some(&mut self.rail_15v),
            "vout" => Some(&mut self.vout),
            "iin" => Some(&mut self.iin),
            "vin" => Some(&mut self.vin),
            _ => None,
        }
    }

    fn entries(&self) -> [(&'static str, Option<LinearCal>); 6] {
        [
            ("ambient_temp", self.ambient_temp),
            ("heatsink_temp", self.heatsink_temp),
            ("rail_15v", self.rail_15v),
            ("vout", self.vout),
            ("iin", self.iin),
            ("vin", self.vin),
        ]
    }

    /// Overlay `other` on top of `self`, channel by channel.
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        for (name, cal) in other.entries() {
            if let (Some(cal), Some(slot)) = (cal, self.slot_mut(name)) {
                *slot = Some(cal);
            }
        }
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreCfg {
    /// Sealed controller configuration image.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Parameters of the simulated panel, converter and battery.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationCfg {
    pub voc_mv: i32,
    pub isc_ma: i32,
    /// Exponential knee of the diode model; smaller is a sharper knee.
    pub knee_mv: i32,
    pub battery_mv: i32,
    /// Converter input current drawn at full duty.
    pub max_draw_ma: i32,
}

impl Default for SimulationCfg {
    fn default() -> Self {
        Self {
            voc_mv: 120_000,
            isc_ma: 6_000,
            knee_mv: 6_000,
            battery_mv: 110_000,
            max_draw_ma: 8_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeCfg,
    #[serde(default)]
    pub controller: ControllerCfg,
    #[serde(default = "default_input_pid")]
    pub input_pid: PidCfg,
    #[serde(default = "default_output_pid")]
    pub output_pid: PidCfg,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    pub store: StoreCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub simulation: SimulationCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        use limits::{ABS_MAX_VOUT_MV, ABS_MIN_VIN_MV};

        // Runtime
        if self.runtime.control_hz == 0 {
            eyre::bail!("runtime.control_hz must be > 0");
        }
        if self.runtime.track_hz == 0 {
            eyre::bail!("runtime.track_hz must be > 0");
        }
        if self.runtime.track_hz > self.runtime.control_hz {
            eyre::bail!("runtime.track_hz must be <= runtime.control_hz");
        }
        if self.runtime.telemetry_ms == 0 {
            eyre::bail!("runtime.telemetry_ms must be >= 1");
        }

        // Controller seed
        let c = &self.controller;
        if c.max_vout_mv <= 0 || c.max_vout_mv > ABS_MAX_VOUT_MV {
            eyre::bail!("controller.max_vout_mv must be in (0, {ABS_MAX_VOUT_MV}]");
        }
        if c.min_vin_mv < ABS_MIN_VIN_MV {
            eyre::bail!("controller.min_vin_mv must be >= {ABS_MIN_VIN_MV}");
        }
        if c.openloop_ratio == 0 || c.openloop_ratio > 1000 {
            eyre::bail!("controller.openloop_ratio must be in [1, 1000]");
        }
        if c.perturb_step == 0 {
            eyre::bail!("controller.perturb_step must be >= 1");
        }
        if c.ivsweep_step_mv == 0 {
            eyre::bail!("controller.ivsweep_step_mv must be >= 1");
        }

        // Calibration
        for (name, cal) in self.calibration.entries() {
            if let Some(cal) = cal
                && cal.m == 0
            {
                eyre::bail!("calibration.{name}.m must be non-zero");
            }
        }

        // Simulation
        let s = &self.simulation;
        if s.voc_mv <= 0 || s.isc_ma <= 0 || s.knee_mv <= 0 {
            eyre::bail!("simulation.voc_mv, isc_ma and knee_mv must be > 0");
        }
        if s.max_draw_ma <= 0 {
            eyre::bail!("simulation.max_draw_ma must be > 0");
        }

        Ok(())
    }
}

/// Calibration CSV schema.
///
/// Expected headers:
/// channel,raw,milli
///
/// Example:
/// channel,raw,milli
/// vin,750,30000
/// vin,2970,120000
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationRow {
    pub channel: String,
    pub raw: i64,
    pub milli: f64,
}

/// Fit `milli = a*raw + c` by ordinary least squares, then refit once after
/// dropping points whose residual exceeds 2σ. Returns the integer `(m, b)`
/// pair used by the firmware-style `(raw*m + b)/1000` conversion.
pub fn fit_channel(points: &[(i64, f64)]) -> eyre::Result<LinearCal> {
    if points.len() < 2 {
        eyre::bail!("calibration requires at least two rows, got {}", points.len());
    }
    for w in points.windows(2) {
        if w[0].0 == w[1].0 {
            eyre::bail!("calibration rows have duplicate raw value {}", w[0].0);
        }
    }

    let (a0, c0) = ols(points.iter().copied())?;
    let sumsq: f64 = points
        .iter()
        .map(|&(x, y)| {
            let r = y - (a0 * x as f64 + c0);
            r * r
        })
        .sum();
    let rms = (sumsq / points.len() as f64).sqrt();

    let (a, c) = if rms.is_finite() && rms > 0.0 {
        let thr = 2.0 * rms;
        let inliers: Vec<(i64, f64)> = points
            .iter()
            .copied()
            .filter(|&(x, y)| (y - (a0 * x as f64 + c0)).abs() <= thr)
            .collect();
        if inliers.len() >= 2 && inliers.len() < points.len() {
            ols(inliers.into_iter()).unwrap_or((a0, c0))
        } else {
            (a0, c0)
        }
    } else {
        (a0, c0)
    };

    let m = (a * 1000.0).round();
    let b = (c * 1000.0).round();
    if !(m.is_finite() && b.is_finite()) || m == 0.0 {
        eyre::bail!("calibration produced an unusable slope");
    }
    if m.abs() > f64::from(i32::MAX) || b.abs() > f64::from(i32::MAX) {
        eyre::bail!("calibration coefficients overflow the integer range");
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(LinearCal {
        m: m as i32,
        b: b as i32,
    })
}

fn ols(pts: impl Iterator<Item = (i64, f64)> + Clone) -> eyre::Result<(f64, f64)> {
    let n = pts.clone().count() as f64;
    let mean_x = pts.clone().map(|p| p.0 as f64).sum::<f64>() / n;
    let mean_y = pts.clone().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut sxy) = (0.0f64, 0.0f64);
    for (x, y) in pts {
        let dx = x as f64 - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if !sxx.is_finite() || sxx == 0.0 {
        eyre::bail!("calibration cannot determine slope (degenerate raw variance)");
    }
    let a = sxy / sxx;
    if !a.is_finite() || a == 0.0 {
        eyre::bail!("calibration produced zero or non-finite slope");
    }
    Ok((a, mean_y - a * mean_x))
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<CalibrationCfg> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != ["channel", "raw", "milli"] {
        eyre::bail!(
            "calibration CSV must have headers 'channel,raw,milli', got: {}",
            actual.join(",")
        );
    }

    let mut by_channel: BTreeMap<String, Vec<(i64, f64)>> = BTreeMap::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        let row = rec.map_err(|e| eyre::eyre!("invalid CSV row {}: {}", idx + 2, e))?;
        by_channel
            .entry(row.channel)
            .or_default()
            .push((row.raw, row.milli));
    }

    let mut out = CalibrationCfg::default();
    for (name, mut pts) in by_channel {
        pts.sort_by_key(|p| p.0);
        let cal = fit_channel(&pts).map_err(|e| eyre::eyre!("channel {name}: {e}"))?;
        let Some(slot) = out.slot_mut(&name) else {
            eyre::bail!("calibration CSV names unknown channel '{name}'");
        };
        *slot = Some(cal);
    }
    Ok(out)
}
