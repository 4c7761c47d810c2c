//! Persisted controller configuration and its integrity contract.
//!
//! The image is a fixed little-endian record sealed with two 8-bit checks
//! (wrapping sum and xor of every byte, computed with both check bytes
//! zeroed) plus a presence marker. A mismatch on load is fatal.

use mppt_config::limits::{ABS_MAX_VIN_MV, ABS_MAX_VOUT_MV, ABS_MIN_VIN_MV};
use mppt_traits::ConfigStore;

use crate::error::{ConfigError, MpptError, Result};
use crate::hw_error::boxed;
use crate::pid::PidConstants;
use crate::tracking::AlgorithmTag;
use crate::util::period_to_ticks;

/// Presence marker written into every sealed image.
pub const CONFIG_MAGIC: u8 = 0xAA;

/// Size of the sealed image in bytes.
pub const IMAGE_LEN: usize = 46;

const OFF_MAGIC: usize = 43;
const OFF_CHECKSUM: usize = 44;
const OFF_CHECKXOR: usize = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Output ceiling the output loop regulates against, in mV.
    pub max_output_voltage: i32,
    /// Input floor for targets and start conditions, in mV.
    pub min_input_voltage: i32,
    pub algorithm: AlgorithmTag,
    pub input_pid: PidConstants,
    pub output_pid: PidConstants,
    /// Per-mille of the sampled input voltage used as the open-loop target.
    pub openloop_ratio: u16,
    /// P&O perturbation in raw counts.
    pub perturb_step: u16,
    /// Tracking ticks between open-loop re-probes.
    pub openloop_retrack_period: u16,
    /// Tracking ticks between IV sweep points.
    pub ivsweep_sample_period: u16,
    /// IV sweep decrement, in mV.
    pub ivsweep_step_size: u16,
    pub magic: u8,
    pub checksum: u8,
    pub checkxor: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let hz = crate::util::TRACK_HZ;
        Self {
            max_output_voltage: 154_000,
            min_input_voltage: 30_000,
            algorithm: AlgorithmTag::PerturbAndObserve,
            input_pid: PidConstants::new(7000, 400, 0),
            output_pid: PidConstants::new(-10_000, -30, 0),
            openloop_ratio: 800,
            perturb_step: 12,
            openloop_retrack_period: ticks_u16(10_000, hz),
            ivsweep_sample_period: ticks_u16(30, hz),
            ivsweep_step_size: 300,
            magic: 0,
            checksum: 0,
            checkxor: 0,
        }
    }
}

fn ticks_u16(ms: u32, hz: u32) -> u16 {
    u16::try_from(period_to_ticks(ms, hz)).unwrap_or(u16::MAX)
}

/// Wrapping sum and xor over `bytes` with the two check bytes treated as zero.
fn integrity(bytes: &[u8; IMAGE_LEN]) -> (u8, u8) {
    bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != OFF_CHECKSUM && *i != OFF_CHECKXOR)
        .fold((0u8, 0u8), |(sum, xor), (_, &b)| (sum.wrapping_add(b), xor ^ b))
}

impl ControllerConfig {
    /// Serialize including whatever integrity fields are currently stored.
    pub fn to_bytes(&self) -> [u8; IMAGE_LEN] {
        let mut out = [0u8; IMAGE_LEN];
        let mut w = Writer::new(&mut out);
        w.i32(self.max_output_voltage);
        w.i32(self.min_input_voltage);
        w.u8(self.algorithm.id());
        for k in [self.input_pid, self.output_pid] {
            w.i32(k.kp);
            w.i32(k.ki);
            w.i32(k.kd);
        }
        w.u16(self.openloop_ratio);
        w.u16(self.perturb_step);
        w.u16(self.openloop_retrack_period);
        w.u16(self.ivsweep_sample_period);
        w.u16(self.ivsweep_step_size);
        w.u8(self.magic);
        w.u8(self.checksum);
        w.u8(self.checkxor);
        out
    }

    /// Set the presence marker and recompute both checks.
    pub fn seal(&mut self) {
        self.magic = CONFIG_MAGIC;
        let (sum, xor) = integrity(&self.to_bytes());
        self.checksum = sum;
        self.checkxor = xor;
    }

    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.seal();
        self
    }

    pub fn is_sealed(&self) -> bool {
        let (sum, xor) = integrity(&self.to_bytes());
        self.magic == CONFIG_MAGIC && self.checksum == sum && self.checkxor == xor
    }

    /// Decode and verify a sealed image.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, ConfigError> {
        let image: &[u8; IMAGE_LEN] = bytes.try_into().map_err(|_| ConfigError::Length {
            expected: IMAGE_LEN,
            found: bytes.len(),
        })?;
        if image[OFF_MAGIC] != CONFIG_MAGIC {
            return Err(ConfigError::Magic(image[OFF_MAGIC]));
        }
        let (sum, xor) = integrity(image);
        if image[OFF_CHECKSUM] != sum || image[OFF_CHECKXOR] != xor {
            return Err(ConfigError::Integrity {
                stored_sum: image[OFF_CHECKSUM],
                stored_xor: image[OFF_CHECKXOR],
                sum,
                xor,
            });
        }

        let mut r = Reader::new(image);
        let max_output_voltage = r.i32();
        let min_input_voltage = r.i32();
        let algo_id = r.u8();
        let algorithm =
            AlgorithmTag::from_id(algo_id).ok_or(ConfigError::UnknownAlgorithm(algo_id))?;
        let input_pid = PidConstants::new(r.i32(), r.i32(), r.i32());
        let output_pid = PidConstants::new(r.i32(), r.i32(), r.i32());
        Ok(Self {
            max_output_voltage,
            min_input_voltage,
            algorithm,
            input_pid,
            output_pid,
            openloop_ratio: r.u16(),
            perturb_step: r.u16(),
            openloop_retrack_period: r.u16(),
            ivsweep_sample_period: r.u16(),
            ivsweep_step_size: r.u16(),
            magic: r.u8(),
            checksum: r.u8(),
            checkxor: r.u8(),
        })
    }

    /// Apply one field write. Periods arrive in milliseconds and are stored as
    /// tracking ticks at `track_hz`. The integrity fields are left stale; seal
    /// before persisting.
    pub fn apply_parameter(
        &mut self,
        param: ParamId,
        value: i32,
        track_hz: u32,
    ) -> std::result::Result<(), ConfigError> {
        let out_of_range = || ConfigError::OutOfRange {
            param: param.name(),
            value: i64::from(value),
        };
        let as_u16 = |lo: u16| {
            u16::try_from(value)
                .ok()
                .filter(|v| *v >= lo)
                .ok_or_else(out_of_range)
        };
        let period = || {
            u32::try_from(value)
                .ok()
                .and_then(|ms| u16::try_from(period_to_ticks(ms, track_hz)).ok())
                .ok_or_else(out_of_range)
        };

        match param {
            ParamId::MaxOutputVoltage => {
                if value <= 0 || value > ABS_MAX_VOUT_MV {
                    return Err(out_of_range());
                }
                self.max_output_voltage = value;
            }
            ParamId::MinInputVoltage => {
                if !(ABS_MIN_VIN_MV..=ABS_MAX_VIN_MV).contains(&value) {
                    return Err(out_of_range());
                }
                self.min_input_voltage = value;
            }
            ParamId::Algorithm => {
                let id = u8::try_from(value).map_err(|_| out_of_range())?;
                self.algorithm =
                    AlgorithmTag::from_id(id).ok_or(ConfigError::UnknownAlgorithm(id))?;
            }
            ParamId::InputKp => self.input_pid.kp = value,
            ParamId::InputKi => self.input_pid.ki = value,
            ParamId::InputKd => self.input_pid.kd = value,
            ParamId::OutputKp => self.output_pid.kp = value,
            ParamId::OutputKi => self.output_pid.ki = value,
            ParamId::OutputKd => self.output_pid.kd = value,
            ParamId::OpenloopRatio => {
                let v = as_u16(1)?;
                if v > 1000 {
                    return Err(out_of_range());
                }
                self.openloop_ratio = v;
            }
            ParamId::PerturbStep => self.perturb_step = as_u16(1)?,
            ParamId::OpenloopRetrackPeriod => self.openloop_retrack_period = period()?,
            ParamId::IvsweepSamplePeriod => self.ivsweep_sample_period = period()?,
            ParamId::IvsweepStepSize => self.ivsweep_step_size = as_u16(1)?,
        }
        Ok(())
    }
}

/// Fields writable through the command bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamId {
    MaxOutputVoltage,
    MinInputVoltage,
    Algorithm,
    InputKp,
    InputKi,
    InputKd,
    OutputKp,
    OutputKi,
    OutputKd,
    OpenloopRatio,
    PerturbStep,
    OpenloopRetrackPeriod,
    IvsweepSamplePeriod,
    IvsweepStepSize,
}

impl ParamId {
    pub const ALL: [Self; 14] = [
        Self::MaxOutputVoltage,
        Self::MinInputVoltage,
        Self::Algorithm,
        Self::InputKp,
        Self::InputKi,
        Self::InputKd,
        Self::OutputKp,
        Self::OutputKi,
        Self::OutputKd,
        Self::OpenloopRatio,
        Self::PerturbStep,
        Self::OpenloopRetrackPeriod,
        Self::IvsweepSamplePeriod,
        Self::IvsweepStepSize,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::MaxOutputVoltage => "max_vout_mv",
            Self::MinInputVoltage => "min_vin_mv",
            Self::Algorithm => "algorithm",
            Self::InputKp => "input_kp",
            Self::InputKi => "input_ki",
            Self::InputKd => "input_kd",
            Self::OutputKp => "output_kp",
            Self::OutputKi => "output_ki",
            Self::OutputKd => "output_kd",
            Self::OpenloopRatio => "openloop_ratio",
            Self::PerturbStep => "perturb_step",
            Self::OpenloopRetrackPeriod => "openloop_retrack_ms",
            Self::IvsweepSamplePeriod => "ivsweep_sample_ms",
            Self::IvsweepStepSize => "ivsweep_step_mv",
        }
    }

    /// Whether the field feeds the derived raw-domain thresholds.
    pub const fn affects_thresholds(self) -> bool {
        matches!(self, Self::MaxOutputVoltage | Self::MinInputVoltage)
    }
}

impl core::str::FromStr for ParamId {
    type Err = MpptError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| MpptError::Config(format!("unknown parameter '{s}'")))
    }
}

impl core::fmt::Display for ParamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Load the persisted configuration.
///
/// An empty store is a first run: `first_run` is sealed, written and returned.
/// A corrupt image yields `MpptError::ConfigCorrupt`, which callers treat as
/// fatal.
pub fn load_config<S: ConfigStore + ?Sized>(
    store: &mut S,
    first_run: &ControllerConfig,
) -> Result<ControllerConfig> {
    let image = store
        .load()
        .map_err(|e| eyre::Report::new(boxed(&e)))?;
    match image {
        None => {
            tracing::info!("no persisted configuration; writing first-run defaults");
            let mut cfg = *first_run;
            persist_config(store, &mut cfg)?;
            Ok(cfg)
        }
        Some(bytes) => ControllerConfig::from_bytes(&bytes).map_err(|e| {
            tracing::error!(error = %e, "persisted configuration failed verification");
            eyre::Report::new(MpptError::ConfigCorrupt(e))
        }),
    }
}

/// Seal `cfg` in place and write it out.
pub fn persist_config<S: ConfigStore + ?Sized>(
    store: &mut S,
    cfg: &mut ControllerConfig,
) -> Result<()> {
    cfg.seal();
    store
        .persist(&cfg.to_bytes())
        .map_err(|e| eyre::Report::new(boxed(&e)))?;
    tracing::debug!(checksum = cfg.checksum, checkxor = cfg.checkxor, "configuration persisted");
    Ok(())
}

struct Writer<'a> {
    buf: &'a mut [u8; IMAGE_LEN],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8; IMAGE_LEN]) -> Self {
        Self { buf, pos: 0 }
    }
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }
    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8; IMAGE_LEN],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8; IMAGE_LEN]) -> Self {
        Self { buf, pos: 0 }
    }
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
}
