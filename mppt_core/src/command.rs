//! Commands accepted by the supervisor from the telemetry/command bus.

use crate::config::ParamId;
use crate::tracking::AlgorithmTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SelectAlgorithm(AlgorithmTag),
    /// Input-voltage setpoint in mV. The running algorithm may override it
    /// on its next update; select `Manual` to hold it.
    SetTarget { millivolts: i32 },
    StartIvSweep,
    /// Set the target, then stream Vin and duty for the tuning window.
    SetAndTune { millivolts: i32 },
    SetParameter { param: ParamId, value: i32 },
}
