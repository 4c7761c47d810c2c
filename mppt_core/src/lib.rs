#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core MPPT charge-controller logic (hardware-agnostic).
//!
//! All hardware interaction goes through the `mppt_traits` seams:
//! `AnalogFrontEnd`, `PowerStage`, `ConfigStore` and `Telemetry`.
//!
//! ## Architecture
//!
//! - **Aggregation**: halving filter plus block accumulator per channel (`aggregator`)
//! - **Control**: dual PID with minimum-selection arbitration (`control`, `pid`)
//! - **Safety**: per-sample over/under-voltage and fault-line checks (`safety`)
//! - **Tracking**: open loop, perturb-and-observe, IV sweep, manual (`tracking`)
//! - **Supervision**: commands, telemetry, start conditions (`supervisor`)
//! - **Configuration**: sealed persisted image and parameter writes (`config`)
//! - **Runtime**: control and tracking threads with a priority contract (`runtime`)
//!
//! ## Fixed-Point Arithmetic
//!
//! Control and tracking work in raw ADC counts. PID outputs live in a
//! widened domain, `duty << OUTPUT_SHIFT`; see `fixed_point`. Conversions to
//! millivolts and milliamps happen only at the edges, via `calibration`.

pub mod aggregator;
pub mod atomic;
pub mod builder;
pub mod calibration;
pub mod command;
pub mod config;
pub mod control;
pub mod conversions;
pub mod error;
pub mod fixed_point;
pub mod hw_error;
pub mod mocks;
pub mod pid;
pub mod runtime;
pub mod safety;
pub mod shared;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod tracking;
pub mod util;

pub use builder::{Controller, ControllerBuilder};
pub use calibration::{Calibration, Linear};
pub use command::Command;
pub use config::{ControllerConfig, ParamId, load_config, persist_config};
pub use control::{TickOutcome, arbitrate};
pub use error::{BuildError, ConfigError, FaultKind, MpptError, Report, Result};
pub use runtime::{PriorityHook, Rates, RunReport, TaskPriority, run};
pub use shared::{ControlPort, SharedControlState};
pub use status::{ActiveLoop, ControlOutput, TrackerStatus};
pub use store::{FileStore, MemoryStore};
pub use supervisor::fatal_halt;
pub use tracking::{AlgorithmTag, IvPoint, IvSweep, SweepPoll, Tracker};
