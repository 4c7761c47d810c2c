//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "mppt", version, about = "MPPT charge controller CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/mppt_config.toml")]
    pub config: PathBuf,

    /// Optional calibration CSV (channel,raw,milli); overrides [calibration]
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Print results and log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Current
        } else {
            Self::None
        }
    }
}

/// Tracking algorithm names as accepted on the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AlgorithmArg {
    Openloop,
    Pando,
    Ivsweep,
    Manual,
}

impl From<AlgorithmArg> for mppt_config::Algorithm {
    fn from(a: AlgorithmArg) -> Self {
        match a {
            AlgorithmArg::Openloop => Self::OpenLoop,
            AlgorithmArg::Pando => Self::Pando,
            AlgorithmArg::Ivsweep => Self::IvSweep,
            AlgorithmArg::Manual => Self::Manual,
        }
    }
}

/// Real-time knobs shared by the commands that run the controller.
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct RtArgs {
    /// Enable real-time mode (per-task SCHED_FIFO, mlockall)
    #[arg(
        long,
        action = ArgAction::SetTrue,
        long_help = "Enable real-time mode on supported OSes.\n\nLinux: the control task gets the highest SCHED_FIFO priority, the tracking task a lower one and the supervisor loop the lowest, so control always preempts tracking and tracking preempts the supervisor. The process address space is locked with mlockall. Usually requires CAP_SYS_NICE and CAP_IPC_LOCK (or root).\n\nOther OSes: only memory locking is attempted."
    )]
    pub rt: bool,
    /// SCHED_FIFO priority of the control task; lower tasks are placed below it
    #[arg(long, value_name = "PRIO")]
    pub rt_prio: Option<i32>,
    /// Select memory locking mode for --rt: none, current, or all
    #[arg(long, value_enum, value_name = "MODE")]
    pub rt_lock: Option<RtLock>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against the simulated panel
    Run {
        /// Stop after this many milliseconds (Ctrl-C stops earlier)
        #[arg(long, value_name = "MS")]
        duration_ms: u64,
        /// Select a tracking algorithm for this run (not persisted)
        #[arg(long, value_enum)]
        algorithm: Option<AlgorithmArg>,
        /// Manual input voltage target in mV; implies --algorithm manual
        #[arg(long, value_name = "MV")]
        target_mv: Option<i32>,
        #[command(flatten)]
        rt: RtArgs,
    },
    /// Trace the panel's IV curve and print the points
    Sweep {
        /// Print points as CSV (vin_mv,iin_ma,power_mw)
        #[arg(long, action = ArgAction::SetTrue)]
        csv: bool,
        /// Give up if the sweep has not finished after this many milliseconds
        #[arg(long, value_name = "MS", default_value_t = 30_000)]
        timeout_ms: u64,
        #[command(flatten)]
        rt: RtArgs,
    },
    /// Inspect or edit the persisted controller configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Verify the stored configuration image and the simulated front end
    SelfCheck,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Decode and print the persisted configuration
    Show,
    /// Overwrite the persisted configuration with first-run defaults
    Reset,
    /// Write one parameter (bounds-checked) and persist it
    Set {
        /// Parameter name, e.g. min_vin_mv or ivsweep_step_mv
        param: String,
        /// New value; periods are in ms, algorithm accepts a name or id
        value: String,
    },
}
