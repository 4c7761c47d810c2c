use thiserror::Error;

/// Conditions that take the power stage down.
///
/// `ConfigCorrupt` is fatal; every other kind is a recoverable panic that the
/// supervisor clears by re-enabling tracking once start conditions hold.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    #[error("persisted configuration is corrupt")]
    ConfigCorrupt,
    #[error("output over voltage")]
    OutputOverVoltage,
    #[error("input under voltage")]
    InputUnderVoltage,
    #[error("power stage shut down (fault line released)")]
    FpgaShutdown,
    #[error("analog front end stopped delivering samples")]
    SampleStall,
}

impl FaultKind {
    /// Code reported on the telemetry bus.
    pub const fn code(self) -> u8 {
        match self {
            Self::ConfigCorrupt => 1,
            Self::OutputOverVoltage => 2,
            Self::InputUnderVoltage => 3,
            Self::FpgaShutdown => 4,
            Self::SampleStall => 5,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::ConfigCorrupt),
            2 => Some(Self::OutputOverVoltage),
            3 => Some(Self::InputUnderVoltage),
            4 => Some(Self::FpgaShutdown),
            5 => Some(Self::SampleStall),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum MpptError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("timeout waiting for hardware")]
    Timeout,
    #[error("persisted configuration is corrupt: {0}")]
    ConfigCorrupt(ConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Problems with a persisted controller image or a parameter write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("image is {found} bytes, expected {expected}")]
    Length { expected: usize, found: usize },
    #[error("presence marker {0:#04x} does not match")]
    Magic(u8),
    #[error("checksum mismatch (stored sum {stored_sum:#04x} xor {stored_xor:#04x}, computed sum {sum:#04x} xor {xor:#04x})")]
    Integrity {
        stored_sum: u8,
        stored_xor: u8,
        sum: u8,
        xor: u8,
    },
    #[error("unknown algorithm id {0}")]
    UnknownAlgorithm(u8),
    #[error("{param} value {value} is out of range")]
    OutOfRange { param: &'static str, value: i64 },
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing configuration store")]
    MissingStore,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
