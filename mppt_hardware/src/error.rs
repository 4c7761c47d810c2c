use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("adc conversion failed: {0}")]
    Adc(String),
    #[error("adc timeout")]
    Timeout,
    #[error("duty cycle {0} outside the power stage range")]
    DutyOutOfRange(u16),
    #[error("power stage fault latched")]
    FaultLatched,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
