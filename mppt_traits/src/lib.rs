//! Collaborator seams for the MPPT controller.
//!
//! Everything the control core touches outside its own memory goes through one
//! of these traits: the analog front end, the power-stage driver, the durable
//! configuration store and the telemetry/command bus. Errors crossing the
//! boundary are boxed so hardware crates are free to use their own types.

pub mod clock;

pub use clock::{Clock, MonotonicClock, Pacer};

/// Boxed error used at every trait boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Monitored analog channels, in front-end frame order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    AmbientTemp,
    HeatsinkTemp,
    Rail15V,
    OutputVoltage,
    InputCurrent,
    InputVoltage,
}

impl Channel {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::AmbientTemp,
        Self::HeatsinkTemp,
        Self::Rail15V,
        Self::OutputVoltage,
        Self::InputCurrent,
        Self::InputVoltage,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::AmbientTemp => "ambient_temp",
            Self::HeatsinkTemp => "heatsink_temp",
            Self::Rail15V => "rail_15v",
            Self::OutputVoltage => "vout",
            Self::InputCurrent => "iin",
            Self::InputVoltage => "vin",
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// One raw ADC reading per channel, taken during a single sample tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFrame {
    raw: [u16; Channel::COUNT],
}

impl SampleFrame {
    pub const fn new(raw: [u16; Channel::COUNT]) -> Self {
        Self { raw }
    }

    #[inline]
    pub const fn get(&self, channel: Channel) -> u16 {
        self.raw[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, value: u16) {
        self.raw[channel.index()] = value;
    }

    #[must_use]
    pub fn with(mut self, channel: Channel, value: u16) -> Self {
        self.set(channel, value);
        self
    }

    /// Iterate `(channel, raw)` pairs in frame order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, u16)> + '_ {
        Channel::ALL.iter().map(|&c| (c, self.get(c)))
    }
}

/// Values the controller offers to the telemetry bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryChannel {
    InputVoltage,
    InputCurrent,
    OutputVoltage,
    HeatsinkTemp,
    Rail15V,
    AmbientTemp,
    Status,
    DutyCycle,
    PandoPower,
    SweepInputVoltage,
    SweepInputCurrent,
    TuneInputVoltage,
    TuneDutyCycle,
}

impl TelemetryChannel {
    pub const fn name(self) -> &'static str {
        match self {
            Self::InputVoltage => "vin",
            Self::InputCurrent => "iin",
            Self::OutputVoltage => "vout",
            Self::HeatsinkTemp => "heatsink_temp",
            Self::Rail15V => "rail_15v",
            Self::AmbientTemp => "ambient_temp",
            Self::Status => "status",
            Self::DutyCycle => "duty",
            Self::PandoPower => "pando_power",
            Self::SweepInputVoltage => "sweep_vin",
            Self::SweepInputCurrent => "sweep_iin",
            Self::TuneInputVoltage => "tune_vin",
            Self::TuneDutyCycle => "tune_duty",
        }
    }
}

/// Delivers one raw sample per monitored channel per sample tick.
pub trait AnalogFrontEnd {
    fn sample(&mut self) -> Result<SampleFrame, BoxError>;
}

/// The switching power stage and its protection logic.
pub trait PowerStage {
    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), BoxError>;
    fn set_enabled(&mut self, enabled: bool) -> Result<(), BoxError>;

    /// The stage holds its fault-status line asserted while it is healthy;
    /// a released line means it has shut itself down.
    fn fault_signal_asserted(&mut self) -> bool;

    /// Clear a latched shutdown before the stage is re-enabled.
    fn reset_fault_latch(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Durable storage for the sealed configuration image.
pub trait ConfigStore {
    /// `Ok(None)` means nothing has ever been written (first run).
    fn load(&mut self) -> Result<Option<Vec<u8>>, BoxError>;
    fn persist(&mut self, image: &[u8]) -> Result<(), BoxError>;
}

/// Outbound side of the telemetry/command bus.
pub trait Telemetry {
    fn send(&mut self, channel: TelemetryChannel, value: i64);
    fn report_error(&mut self, code: u8);

    /// Drive the status indicator (LED or equivalent).
    fn set_indicator(&mut self, _on: bool) {}
}

impl<T: AnalogFrontEnd + ?Sized> AnalogFrontEnd for Box<T> {
    fn sample(&mut self) -> Result<SampleFrame, BoxError> {
        (**self).sample()
    }
}

impl<T: PowerStage + ?Sized> PowerStage for Box<T> {
    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), BoxError> {
        (**self).set_duty_cycle(duty)
    }
    fn set_enabled(&mut self, enabled: bool) -> Result<(), BoxError> {
        (**self).set_enabled(enabled)
    }
    fn fault_signal_asserted(&mut self) -> bool {
        (**self).fault_signal_asserted()
    }
    fn reset_fault_latch(&mut self) -> Result<(), BoxError> {
        (**self).reset_fault_latch()
    }
}

impl<T: ConfigStore + ?Sized> ConfigStore for Box<T> {
    fn load(&mut self) -> Result<Option<Vec<u8>>, BoxError> {
        (**self).load()
    }
    fn persist(&mut self, image: &[u8]) -> Result<(), BoxError> {
        (**self).persist(image)
    }
}

impl<T: Telemetry + ?Sized> Telemetry for Box<T> {
    fn send(&mut self, channel: TelemetryChannel, value: i64) {
        (**self).send(channel, value);
    }
    fn report_error(&mut self, code: u8) {
        (**self).report_error(code);
    }
    fn set_indicator(&mut self, on: bool) {
        (**self).set_indicator(on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_order_matches_channel_index() {
        let frame = SampleFrame::new([10, 11, 12, 13, 14, 15]);
        let collected: Vec<_> = frame.iter().collect();
        assert_eq!(collected[3], (Channel::OutputVoltage, 13));
        assert_eq!(collected[5], (Channel::InputVoltage, 15));
        assert_eq!(frame.with(Channel::InputCurrent, 99).get(Channel::InputCurrent), 99);
    }
}
