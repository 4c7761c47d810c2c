//! Telemetry sink for the CLI: every value becomes a structured log event.

use mppt_core::FaultKind;
use mppt_traits::{Telemetry, TelemetryChannel};

#[derive(Debug, Default)]
pub struct LogTelemetry {
    indicator: bool,
}

impl Telemetry for LogTelemetry {
    fn send(&mut self, channel: TelemetryChannel, value: i64) {
        tracing::debug!(target: "mppt::telemetry", channel = channel.name(), value);
    }

    fn report_error(&mut self, code: u8) {
        match FaultKind::from_code(code) {
            Some(kind) => tracing::warn!(target: "mppt::telemetry", code, kind = %kind, "fault reported"),
            None => tracing::warn!(target: "mppt::telemetry", code, "unknown fault code reported"),
        }
    }

    fn set_indicator(&mut self, on: bool) {
        if on != self.indicator {
            self.indicator = on;
            tracing::trace!(target: "mppt::telemetry", on, "indicator");
        }
    }
}
