//! Test and helper mocks for mppt_core

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use mppt_traits::{AnalogFrontEnd, BoxError, PowerStage, SampleFrame, Telemetry, TelemetryChannel};

/// Telemetry sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn send(&mut self, _channel: TelemetryChannel, _value: i64) {}
    fn report_error(&mut self, _code: u8) {}
}

#[derive(Debug, Default)]
struct Recorded {
    values: Vec<(TelemetryChannel, i64)>,
    errors: Vec<u8>,
    indicator: Vec<bool>,
}

/// Telemetry sink that keeps everything; clones share one log.
#[derive(Debug, Default, Clone)]
pub struct RecordingTelemetry {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn values(&self, channel: TelemetryChannel) -> Vec<i64> {
        self.lock()
            .values
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn last(&self, channel: TelemetryChannel) -> Option<i64> {
        self.values(channel).last().copied()
    }

    pub fn errors(&self) -> Vec<u8> {
        self.lock().errors.clone()
    }

    pub fn indicator_toggles(&self) -> usize {
        self.lock().indicator.len()
    }

    pub fn clear(&self) {
        let mut g = self.lock();
        g.values.clear();
        g.errors.clear();
        g.indicator.clear();
    }
}

impl Telemetry for RecordingTelemetry {
    fn send(&mut self, channel: TelemetryChannel, value: i64) {
        self.lock().values.push((channel, value));
    }

    fn report_error(&mut self, code: u8) {
        self.lock().errors.push(code);
    }

    fn set_indicator(&mut self, on: bool) {
        self.lock().indicator.push(on);
    }
}

/// Power stage that records commands and lets a test release the fault line.
#[derive(Debug, Clone)]
pub struct MockPowerStage {
    duties: Vec<u16>,
    enabled: bool,
    fault_line: bool,
    fault_reads: usize,
    latch_resets: usize,
    fail_enable: bool,
}

impl Default for MockPowerStage {
    fn default() -> Self {
        Self {
            duties: Vec::new(),
            enabled: false,
            fault_line: true,
            fault_reads: 0,
            latch_resets: 0,
            fail_enable: false,
        }
    }
}

impl MockPowerStage {
    pub fn last_duty(&self) -> Option<u16> {
        self.duties.last().copied()
    }

    pub fn duties(&self) -> &[u16] {
        &self.duties
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fault_reads(&self) -> usize {
        self.fault_reads
    }

    pub fn latch_resets(&self) -> usize {
        self.latch_resets
    }

    /// Drop the fault line as the gate driver does on an internal shutdown.
    pub fn release_fault_line(&mut self) {
        self.fault_line = false;
    }

    /// Make the next `set_enabled(true)` calls fail.
    pub fn fail_enable(&mut self, fail: bool) {
        self.fail_enable = fail;
    }
}

impl PowerStage for MockPowerStage {
    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), BoxError> {
        self.duties.push(duty);
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), BoxError> {
        if enabled && self.fail_enable {
            return Err("gate driver did not acknowledge enable".into());
        }
        self.enabled = enabled;
        Ok(())
    }

    fn fault_signal_asserted(&mut self) -> bool {
        self.fault_reads += 1;
        self.fault_line
    }

    fn reset_fault_latch(&mut self) -> Result<(), BoxError> {
        self.latch_resets += 1;
        self.fault_line = true;
        Ok(())
    }
}

/// Front end that replays a script of frames; `None` entries fail the read.
/// Once the script is exhausted the last frame repeats.
#[derive(Debug, Default)]
pub struct ScriptedFrontEnd {
    script: VecDeque<Option<SampleFrame>>,
    last: SampleFrame,
}

impl ScriptedFrontEnd {
    pub fn new(frames: impl IntoIterator<Item = SampleFrame>) -> Self {
        Self {
            script: frames.into_iter().map(Some).collect(),
            last: SampleFrame::default(),
        }
    }

    /// A front end that returns `frame` forever.
    pub fn constant(frame: SampleFrame) -> Self {
        Self {
            script: VecDeque::new(),
            last: frame,
        }
    }

    pub fn push(&mut self, frame: SampleFrame) {
        self.script.push_back(Some(frame));
    }

    pub fn push_failure(&mut self) {
        self.script.push_back(None);
    }
}

impl AnalogFrontEnd for ScriptedFrontEnd {
    fn sample(&mut self) -> Result<SampleFrame, BoxError> {
        match self.script.pop_front() {
            Some(Some(frame)) => {
                self.last = frame;
                Ok(frame)
            }
            Some(None) => Err(Box::new(std::io::Error::other("scripted read failure"))),
            None => Ok(self.last),
        }
    }
}
