//! Per-channel smoothing and block averaging.
//!
//! Every raw sample feeds two consumers: a single-pole filter that halves the
//! error each tick (read by the supervisor for start conditions and
//! telemetry) and a sum/count accumulator that the tracker drains once per
//! tracking tick. The aggregator itself is plain data; it lives inside
//! `SharedControlState`, whose lock is what makes the reads atomic with
//! respect to the sampling task.

use mppt_traits::{Channel, SampleFrame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSample {
    pub filtered: i32,
    pub accum_sum: u32,
    pub accum_count: u32,
}

impl ChannelSample {
    #[inline]
    fn push(&mut self, raw: u16) {
        self.filtered = (self.filtered + i32::from(raw)) / 2;
        self.accum_sum = self.accum_sum.saturating_add(u32::from(raw));
        self.accum_count = self.accum_count.saturating_add(1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleAggregator {
    channels: [ChannelSample; Channel::COUNT],
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one raw reading into the channel's filter and accumulator.
    #[inline]
    pub fn on_raw_sample(&mut self, channel: Channel, raw: u16) {
        self.channels[channel.index()].push(raw);
    }

    pub fn on_frame(&mut self, frame: &SampleFrame) {
        for (channel, raw) in frame.iter() {
            self.on_raw_sample(channel, raw);
        }
    }

    #[inline]
    pub fn read_filtered(&self, channel: Channel) -> i32 {
        self.channels[channel.index()].filtered
    }

    /// Return `(sum, count)` and reset both.
    pub fn read_and_zero(&mut self, channel: Channel) -> (u32, u32) {
        let ch = &mut self.channels[channel.index()];
        let out = (ch.accum_sum, ch.accum_count);
        ch.accum_sum = 0;
        ch.accum_count = 0;
        out
    }

    /// Drain the accumulator and return its mean.
    ///
    /// `None` means no sample arrived since the last drain; treat it as stale
    /// and retry on a later tick.
    pub fn read_average(&mut self, channel: Channel) -> Option<i32> {
        let (sum, count) = self.read_and_zero(channel);
        if count == 0 {
            return None;
        }
        i32::try_from(sum / count).ok()
    }

    pub fn snapshot(&self, channel: Channel) -> ChannelSample {
        self.channels[channel.index()]
    }
}
