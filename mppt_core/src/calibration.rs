//! Linear raw-count ↔ milli-unit conversions, one pair per channel.
//!
//! Kept apart from control and tracking: those work in raw counts and only
//! cross into physical units at the edges (tracker targets, telemetry, start
//! conditions).

use mppt_traits::Channel;

/// `milli = (raw * m + b) / 1000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    pub m: i32,
    pub b: i32,
}

impl Linear {
    pub const fn new(m: i32, b: i32) -> Self {
        Self { m, b }
    }

    #[inline]
    pub fn to_milli(self, raw: i32) -> i32 {
        let v = (i64::from(raw) * i64::from(self.m) + i64::from(self.b)) / 1000;
        saturate(v)
    }

    /// Inverse conversion; a zero gain maps everything to 0.
    #[inline]
    pub fn to_raw(self, milli: i32) -> i32 {
        if self.m == 0 {
            return 0;
        }
        let v = (i64::from(milli) * 1000 - i64::from(self.b)) / i64::from(self.m);
        saturate(v)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn saturate(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    channels: [Linear; Channel::COUNT],
}

impl Default for Calibration {
    /// Board defaults, in frame order.
    fn default() -> Self {
        Self {
            channels: [
                Linear::new(1024, 0),
                Linear::new(425_354, -45_371_077),
                Linear::new(5208, -526_772),
                Linear::new(43376, -1_401_352),
                Linear::new(2580, -8000),
                Linear::new(40522, -370_615),
            ],
        }
    }
}

impl Calibration {
    #[inline]
    pub fn get(&self, channel: Channel) -> Linear {
        self.channels[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, linear: Linear) {
        self.channels[channel.index()] = linear;
    }

    #[inline]
    pub fn to_milli(&self, channel: Channel, raw: i32) -> i32 {
        self.get(channel).to_milli(raw)
    }

    #[inline]
    pub fn to_raw(&self, channel: Channel, milli: i32) -> i32 {
        self.get(channel).to_raw(milli)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, Linear)> + '_ {
        Channel::ALL.iter().map(|&c| (c, self.get(c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_vin_round_trips_within_one_count() {
        let cal = Calibration::default();
        let raw = cal.to_raw(Channel::InputVoltage, 30_000);
        assert_eq!(raw, 749);
        let back = cal.to_milli(Channel::InputVoltage, raw);
        assert!((back - 30_000).abs() <= 41, "{back}");
    }

    #[test]
    fn zero_gain_does_not_divide() {
        assert_eq!(Linear::new(0, 5).to_raw(12_345), 0);
    }
}
