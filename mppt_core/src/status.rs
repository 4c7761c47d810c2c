//! Tracker status word and per-tick control output.

/// Which PID instance is the binding constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveLoop {
    #[default]
    Input,
    Output,
}

impl core::fmt::Display for ActiveLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Process-wide status bits, reported verbatim on the telemetry bus.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TrackerStatus(u8);

impl TrackerStatus {
    pub const TRACKING_ENABLED: Self = Self(1 << 0);
    pub const INPUT_LOOP_ACTIVE: Self = Self(1 << 1);
    pub const OUTPUT_LOOP_ACTIVE: Self = Self(1 << 2);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn tracking_enabled(self) -> bool {
        self.contains(Self::TRACKING_ENABLED)
    }

    pub fn set_tracking(&mut self, enabled: bool) {
        if enabled {
            self.insert(Self::TRACKING_ENABLED);
        } else {
            self.remove(Self::TRACKING_ENABLED);
        }
    }

    /// Set exactly one of the two loop bits.
    pub fn set_active_loop(&mut self, active: ActiveLoop) {
        let (on, off) = match active {
            ActiveLoop::Input => (Self::INPUT_LOOP_ACTIVE, Self::OUTPUT_LOOP_ACTIVE),
            ActiveLoop::Output => (Self::OUTPUT_LOOP_ACTIVE, Self::INPUT_LOOP_ACTIVE),
        };
        self.remove(off);
        self.insert(on);
    }

    pub const fn active_loop(self) -> Option<ActiveLoop> {
        if self.contains(Self::OUTPUT_LOOP_ACTIVE) {
            Some(ActiveLoop::Output)
        } else if self.contains(Self::INPUT_LOOP_ACTIVE) {
            Some(ActiveLoop::Input)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for TrackerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut set = f.debug_set();
        if self.tracking_enabled() {
            set.entry(&"TRACKING_ENABLED");
        }
        if self.contains(Self::INPUT_LOOP_ACTIVE) {
            set.entry(&"INPUT_LOOP_ACTIVE");
        }
        if self.contains(Self::OUTPUT_LOOP_ACTIVE) {
            set.entry(&"OUTPUT_LOOP_ACTIVE");
        }
        set.finish()
    }
}

/// Result of the most recent regulating tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlOutput {
    pub duty: u16,
    pub active_loop: ActiveLoop,
    /// The input loop is pinned at the top of its range.
    pub saturated: bool,
}
