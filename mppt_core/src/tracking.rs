//! Maximum-power tracking: a tick-driven state machine over interchangeable
//! algorithms.
//!
//! The tracker only ever writes the input-voltage setpoint; the control loop
//! does the rest. Each tick refreshes the Vin/Iin block averages first; a
//! tick with no fresh samples is skipped.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender};
use mppt_config::limits::ABS_MAX_VIN_MV;
use mppt_traits::Channel;

use crate::calibration::Calibration;
use crate::config::ControllerConfig;
use crate::shared::ControlPort;
use crate::util::period_to_ticks;

/// Sweep points kept for telemetry between flushes.
const PENDING_POINTS_CAP: usize = 256;

/// Wire identifiers; 2 is reserved and never decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmTag {
    OpenLoop,
    PerturbAndObserve,
    IvSweep,
    Manual,
}

impl AlgorithmTag {
    pub const fn id(self) -> u8 {
        match self {
            Self::OpenLoop => 0,
            Self::PerturbAndObserve => 1,
            Self::IvSweep => 3,
            Self::Manual => 4,
        }
    }

    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::OpenLoop),
            1 => Some(Self::PerturbAndObserve),
            3 => Some(Self::IvSweep),
            4 => Some(Self::Manual),
            _ => None,
        }
    }
}

impl core::fmt::Display for AlgorithmTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::OpenLoop => "openloop",
            Self::PerturbAndObserve => "pando",
            Self::IvSweep => "ivsweep",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenLoopPhase {
    Sampling,
    Converting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PandoPhase {
    Sampling,
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Settle,
    Sweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PandoState {
    pub direction: i32,
    pub last_power: u64,
    pub phase: PandoPhase,
}

impl PandoState {
    /// Hill-climb decision: reverse when power dropped. Returns the new direction.
    pub fn observe(&mut self, power: u64) -> i32 {
        if power < self.last_power {
            self.direction = -self.direction;
        }
        self.last_power = power;
        self.direction
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepState {
    pub phase: SweepPhase,
    /// Algorithm to return to when the sweep ends.
    pub saved: AlgorithmTag,
    pub last_vin: i32,
    pub last_iin: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmState {
    OpenLoop { phase: OpenLoopPhase },
    PerturbAndObserve(PandoState),
    IvSweep(SweepState),
    Manual,
}

impl AlgorithmState {
    pub const fn tag(&self) -> AlgorithmTag {
        match self {
            Self::OpenLoop { .. } => AlgorithmTag::OpenLoop,
            Self::PerturbAndObserve(_) => AlgorithmTag::PerturbAndObserve,
            Self::IvSweep(_) => AlgorithmTag::IvSweep,
            Self::Manual => AlgorithmTag::Manual,
        }
    }
}

/// One point of an IV curve, in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvPoint {
    pub vin_mv: i32,
    pub iin_ma: i32,
}

/// Points of one IV sweep, delivered as the tracker produces them.
///
/// Iteration blocks until the next point is measured and ends when the sweep
/// finishes or is abandoned.
#[derive(Debug)]
pub struct IvSweep {
    rx: Receiver<IvPoint>,
}

impl IvSweep {
    /// Wait up to `timeout` for the next point.
    pub fn next_timeout(&self, timeout: std::time::Duration) -> SweepPoll {
        match self.rx.recv_timeout(timeout) {
            Ok(p) => SweepPoll::Point(p),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => SweepPoll::Pending,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => SweepPoll::Finished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPoll {
    Point(IvPoint),
    Pending,
    /// The tracker left the sweep; no more points will arrive.
    Finished,
}

impl Iterator for IvSweep {
    type Item = IvPoint;

    fn next(&mut self) -> Option<IvPoint> {
        self.rx.recv().ok()
    }
}

/// Algorithm parameters taken from the persisted configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingParams {
    pub openloop_ratio: i32,
    pub retrack_period: u32,
    pub perturb_step: i32,
    pub sweep_sample_period: u32,
    pub sweep_step_mv: i32,
    pub min_input_voltage: i32,
}

impl From<&ControllerConfig> for TrackingParams {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            openloop_ratio: i32::from(cfg.openloop_ratio),
            retrack_period: u32::from(cfg.openloop_retrack_period),
            perturb_step: i32::from(cfg.perturb_step),
            sweep_sample_period: u32::from(cfg.ivsweep_sample_period),
            sweep_step_mv: i32::from(cfg.ivsweep_step_size),
            min_input_voltage: cfg.min_input_voltage,
        }
    }
}

/// Fixed waits expressed in tracking ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingTiming {
    pub openloop_sample: u32,
    pub pando_sample: u32,
    pub pando_update: u32,
    pub sweep_settle: u32,
}

impl TrackingTiming {
    pub fn at(track_hz: u32) -> Self {
        Self {
            openloop_sample: 0,
            pando_sample: period_to_ticks(100, track_hz),
            pando_update: 2,
            sweep_settle: period_to_ticks(1000, track_hz),
        }
    }
}

#[derive(Debug)]
pub struct Tracker {
    params: TrackingParams,
    timing: TrackingTiming,
    calibration: Calibration,
    state: AlgorithmState,
    counter: u32,
    vin_raw: i32,
    iin_raw: i32,
    sweep_tx: Option<Sender<IvPoint>>,
    pending: VecDeque<IvPoint>,
}

impl Tracker {
    /// A tracker parked in open loop; call `switch_to` to start an algorithm.
    pub fn new(cfg: &ControllerConfig, calibration: Calibration, track_hz: u32) -> Self {
        Self {
            params: TrackingParams::from(cfg),
            timing: TrackingTiming::at(track_hz),
            calibration,
            state: AlgorithmState::OpenLoop {
                phase: OpenLoopPhase::Sampling,
            },
            counter: 0,
            vin_raw: 0,
            iin_raw: 0,
            sweep_tx: None,
            pending: VecDeque::new(),
        }
    }

    pub fn algorithm(&self) -> AlgorithmTag {
        self.state.tag()
    }

    pub fn state(&self) -> &AlgorithmState {
        &self.state
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn vin_raw(&self) -> i32 {
        self.vin_raw
    }

    pub fn iin_raw(&self) -> i32 {
        self.iin_raw
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// P&O's most recent power figure, if that algorithm is running.
    pub fn last_power(&self) -> Option<u64> {
        match self.state {
            AlgorithmState::PerturbAndObserve(p) => Some(p.last_power),
            _ => None,
        }
    }

    /// Hand over sweep points queued since the last call.
    pub fn take_points(&mut self) -> Vec<IvPoint> {
        self.pending.drain(..).collect()
    }

    pub fn reconfigure(&mut self, cfg: &ControllerConfig) {
        self.params = TrackingParams::from(cfg);
    }

    /// Leave the current algorithm and start `tag` from its initial state.
    ///
    /// Selecting `IvSweep` while a sweep is running does nothing.
    pub fn switch_to<C: ControlPort + ?Sized>(&mut self, tag: AlgorithmTag, port: &C) {
        let current = self.state.tag();
        if tag == AlgorithmTag::IvSweep && current == AlgorithmTag::IvSweep {
            return;
        }
        // Ends any open `IvSweep` iterator.
        self.sweep_tx = None;
        self.counter = 0;
        self.state = match tag {
            AlgorithmTag::OpenLoop => AlgorithmState::OpenLoop {
                phase: OpenLoopPhase::Sampling,
            },
            AlgorithmTag::PerturbAndObserve => AlgorithmState::PerturbAndObserve(PandoState {
                direction: self.params.perturb_step,
                last_power: 0,
                phase: PandoPhase::Sampling,
            }),
            AlgorithmTag::IvSweep => AlgorithmState::IvSweep(SweepState {
                phase: SweepPhase::Settle,
                saved: current,
                last_vin: 0,
                last_iin: 0,
            }),
            AlgorithmTag::Manual => AlgorithmState::Manual,
        };
        self.set_voltage(port, ABS_MAX_VIN_MV);
        tracing::info!(from = %current, to = %tag, "tracking algorithm selected");
    }

    /// Start an IV sweep and return its point stream, or `None` when one is
    /// already running.
    pub fn start_iv_sweep<C: ControlPort + ?Sized>(&mut self, port: &C) -> Option<IvSweep> {
        if self.state.tag() == AlgorithmTag::IvSweep {
            return None;
        }
        self.switch_to(AlgorithmTag::IvSweep, port);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.sweep_tx = Some(tx);
        Some(IvSweep { rx })
    }

    /// Write a setpoint in millivolts, never below the configured input floor.
    pub fn set_voltage<C: ControlPort + ?Sized>(&self, port: &C, millivolts: i32) -> i32 {
        let mv = millivolts.max(self.params.min_input_voltage);
        port.set_target_raw(self.calibration.to_raw(Channel::InputVoltage, mv))
    }

    /// One tracking tick.
    pub fn tick<C: ControlPort + ?Sized>(&mut self, port: &C) {
        let Some((vin, iin)) = port.refresh_averages() else {
            tracing::trace!("no fresh samples; tracking tick skipped");
            return;
        };
        self.vin_raw = vin;
        self.iin_raw = iin;

        match self.state {
            AlgorithmState::OpenLoop { phase } => self.tick_openloop(phase, port),
            AlgorithmState::PerturbAndObserve(p) => self.tick_pando(p, port),
            AlgorithmState::IvSweep(s) => self.tick_sweep(s, port),
            AlgorithmState::Manual => {}
        }
    }

    /// Compare-then-increment, so a wait of `n` fires on the `n + 1`th tick.
    fn bump(&mut self) -> u32 {
        let c = self.counter;
        self.counter = self.counter.saturating_add(1);
        c
    }

    fn vin_mv(&self) -> i32 {
        self.calibration.to_milli(Channel::InputVoltage, self.vin_raw)
    }

    fn openloop_target_mv(&self) -> i32 {
        let mv = i64::from(self.params.openloop_ratio) * i64::from(self.vin_mv()) / 1000;
        i32::try_from(mv).unwrap_or(i32::MAX)
    }

    fn tick_openloop<C: ControlPort + ?Sized>(&mut self, phase: OpenLoopPhase, port: &C) {
        match phase {
            OpenLoopPhase::Sampling => {
                if self.bump() >= self.timing.openloop_sample {
                    self.set_voltage(port, self.openloop_target_mv());
                    self.state = AlgorithmState::OpenLoop {
                        phase: OpenLoopPhase::Converting,
                    };
                    self.counter = 0;
                }
            }
            OpenLoopPhase::Converting => {
                if self.bump() > self.params.retrack_period {
                    self.set_voltage(port, ABS_MAX_VIN_MV);
                    self.state = AlgorithmState::OpenLoop {
                        phase: OpenLoopPhase::Sampling,
                    };
                    self.counter = 0;
                }
            }
        }
    }

    fn tick_pando<C: ControlPort + ?Sized>(&mut self, mut p: PandoState, port: &C) {
        match p.phase {
            PandoPhase::Sampling => {
                if self.bump() >= self.timing.pando_sample {
                    self.set_voltage(port, self.openloop_target_mv());
                    p.phase = PandoPhase::Tracking;
                    self.counter = 0;
                }
            }
            PandoPhase::Tracking => {
                if self.bump() >= self.timing.pando_update {
                    // Raw averages are non-negative 12-bit values.
                    let power = u64::try_from(self.vin_raw).unwrap_or(0)
                        * u64::try_from(self.iin_raw).unwrap_or(0);
                    let direction = p.observe(power);
                    port.set_target_raw(self.vin_raw.saturating_add(direction));
                    self.counter = 0;
                }
            }
        }
        self.state = AlgorithmState::PerturbAndObserve(p);
    }

    fn tick_sweep<C: ControlPort + ?Sized>(&mut self, mut s: SweepState, port: &C) {
        match s.phase {
            SweepPhase::Settle => {
                if self.counter > self.timing.sweep_settle {
                    s.phase = SweepPhase::Sweep;
                    self.counter = 0;
                } else {
                    self.counter += 1;
                }
            }
            SweepPhase::Sweep => {
                if self.bump() >= self.params.sweep_sample_period {
                    let point = IvPoint {
                        vin_mv: self.vin_mv(),
                        iin_ma: self.calibration.to_milli(Channel::InputCurrent, self.iin_raw),
                    };
                    s.last_vin = point.vin_mv;
                    s.last_iin = point.iin_ma;
                    self.publish(point);
                    self.counter = 0;

                    let next = point.vin_mv.saturating_sub(self.params.sweep_step_mv);
                    if next < self.params.min_input_voltage || port.saturated() {
                        tracing::info!(
                            last_vin_mv = point.vin_mv,
                            saturated = port.saturated(),
                            "iv sweep finished"
                        );
                        // The restarted algorithm begins from the last
                        // stepped setpoint, clamped to the floor.
                        self.switch_to(s.saved, port);
                        self.set_voltage(port, next);
                        return;
                    }
                    self.set_voltage(port, next);
                }
            }
        }
        self.state = AlgorithmState::IvSweep(s);
    }

    fn publish(&mut self, point: IvPoint) {
        if let Some(tx) = &self.sweep_tx {
            // A dropped receiver only means nobody is listening any more.
            if tx.send(point).is_err() {
                self.sweep_tx = None;
            }
        }
        if self.pending.len() == PENDING_POINTS_CAP {
            self.pending.pop_front();
        }
        self.pending.push_back(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Control side stand-in with a settable average and saturation flag.
    #[derive(Default)]
    struct FakePort {
        avg: Cell<Option<(i32, i32)>>,
        target: Cell<i32>,
        writes: Cell<u32>,
        saturated: Cell<bool>,
    }

    impl FakePort {
        fn feeding(vin: i32, iin: i32) -> Self {
            let p = Self::default();
            p.avg.set(Some((vin, iin)));
            p
        }
    }

    impl ControlPort for FakePort {
        fn refresh_averages(&self) -> Option<(i32, i32)> {
            self.avg.get()
        }
        fn set_target_raw(&self, raw: i32) -> i32 {
            self.target.set(raw);
            self.writes.set(self.writes.get() + 1);
            raw
        }
        fn target_raw(&self) -> i32 {
            self.target.get()
        }
        fn saturated(&self) -> bool {
            self.saturated.get()
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(&ControllerConfig::default(), Calibration::default(), 32)
    }

    fn raw(mv: i32) -> i32 {
        Calibration::default().to_raw(Channel::InputVoltage, mv)
    }

    #[test]
    fn algorithm_ids_skip_reserved() {
        assert_eq!(AlgorithmTag::from_id(2), None);
        for tag in [
            AlgorithmTag::OpenLoop,
            AlgorithmTag::PerturbAndObserve,
            AlgorithmTag::IvSweep,
            AlgorithmTag::Manual,
        ] {
            assert_eq!(AlgorithmTag::from_id(tag.id()), Some(tag));
        }
    }

    #[test]
    fn switch_targets_the_ceiling() {
        let port = FakePort::default();
        let mut t = tracker();
        t.switch_to(AlgorithmTag::Manual, &port);
        assert_eq!(port.target_raw(), raw(ABS_MAX_VIN_MV));
        assert_eq!(t.algorithm(), AlgorithmTag::Manual);
    }

    #[test]
    fn stale_averages_skip_the_tick() {
        let port = FakePort::default();
        let mut t = tracker();
        t.switch_to(AlgorithmTag::OpenLoop, &port);
        t.tick(&port);
        assert_eq!(t.counter(), 0);
        assert_eq!(port.writes.get(), 1);
    }

    #[test]
    fn openloop_samples_then_retracks() {
        let port = FakePort::feeding(2500, 100);
        let mut t = tracker();
        t.switch_to(AlgorithmTag::OpenLoop, &port);

        t.tick(&port);
        let vin_mv = Calibration::default().to_milli(Channel::InputVoltage, 2500);
        assert_eq!(port.target_raw(), raw(800 * vin_mv / 1000));
        assert!(matches!(
            t.state(),
            AlgorithmState::OpenLoop {
                phase: OpenLoopPhase::Converting
            }
        ));

        // counter++ > 320 fires on the 322nd converting tick
        for _ in 0..321 {
            t.tick(&port);
        }
        assert_ne!(port.target_raw(), raw(ABS_MAX_VIN_MV));
        t.tick(&port);
        assert_eq!(port.target_raw(), raw(ABS_MAX_VIN_MV));
    }

    #[test]
    fn pando_reverses_when_power_drops() {
        let port = FakePort::feeding(2500, 200);
        let mut t = tracker();
        t.switch_to(AlgorithmTag::PerturbAndObserve, &port);

        // three sampling ticks wait, the fourth applies the open-loop target
        for _ in 0..4 {
            t.tick(&port);
        }
        let AlgorithmState::PerturbAndObserve(p) = *t.state() else {
            panic!("not in P&O");
        };
        assert_eq!(p.phase, PandoPhase::Tracking);

        for _ in 0..3 {
            t.tick(&port);
        }
        assert_eq!(port.target_raw(), 2500 + 12);
        assert_eq!(t.last_power(), Some(2500 * 200));

        port.avg.set(Some((2512, 150)));
        for _ in 0..3 {
            t.tick(&port);
        }
        assert_eq!(port.target_raw(), 2512 - 12);
    }

    #[test]
    fn pando_observe_keeps_direction_on_gain() {
        let mut p = PandoState {
            direction: 12,
            last_power: 100,
            phase: PandoPhase::Tracking,
        };
        assert_eq!(p.observe(100), 12);
        assert_eq!(p.observe(99), -12);
        assert_eq!(p.observe(120), -12);
    }

    #[test]
    fn sweep_walks_down_and_returns_to_saved_algorithm() {
        let port = FakePort::feeding(raw(40_000), 500);
        let mut t = tracker();
        t.switch_to(AlgorithmTag::PerturbAndObserve, &port);
        let sweep = t.start_iv_sweep(&port).unwrap();
        assert!(t.start_iv_sweep(&port).is_none());

        // settle: counter climbs to 33 and flips on the next tick
        for _ in 0..34 {
            t.tick(&port);
        }
        let AlgorithmState::IvSweep(s) = *t.state() else {
            panic!("not sweeping");
        };
        assert_eq!(s.phase, SweepPhase::Sweep);
        assert_eq!(s.saved, AlgorithmTag::PerturbAndObserve);

        while t.algorithm() == AlgorithmTag::IvSweep {
            t.tick(&port);
            // the panel follows the setpoint exactly
            port.avg.set(Some((port.target_raw(), 500)));
        }
        assert_eq!(t.algorithm(), AlgorithmTag::PerturbAndObserve);

        let points: Vec<IvPoint> = sweep.collect();
        assert!(points.len() > 10, "{}", points.len());
        assert!(points.windows(2).all(|w| w[1].vin_mv < w[0].vin_mv));
        assert!(points.last().unwrap().vin_mv - 300 < 30_000);
        assert_eq!(t.take_points().len(), points.len());
    }

    #[test]
    fn sweep_ends_early_when_control_saturates() {
        let port = FakePort::feeding(raw(80_000), 500);
        let mut t = tracker();
        t.switch_to(AlgorithmTag::Manual, &port);
        let sweep = t.start_iv_sweep(&port).unwrap();
        for _ in 0..35 {
            t.tick(&port);
        }
        port.saturated.set(true);
        t.tick(&port);
        assert_eq!(t.algorithm(), AlgorithmTag::Manual);
        // one step below the last point, not back at the ceiling
        assert!(port.target_raw() < raw(80_000));
        assert_ne!(port.target_raw(), raw(ABS_MAX_VIN_MV));
        assert_eq!(sweep.count(), 2);
    }

    #[test]
    fn sweep_end_leaves_stepped_setpoint_clamped_to_floor() {
        let port = FakePort::feeding(raw(30_200), 500);
        let mut t = tracker();
        t.switch_to(AlgorithmTag::Manual, &port);
        let _sweep = t.start_iv_sweep(&port).unwrap();
        for _ in 0..34 {
            t.tick(&port);
        }
        assert_eq!(t.algorithm(), AlgorithmTag::IvSweep);

        // the first point already steps below the 30 V floor
        t.tick(&port);
        assert_eq!(t.algorithm(), AlgorithmTag::Manual);
        assert_eq!(port.target_raw(), raw(30_000));
    }

    #[test]
    fn sweep_poll_reports_pending_then_finished() {
        let port = FakePort::feeding(raw(80_000), 500);
        let mut t = tracker();
        let sweep = t.start_iv_sweep(&port).unwrap();
        let wait = std::time::Duration::from_millis(1);
        assert_eq!(sweep.next_timeout(wait), SweepPoll::Pending);
        t.switch_to(AlgorithmTag::Manual, &port);
        assert_eq!(sweep.next_timeout(wait), SweepPoll::Finished);
    }

    #[test]
    fn set_voltage_clamps_to_floor() {
        let port = FakePort::default();
        let t = tracker();
        t.set_voltage(&port, 5_000);
        assert_eq!(port.target_raw(), raw(30_000));
    }
}
