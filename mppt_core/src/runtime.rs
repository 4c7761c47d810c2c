//! Threaded execution: a high-rate control task, a medium-rate tracking task
//! and the supervisor loop on the calling thread.
//!
//! Priority contract: `Control` must preempt `Tracking`, which must preempt
//! `Main`. The runtime does not set priorities itself; it calls the supplied
//! `PriorityHook` at the top of each thread so the host can (e.g. SCHED_FIFO).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mppt_traits::{AnalogFrontEnd, Clock, Pacer, PowerStage};

use crate::builder::Controller;
use crate::control::sample_and_tick;
use crate::error::{FaultKind, MpptError, Result};
use crate::status::{ControlOutput, TrackerStatus};
use crate::supervisor::lock_tracker;
use crate::util::{CONTROL_HZ, TELEMETRY_PERIOD_MS, TRACK_HZ, period_us};

/// Supervisor loop cadence.
pub const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rates {
    pub control_hz: u32,
    pub track_hz: u32,
    pub telemetry_ms: u64,
}

impl Default for Rates {
    fn default() -> Self {
        Self {
            control_hz: CONTROL_HZ,
            track_hz: TRACK_HZ,
            telemetry_ms: TELEMETRY_PERIOD_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    Main,
    Tracking,
    Control,
}

impl TaskPriority {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Tracking => "tracking",
            Self::Control => "control",
        }
    }
}

/// Called once on each task's own thread before it starts working.
pub type PriorityHook = Arc<dyn Fn(TaskPriority) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub control_ticks: u64,
    pub control_overruns: u64,
    pub track_ticks: u64,
    pub polls: u64,
    pub faults: Vec<FaultKind>,
    /// Control output and status just before the stage was disabled.
    pub last_output: ControlOutput,
    pub last_status: TrackerStatus,
}

/// Run `controller` until `shutdown` is raised.
///
/// Both worker threads are joined before returning and the power stage is
/// left disabled.
pub fn run<F, P>(
    controller: &mut Controller<F, P>,
    shutdown: &AtomicBool,
    hook: Option<PriorityHook>,
) -> Result<RunReport>
where
    F: AnalogFrontEnd + Send,
    P: PowerStage + Send,
{
    let rates = controller.rates;
    let clock = Arc::clone(&controller.clock);
    let epoch = controller.epoch;
    let shared = &controller.shared;
    let tracker = &controller.tracker;
    let front_end = &mut controller.front_end;
    let supervisor = &mut controller.supervisor;

    tracing::info!(
        control_hz = rates.control_hz,
        track_hz = rates.track_hz,
        "runtime starting"
    );

    let outcome = std::thread::scope(|scope| -> Result<RunReport> {
        let control = {
            let hook = hook.clone();
            let clock = Arc::clone(&clock);
            std::thread::Builder::new()
                .name("mppt-control".into())
                .spawn_scoped(scope, move || {
                    if let Some(h) = &hook {
                        h(TaskPriority::Control);
                    }
                    tracing::trace!("control task started");
                    let mut pacer = Pacer::new(Duration::from_micros(period_us(rates.control_hz)));
                    let mut ticks = 0u64;
                    while !shutdown.load(Ordering::Acquire) {
                        sample_and_tick(front_end, shared);
                        ticks += 1;
                        pacer.wait(clock.as_ref());
                    }
                    tracing::trace!(ticks, "control task stopped");
                    (ticks, pacer.overruns())
                })
        };
        let control = match control {
            Ok(h) => h,
            Err(e) => {
                shutdown.store(true, Ordering::Release);
                return Err(eyre::Report::new(MpptError::Io(e.to_string())));
            }
        };

        let tracking = {
            let hook = hook.clone();
            let clock = Arc::clone(&clock);
            std::thread::Builder::new()
                .name("mppt-tracking".into())
                .spawn_scoped(scope, move || {
                    if let Some(h) = &hook {
                        h(TaskPriority::Tracking);
                    }
                    tracing::trace!("tracking task started");
                    let mut pacer = Pacer::new(Duration::from_micros(period_us(rates.track_hz)));
                    let mut ticks = 0u64;
                    while !shutdown.load(Ordering::Acquire) {
                        lock_tracker(tracker).tick(shared);
                        ticks += 1;
                        pacer.wait(clock.as_ref());
                    }
                    tracing::trace!(ticks, "tracking task stopped");
                    ticks
                })
        };
        let tracking = match tracking {
            Ok(h) => h,
            Err(e) => {
                shutdown.store(true, Ordering::Release);
                let _ = control.join();
                return Err(eyre::Report::new(MpptError::Io(e.to_string())));
            }
        };

        if let Some(h) = &hook {
            h(TaskPriority::Main);
        }
        let mut polls = 0u64;
        while !shutdown.load(Ordering::Acquire) {
            let now = clock.ms_since(epoch);
            if let Err(e) = supervisor.poll(now, shared, tracker) {
                tracing::warn!(error = %e, "supervisor poll reported an error");
            }
            polls += 1;
            clock.sleep(MAIN_LOOP_PERIOD);
        }

        let (control_ticks, control_overruns) = control
            .join()
            .map_err(|_| eyre::Report::new(MpptError::State("control task panicked".into())))?;
        let track_ticks = tracking
            .join()
            .map_err(|_| eyre::Report::new(MpptError::State("tracking task panicked".into())))?;

        let (last_output, last_status) = shared.critical(|s| (s.output(), s.status()));
        Ok(RunReport {
            control_ticks,
            control_overruns,
            track_ticks,
            polls,
            faults: supervisor.faults().to_vec(),
            last_output,
            last_status,
        })
    });

    controller.shared.critical(|s| s.disable_tracking());
    match &outcome {
        Ok(r) => tracing::info!(
            control_ticks = r.control_ticks,
            track_ticks = r.track_ticks,
            overruns = r.control_overruns,
            "runtime stopped"
        ),
        Err(e) => tracing::error!(error = %e, "runtime stopped with error"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(TaskPriority::Control > TaskPriority::Tracking);
        assert!(TaskPriority::Tracking > TaskPriority::Main);
    }

    #[test]
    fn default_rates() {
        let r = Rates::default();
        assert_eq!((r.control_hz, r.track_hz, r.telemetry_ms), (1160, 32, 800));
    }
}
