//! Real-time scheduling helpers (Linux per-thread SCHED_FIFO; mlockall on unix).

use crate::cli::{RtArgs, RtLock};
use mppt_core::runtime::{PriorityHook, TaskPriority};
use std::sync::Arc;

/// Priority gap between adjacent tasks.
const PRIO_STEP: i32 = 5;

/// Lock memory once and return the hook that places each task thread.
///
/// Returns `None` when real-time mode is off.
pub fn setup(rt: &RtArgs) -> Option<PriorityHook> {
    if !rt.rt {
        return None;
    }
    let lock = rt.rt_lock.unwrap_or_else(RtLock::os_default);
    match lock_memory(lock) {
        Ok(()) => tracing::info!(mode = ?lock, "memory lock applied"),
        Err(err) => tracing::warn!(error = %err, "mlockall failed"),
    }
    Some(priority_hook(rt.rt_prio))
}

#[cfg(unix)]
fn lock_memory(lock: RtLock) -> eyre::Result<()> {
    use libc::{MCL_CURRENT, MCL_FUTURE, mlockall};

    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => MCL_CURRENT,
        RtLock::All => MCL_CURRENT | MCL_FUTURE,
    };
    // SAFETY: mlockall takes no pointers.
    let rc = unsafe { mlockall(flags) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let retryable =
        matches!(err.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::ENOMEM);
    if matches!(lock, RtLock::All) && retryable {
        // SAFETY: as above.
        if unsafe { mlockall(MCL_CURRENT) } == 0 {
            tracing::warn!(error = %err, "mlockall(current|future) failed; locked current pages only");
            return Ok(());
        }
    }
    let mut msg = format!("mlockall failed: {err}");
    if retryable {
        msg.push_str("; hint: needs CAP_IPC_LOCK (or root) and sufficient 'ulimit -l'");
    }
    Err(eyre::eyre!(msg))
}

#[cfg(not(unix))]
fn lock_memory(_lock: RtLock) -> eyre::Result<()> {
    eyre::bail!("memory locking is not supported on this OS")
}

/// Priority for `task` given the control task's priority and the system range.
pub fn fifo_priority(task: TaskPriority, control: i32, min: i32, max: i32) -> i32 {
    let control = control.clamp(min, max);
    let below = match task {
        TaskPriority::Control => 0,
        TaskPriority::Tracking => PRIO_STEP,
        TaskPriority::Main => 2 * PRIO_STEP,
    };
    (control - below).max(min)
}

#[cfg(target_os = "linux")]
fn priority_hook(control_prio: Option<i32>) -> PriorityHook {
    use libc::{SCHED_FIFO, sched_get_priority_max, sched_get_priority_min, sched_param};

    // SAFETY: plain queries without pointers.
    let (min, max) = unsafe {
        let min = sched_get_priority_min(SCHED_FIFO);
        let max = sched_get_priority_max(SCHED_FIFO);
        if min < 0 || max < 0 { (1, 99) } else { (min, max) }
    };
    let control = control_prio.unwrap_or(max);

    Arc::new(move |task: TaskPriority| {
        let prio = fifo_priority(task, control, min, max);
        let param = sched_param {
            sched_priority: prio,
        };
        // pid 0 targets the calling thread on Linux.
        // SAFETY: `param` is a valid sched_param for the duration of the call.
        let rc = unsafe { libc::sched_setscheduler(0, SCHED_FIFO, &param) };
        if rc == 0 {
            tracing::debug!(task = task.name(), prio, "SCHED_FIFO applied");
        } else {
            let err = std::io::Error::last_os_error();
            tracing::warn!(
                task = task.name(),
                prio,
                error = %err,
                "sched_setscheduler(SCHED_FIFO) failed; needs CAP_SYS_NICE or root"
            );
        }
    })
}

#[cfg(not(target_os = "linux"))]
fn priority_hook(_control_prio: Option<i32>) -> PriorityHook {
    Arc::new(|task: TaskPriority| {
        tracing::warn!(task = task.name(), "SCHED_FIFO is unavailable on this OS");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskPriority::Control, 80, 80)]
    #[case(TaskPriority::Tracking, 80, 75)]
    #[case(TaskPriority::Main, 80, 70)]
    #[case(TaskPriority::Main, 4, 1)]
    #[case(TaskPriority::Control, 200, 99)]
    fn priorities_keep_control_on_top(
        #[case] task: TaskPriority,
        #[case] control: i32,
        #[case] expected: i32,
    ) {
        assert_eq!(fifo_priority(task, control, 1, 99), expected);
    }

    #[test]
    fn rt_off_installs_no_hook() {
        let args = RtArgs {
            rt: false,
            rt_prio: None,
            rt_lock: None,
        };
        assert!(setup(&args).is_none());
    }
}
