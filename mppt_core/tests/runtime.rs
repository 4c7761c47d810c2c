use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mppt_core::runtime::{PriorityHook, TaskPriority, run};
use mppt_core::{Calibration, Controller, MemoryStore};
use mppt_hardware::{ChannelScale, PlantParams, PvPlant};
use mppt_traits::Channel;

fn scales(cal: &Calibration) -> [ChannelScale; Channel::COUNT] {
    Channel::ALL.map(|c| {
        let l = cal.get(c);
        ChannelScale { m: l.m, b: l.b }
    })
}

#[test]
fn threads_start_run_and_join_on_shutdown() {
    let plant = PvPlant::new(PlantParams::default());
    let mut ctl = Controller::builder()
        .with_front_end(plant.front_end(scales(&Calibration::default())))
        .with_power_stage(plant.power_stage())
        .with_store(MemoryStore::new())
        .build()
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook: PriorityHook = {
        let seen = Arc::clone(&seen);
        Arc::new(move |p: TaskPriority| seen.lock().unwrap().push(p))
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let stopper = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(400));
            shutdown.store(true, Ordering::Release);
        })
    };

    let report = run(&mut ctl, &shutdown, Some(hook)).unwrap();
    stopper.join().unwrap();

    assert!(report.control_ticks > 100, "{report:?}");
    assert!(report.track_ticks >= 5, "{report:?}");
    assert!(report.polls > 10, "{report:?}");
    assert!(report.last_status.tracking_enabled(), "{report:?}");
    assert!(!plant.is_enabled());
    assert!(!ctl.status().tracking_enabled());

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![TaskPriority::Main, TaskPriority::Tracking, TaskPriority::Control]
    );
}

#[test]
fn already_raised_shutdown_returns_promptly() {
    let plant = PvPlant::new(PlantParams::default());
    let mut ctl = Controller::builder()
        .with_front_end(plant.front_end(scales(&Calibration::default())))
        .with_power_stage(plant.power_stage())
        .with_store(MemoryStore::new())
        .build()
        .unwrap();
    let shutdown = AtomicBool::new(true);
    let report = run(&mut ctl, &shutdown, None).unwrap();
    assert_eq!(report.control_ticks, 0);
    assert_eq!(report.polls, 0);
}
