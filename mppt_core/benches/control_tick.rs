use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mppt_core::fixed_point::{MAX_STEP_UP, OUT_MAX, OUT_MIN};
use mppt_core::mocks::MockPowerStage;
use mppt_core::pid::{self, PidConstants, PidLimits, PidState};
use mppt_core::shared::ControlShared;
use mppt_core::{Calibration, ControllerConfig};
use mppt_traits::{Channel, SampleFrame};

fn bench_pid_step(c: &mut Criterion) {
    let limits = PidLimits {
        out_min: OUT_MIN,
        out_max: OUT_MAX,
        max_step_up: MAX_STEP_UP,
    };
    let k = PidConstants::new(7000, 400, 0);
    let mut st = PidState::default();
    let mut e = 0i64;
    c.bench_function("pid_step", |b| {
        b.iter(|| {
            e = (e + 37) % 400 - 200;
            black_box(pid::step(black_box(e), &mut st, k, limits))
        });
    });
}

fn bench_control_tick(c: &mut Criterion) {
    let mut s = ControlShared::new(
        MockPowerStage::default(),
        &ControllerConfig::default(),
        &Calibration::default(),
    );
    s.set_target(2500);
    s.start_tracking().unwrap();
    let frames: Vec<SampleFrame> = (0..64u16)
        .map(|i| {
            SampleFrame::default()
                .with(Channel::OutputVoltage, 2600 + i)
                .with(Channel::InputVoltage, 2480 + i)
                .with(Channel::InputCurrent, 220)
        })
        .collect();
    let mut i = 0usize;
    c.bench_function("control_tick", |b| {
        b.iter(|| {
            i = (i + 1) % frames.len();
            black_box(s.tick(black_box(&frames[i])))
        });
    });
}

criterion_group!(benches, bench_pid_step, bench_control_tick);
criterion_main!(benches);
