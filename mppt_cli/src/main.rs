mod cli;
mod error_fmt;
mod rt;
mod run;
mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use mppt_core::{ControllerConfig, IvPoint, ParamId};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::cli::{Cli, Commands, ConfigAction, FILE_GUARD, JSON_MODE, json_mode};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::run::{RunSummary, Setup, StoreState};

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    // Load the config before logging so the [logging] section can add a file layer.
    let loaded = load_config(&cli.config);
    init_tracing(&cli, loaded.as_ref().ok());

    let result = loaded.and_then(|cfg| {
        let csv = cli
            .calibration
            .as_deref()
            .map(mppt_config::load_calibration_csv)
            .transpose()?;
        let setup = Setup::new(cfg, csv.as_ref());
        dispatch(&cli, &setup)
    });

    if let Err(err) = result {
        tracing::error!(error = %err, "command failed");
        if json_mode() {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn load_config(path: &Path) -> eyre::Result<mppt_config::Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
    let cfg = mppt_config::load_toml(&text)
        .wrap_err_with(|| format!("failed to parse config {}", path.display()))?;
    cfg.validate()
        .wrap_err_with(|| format!("failed to parse config {}: invalid values", path.display()))?;
    Ok(cfg)
}

fn init_tracing(cli: &Cli, cfg: Option<&mppt_config::Config>) {
    let level = cfg
        .and_then(|c| c.logging.level.clone())
        .unwrap_or_else(|| cli.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = if cli.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file = cfg.and_then(|c| c.logging.file.as_deref()).map(|file| {
        let path = Path::new(file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path.file_name().map_or_else(|| "mppt.log".into(), |n| n.to_owned());
        let rotation = cfg.and_then(|c| c.logging.rotation.as_deref()).unwrap_or("never");
        let appender = match rotation {
            "daily" => tracing_appender::rolling::daily(dir, name),
            "hourly" => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed()
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}

fn install_ctrlc() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
        tracing::warn!(error = %e, "failed to install Ctrl-C handler");
    }
    shutdown
}

fn dispatch(cli: &Cli, setup: &Setup) -> eyre::Result<()> {
    match &cli.cmd {
        Commands::Run {
            duration_ms,
            algorithm,
            target_mv,
            rt,
        } => {
            let shutdown = install_ctrlc();
            let summary = run::run_controller(
                setup,
                Duration::from_millis(*duration_ms),
                *algorithm,
                *target_mv,
                rt,
                &shutdown,
            )?;
            print_summary(&summary);
        }
        Commands::Sweep { csv, timeout_ms, rt } => {
            let shutdown = install_ctrlc();
            let points = run::run_sweep(setup, Duration::from_millis(*timeout_ms), rt, &shutdown)?;
            print_sweep(&points, *csv);
        }
        Commands::Config { action } => {
            let track_hz = setup.cfg.runtime.track_hz;
            let cfg = match action {
                ConfigAction::Show => run::config_show(setup)?,
                ConfigAction::Reset => run::config_reset(setup)?,
                ConfigAction::Set { param, value } => run::config_set(setup, param, value)?,
            };
            print_config(&cfg, track_hz);
        }
        Commands::SelfCheck => {
            let state = run::self_check(setup)?;
            let store = match state {
                StoreState::Empty => "empty (first run pending)",
                StoreState::Valid => "valid",
            };
            if json_mode() {
                println!("{}", serde_json::json!({ "ok": true, "store": store }));
            } else {
                println!("self-check ok: config valid, store {store}, front end answering");
            }
        }
    }
    Ok(())
}

fn print_summary(s: &RunSummary) {
    if json_mode() {
        println!("{}", s.to_json());
        return;
    }
    println!("run complete after {} ms ({})", s.elapsed_ms, s.algorithm);
    println!(
        "  vin {:.2} V  iin {:.3} A  vout {:.2} V  power {:.1} W",
        f64::from(s.vin_mv) / 1000.0,
        f64::from(s.iin_ma) / 1000.0,
        f64::from(s.vout_mv) / 1000.0,
        s.power_mw() as f64 / 1000.0
    );
    println!("  duty {}  status {:#05b}", s.duty, s.status);
    println!(
        "  control ticks {} (overruns {})  tracking ticks {}",
        s.control_ticks, s.control_overruns, s.track_ticks
    );
    if s.faults.is_empty() {
        println!("  faults: none");
    } else {
        let names: Vec<String> = s.faults.iter().map(ToString::to_string).collect();
        println!("  faults: {}", names.join(", "));
    }
}

fn power_mw(p: &IvPoint) -> i64 {
    i64::from(p.vin_mv) * i64::from(p.iin_ma) / 1000
}

fn print_sweep(points: &[IvPoint], csv: bool) {
    if json_mode() {
        let rows: Vec<_> = points
            .iter()
            .map(|p| serde_json::json!({ "vin_mv": p.vin_mv, "iin_ma": p.iin_ma, "power_mw": power_mw(p) }))
            .collect();
        println!("{}", serde_json::Value::Array(rows));
        return;
    }
    if csv {
        println!("vin_mv,iin_ma,power_mw");
        for p in points {
            println!("{},{},{}", p.vin_mv, p.iin_ma, power_mw(p));
        }
        return;
    }
    for p in points {
        println!("{:>8} mV {:>7} mA {:>9} mW", p.vin_mv, p.iin_ma, power_mw(p));
    }
    if let Some(best) = points.iter().max_by_key(|p| power_mw(p)) {
        println!(
            "{} points; maximum power {} mW at {} mV",
            points.len(),
            power_mw(best),
            best.vin_mv
        );
    }
}

fn print_config(cfg: &ControllerConfig, track_hz: u32) {
    if json_mode() {
        let mut obj = serde_json::Map::new();
        for p in ParamId::ALL {
            obj.insert(p.name().into(), run::param_value(cfg, p, track_hz).into());
        }
        obj.insert("algorithm_name".into(), cfg.algorithm.to_string().into());
        obj.insert("checksum".into(), cfg.checksum.into());
        obj.insert("checkxor".into(), cfg.checkxor.into());
        println!("{}", serde_json::Value::Object(obj));
        return;
    }
    for p in ParamId::ALL {
        let value = run::param_value(cfg, p, track_hz);
        if p == ParamId::Algorithm {
            println!("{:<20} = {value} ({})", p.name(), cfg.algorithm);
        } else {
            println!("{:<20} = {value}", p.name());
        }
    }
    println!(
        "{:<20} = {:#04x}/{:#04x}",
        "checksum/xor", cfg.checksum, cfg.checkxor
    );
}
