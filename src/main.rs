/*
 * This file is part of Drivefan.
 *
 * Copyright (C) 2025 Drivefan contributors
 *
 * Drivefan is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Drivefan is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Drivefan. If not, see <https://www.gnu.org/licenses/>.
 */

use std::process;
use std::time::Instant;

use anyhow::Context;
use serde_json::json;
use tracing::{error, info};

use drivefan::config::{self, Config, Invocation};
use drivefan::control::ControlLoop;
use drivefan::logger;
use drivefan::probe::SmartctlProbe;
use drivefan::superio::{DevPort, HardwareError, SuperIo};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status when the Super I/O chip is not the one we know how to drive.
const EXIT_WRONG_HARDWARE: i32 = 2;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match config::parse_args(&args) {
        Ok(Invocation::Run(cfg)) => cfg,
        Ok(Invocation::Help) => {
            print!("{}", config::usage());
            return;
        }
        Err(e) => {
            println!("Error: {}", e);
            print!("{}", config::usage());
            process::exit(1);
        }
    };

    init_tracing(cfg.debug);

    // Port I/O needs root
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("Error: drivefan requires root privileges to access the fan controller.");
        eprintln!("Please run with: sudo {}", std::env::args().next().unwrap_or_else(|| "drivefan".to_string()));
        process::exit(1);
    }

    if let Err(err) = run(&cfg) {
        error!("{:#}", err);
        logger::log_event("fatal_error", json!({ "error": format!("{:#}", err) }));
        let wrong_chip = matches!(
            err.downcast_ref::<HardwareError>(),
            Some(HardwareError::IdentityMismatch { .. })
        );
        process::exit(if wrong_chip { EXIT_WRONG_HARDWARE } else { 1 });
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let log_level = std::env::var("DRIVEFAN_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
}

fn run(cfg: &Config) -> anyhow::Result<()> {
    if let Some(path) = &cfg.journal {
        logger::init_journal(path).with_context(|| format!("opening journal {}", path.display()))?;
        logger::log_event("startup", json!({
            "version": VERSION,
            "drives": cfg.drives,
            "setpoint": cfg.setpoint,
            "overheat": cfg.overheat,
            "pwm_init": cfg.pwm_init,
            "pwm_min": cfg.pwm_min,
            "interval_s": cfg.interval.as_secs(),
            "kp": cfg.kp,
            "ki": cfg.ki,
            "imax": cfg.imax,
            "kd": cfg.kd,
        }));
    }
    info!("drivefan {} starting", VERSION);

    let port = DevPort::open().context("opening /dev/port")?;
    let ec = SuperIo::new(port)
        .initialize()
        .context("initializing IT8613E environment controller")?;
    logger::log_event("hardware_ready", json!({ "bar": ec.bar() }));

    let probe = SmartctlProbe::new(&cfg.smartctl);
    let mut control = ControlLoop::new(cfg, ec, probe, Instant::now());
    control.start().context("taking manual fan control")?;
    control.run().context("fan control loop")?;
    Ok(())
}
